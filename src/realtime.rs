//! Geo-sharded real-time broadcast router.
//!
//! Connected clients join named rooms: a coarse grid cell for their
//! location, a direct `user:{id}` channel, per-disaster rooms, and the
//! admin dashboard. Broadcasts target only the rooms a disaster's radius
//! can reach, so fan-out never scans every connected session.
//!
//! Delivery is fire-and-forget, at most once per connected session, with
//! no ordering guarantee across rooms. Lagging receivers drop events -
//! this layer is a best-effort notifier, not a transactional one.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::geo;
use crate::model::{Alert, Location, RiskAssessment, SosRequest};
use crate::risk::RiskEngine;
use crate::storage::Storage;

/// Room for the admin real-time dashboard.
pub const ADMIN_ROOM: &str = "admin-dashboard";

/// Per-room broadcast channel capacity. Slow consumers beyond this lag
/// and drop, they never block the sender.
const ROOM_CAPACITY: usize = 256;

/// An event pushed to connected clients.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeEvent {
    /// Event name (`disaster-alert`, `personal-alert`, `risk-assessment`,
    /// `sos-alert`, `disaster-update`).
    pub event: String,
    pub payload: serde_json::Value,
}

impl RealtimeEvent {
    pub fn new(event: &str, payload: serde_json::Value) -> Self {
        Self {
            event: event.to_string(),
            payload,
        }
    }
}

/// Active subscriptions for one connected session.
pub struct LocationSubscription {
    /// Events for the session's grid cell.
    pub cell: broadcast::Receiver<RealtimeEvent>,
    /// The session's direct per-user channel.
    pub personal: broadcast::Receiver<RealtimeEvent>,
    /// The grid-cell room key joined.
    pub room: String,
}

/// Room registry over tokio broadcast channels.
#[derive(Clone)]
pub struct Realtime {
    rooms: Arc<RwLock<HashMap<String, broadcast::Sender<RealtimeEvent>>>>,
}

impl Realtime {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Join a room, creating its channel on first use.
    pub async fn join(&self, room: &str) -> broadcast::Receiver<RealtimeEvent> {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .subscribe()
    }

    /// Emit to a room. A room nobody has joined is silently skipped.
    pub async fn emit(&self, room: &str, event: RealtimeEvent) {
        let rooms = self.rooms.read().await;
        if let Some(sender) = rooms.get(room) {
            // send only fails when there are no receivers; that is fine.
            let _ = sender.send(event);
        }
    }

    /// Subscribe a session to its location.
    ///
    /// Persists the user's new location, joins the grid-cell and personal
    /// rooms, and immediately pushes a fresh risk assessment. Membership
    /// is rejoined wholesale on each location update rather than diffed.
    pub async fn subscribe_location(
        &self,
        storage: &Storage,
        risk: &RiskEngine,
        user_id: &str,
        location: &Location,
    ) -> anyhow::Result<LocationSubscription> {
        storage.update_user_location(user_id, location).await?;

        let room = geo::location_room(location);
        let cell = self.join(&room).await;
        let personal = self.join(&geo::user_room(user_id)).await;

        info!(user_id, room = %room, "User subscribed to location");

        let assessment = risk.assess_user_risk(user_id).await;
        self.emit_risk_assessment(user_id, &assessment).await;

        Ok(LocationSubscription {
            cell,
            personal,
            room,
        })
    }

    /// Join the stream of updates for one disaster.
    pub async fn subscribe_disaster(
        &self,
        disaster_id: &str,
    ) -> broadcast::Receiver<RealtimeEvent> {
        self.join(&geo::disaster_room(disaster_id)).await
    }

    /// Push a risk assessment to a user's direct channel.
    pub async fn emit_risk_assessment(&self, user_id: &str, assessment: &RiskAssessment) {
        let payload = serde_json::to_value(assessment).unwrap_or_else(|_| json!({}));
        self.emit(
            &geo::user_room(user_id),
            RealtimeEvent::new("risk-assessment", payload),
        )
        .await;
    }

    /// Broadcast an alert to every grid cell its disaster can reach, plus
    /// the targeted user's direct channel.
    pub async fn broadcast_alert(&self, storage: &Storage, alert: &Alert) {
        if let Some(disaster_id) = &alert.disaster_id {
            match storage.get_disaster(disaster_id).await {
                Ok(Some(disaster)) => {
                    let radius = disaster.radius_km();
                    let rooms = geo::affected_rooms(&disaster.location, radius);

                    let payload = json!({
                        "id": alert.id,
                        "type": alert.alert_type,
                        "severity": disaster.severity,
                        "title": disaster.title,
                        "message": alert.message,
                        "location": disaster.location,
                        "timestamp": alert.sent_at,
                    });

                    for room in &rooms {
                        self.emit(room, RealtimeEvent::new("disaster-alert", payload.clone()))
                            .await;
                    }
                    info!(alert_id = %alert.id, rooms = rooms.len(), "Alert broadcast to grid rooms");
                }
                Ok(None) => {
                    warn!(disaster_id, "Disaster not found for alert broadcast");
                }
                Err(e) => {
                    warn!(disaster_id, error = %e, "Alert broadcast lookup failed");
                }
            }
        }

        let payload = serde_json::to_value(alert).unwrap_or_else(|_| json!({}));
        self.emit(
            &geo::user_room(&alert.user_id),
            RealtimeEvent::new("personal-alert", payload),
        )
        .await;
    }

    /// Deliver an alert over the user's direct channel only (the
    /// WEBSOCKET delivery method and the fallback channel).
    pub async fn send_alert_to_user(&self, user_id: &str, alert: &Alert) {
        let payload = serde_json::to_value(alert).unwrap_or_else(|_| json!({}));
        self.emit(
            &geo::user_room(user_id),
            RealtimeEvent::new("personal-alert", payload),
        )
        .await;
        info!(user_id, alert_id = %alert.id, "Alert sent over realtime channel");
    }

    /// Push an update to subscribers of one disaster.
    pub async fn broadcast_disaster_update(&self, disaster_id: &str, update: serde_json::Value) {
        self.emit(
            &geo::disaster_room(disaster_id),
            RealtimeEvent::new("disaster-update", update),
        )
        .await;
    }

    /// Notify the admin dashboard of a new SOS.
    pub async fn broadcast_sos_to_admins(&self, sos: &SosRequest) {
        let payload = json!({
            "id": sos.id,
            "type": sos.emergency_type,
            "severity": sos.severity,
            "location": sos.location,
            "timestamp": sos.created_at,
        });
        self.emit(ADMIN_ROOM, RealtimeEvent::new("sos-alert", payload))
            .await;
    }
}

impl Default for Realtime {
    fn default() -> Self {
        Self::new()
    }
}
