//! SOS lifecycle: creation, notification fan-out, assignment, status
//! transitions, and tracking.
//!
//! The lifecycle is PENDING -> DISPATCHED -> IN_PROGRESS -> RESOLVED,
//! with CANCELLED reachable from any non-terminal state. Every transition
//! goes through a storage compare-and-set keyed on the current status, so
//! two responders racing to claim the same request cannot both win -
//! the loser gets a conflict, never a silent overwrite.
//!
//! Creation persists first and fans notifications out afterwards; a
//! victim's request is never lost to a flaky push provider. The fan-out
//! branches (admin dashboard, nearby responders, emergency contacts,
//! automated voice call) run concurrently and fail independently.
//!
//! A request is never dispatched automatically: a human responder or
//! admin moves it out of PENDING.

use futures::future::join_all;
use tracing::{info, warn};

use crate::delivery::Senders;
use crate::error::{AppError, Result};
use crate::geo;
use crate::model::{
    AssignSosBody, CreateSosBody, ResponderInfo, Role, SosCreated, SosRequest, SosStatus,
    SosTracking, UpdateSosBody, User,
};
use crate::realtime::{Realtime, RealtimeEvent};
use crate::storage::Storage;

/// Responders beyond this distance are not notified.
const RESPONDER_RADIUS_KM: f64 = 10.0;

/// At most this many of the closest responders are pinged per SOS.
const MAX_NOTIFIED_RESPONDERS: usize = 5;

/// Assumed responder travel speed for ETA estimates, km per minute.
const RESPONDER_SPEED_KM_PER_MIN: f64 = 0.5;

/// Number dialed for automated emergency calls.
const EMERGENCY_NUMBER: &str = "911";

/// SOS request lifecycle service.
#[derive(Clone)]
pub struct SosService {
    storage: Storage,
    senders: Senders,
    realtime: Realtime,
    /// Place an automated voice call for each new request.
    auto_emergency_call: bool,
}

impl SosService {
    pub fn new(
        storage: Storage,
        senders: Senders,
        realtime: Realtime,
        auto_emergency_call: bool,
    ) -> Self {
        Self {
            storage,
            senders,
            realtime,
            auto_emergency_call,
        }
    }

    /// Create an SOS request.
    ///
    /// Persists the request and returns immediately; notification fan-out
    /// runs in a background task.
    pub async fn create(&self, user_id: &str, body: CreateSosBody) -> Result<SosCreated> {
        body.validate().map_err(AppError::Validation)?;

        if self.storage.get_user(user_id).await?.is_none() {
            return Err(AppError::NotFound(format!("user not found: {user_id}")));
        }

        let sos = SosRequest::new(
            user_id.to_string(),
            body.location,
            body.emergency_type,
            body.severity,
            body.description,
            body.media_urls,
        );

        self.storage.insert_sos(&sos).await?;
        self.storage
            .append_timeline(&sos.id, "SOS request created")
            .await?;

        warn!(
            sos_id = %sos.id,
            user_id,
            emergency_type = %sos.emergency_type,
            severity = ?sos.severity,
            "SOS ACTIVATED"
        );

        let service = self.clone();
        let spawned = sos.clone();
        tokio::spawn(async move {
            service.dispatch_notifications(&spawned).await;
        });

        Ok(SosCreated {
            sos_id: sos.id,
            status: SosStatus::Pending,
            estimated_response: "Awaiting dispatch".to_string(),
        })
    }

    /// Fan out notifications for a new SOS.
    ///
    /// Four independent branches run concurrently; each logs its own
    /// failures and none can sink the others.
    pub async fn dispatch_notifications(&self, sos: &SosRequest) {
        tokio::join!(
            self.notify_admins(sos),
            self.notify_nearby_responders(sos),
            self.notify_emergency_contacts(sos),
            self.notify_emergency_services(sos),
        );
    }

    async fn notify_admins(&self, sos: &SosRequest) {
        self.realtime.broadcast_sos_to_admins(sos).await;
        if let Err(e) = self
            .storage
            .append_timeline(&sos.id, "Admin dashboard alerted")
            .await
        {
            warn!(sos_id = %sos.id, error = %e, "Timeline append failed");
        }
    }

    async fn notify_nearby_responders(&self, sos: &SosRequest) {
        let responders = match self.find_nearby_responders(&sos.location).await {
            Ok(r) => r,
            Err(e) => {
                warn!(sos_id = %sos.id, error = %e, "Responder lookup failed");
                return;
            }
        };

        let notified = join_all(responders.iter().map(|(responder, distance_km)| {
            let body = format!(
                "{} emergency reported {:.1} km away. Severity: {:?}.",
                sos.emergency_type, distance_km, sos.severity
            );
            async move {
                match self
                    .senders
                    .push
                    .send(&responder.id, "SOS Alert Nearby", &body)
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            sos_id = %sos.id,
                            responder_id = %responder.id,
                            error = %e,
                            "Responder notification failed"
                        );
                        false
                    }
                }
            }
        }))
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count();

        if notified > 0 {
            let event = format!("Nearby responders notified ({notified})");
            if let Err(e) = self.storage.append_timeline(&sos.id, &event).await {
                warn!(sos_id = %sos.id, error = %e, "Timeline append failed");
            }
        }
    }

    async fn notify_emergency_contacts(&self, sos: &SosRequest) {
        let user = match self.storage.get_user(&sos.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => return,
            Err(e) => {
                warn!(sos_id = %sos.id, error = %e, "Requester lookup failed");
                return;
            }
        };

        if user.emergency_contacts.is_empty() {
            return;
        }

        let body = format!(
            "{} has sent an SOS: {} emergency. Last known location: {:.4}, {:.4}.",
            user.name, sos.emergency_type, sos.location.latitude, sos.location.longitude
        );

        for contact in &user.emergency_contacts {
            if let Some(phone) = &contact.phone {
                if let Err(e) = self.senders.sms.send(phone, "SOS Alert", &body).await {
                    warn!(sos_id = %sos.id, contact = %contact.name, error = %e, "Contact SMS failed");
                }
            }
            if let Some(contact_user_id) = &contact.user_id {
                if let Err(e) = self
                    .senders
                    .push
                    .send(contact_user_id, "SOS Alert", &body)
                    .await
                {
                    warn!(sos_id = %sos.id, contact = %contact.name, error = %e, "Contact push failed");
                }
            }
        }

        if let Err(e) = self
            .storage
            .append_timeline(&sos.id, "Emergency contacts notified")
            .await
        {
            warn!(sos_id = %sos.id, error = %e, "Timeline append failed");
        }
    }

    /// External emergency services branch. The notification is always
    /// recorded; the automated voice call additionally needs the env flag.
    async fn notify_emergency_services(&self, sos: &SosRequest) {
        warn!(
            sos_id = %sos.id,
            emergency_type = %sos.emergency_type,
            latitude = sos.location.latitude,
            longitude = sos.location.longitude,
            emergency_number = EMERGENCY_NUMBER,
            "Emergency services notified"
        );
        if let Err(e) = self
            .storage
            .append_timeline(&sos.id, "Emergency services notified")
            .await
        {
            warn!(sos_id = %sos.id, error = %e, "Timeline append failed");
        }

        if !self.auto_emergency_call {
            return;
        }

        let body = format!(
            "Automated emergency report: {} at {:.4}, {:.4}.",
            sos.emergency_type, sos.location.latitude, sos.location.longitude
        );

        match self
            .senders
            .voice
            .send(EMERGENCY_NUMBER, "Emergency Call", &body)
            .await
        {
            Ok(()) => {
                if let Err(e) = self
                    .storage
                    .append_timeline(&sos.id, "Automated emergency call placed")
                    .await
                {
                    warn!(sos_id = %sos.id, error = %e, "Timeline append failed");
                }
            }
            Err(e) => {
                warn!(sos_id = %sos.id, error = %e, "Automated emergency call failed");
            }
        }
    }

    /// The closest verified responders within range, nearest first.
    async fn find_nearby_responders(
        &self,
        location: &crate::model::Location,
    ) -> anyhow::Result<Vec<(User, f64)>> {
        let responders = self.storage.verified_responders().await?;

        let mut nearby: Vec<(User, f64)> = responders
            .into_iter()
            .filter_map(|r| {
                let loc = r.location.as_ref()?;
                let distance = geo::distance_km(location, loc);
                (distance <= RESPONDER_RADIUS_KM).then_some((r, distance))
            })
            .collect();

        nearby.sort_by(|a, b| a.1.total_cmp(&b.1));
        nearby.truncate(MAX_NOTIFIED_RESPONDERS);
        Ok(nearby)
    }

    /// Assign a responder to a request.
    ///
    /// Only responders and admins may assign. Exactly one concurrent
    /// assignment wins; everyone else gets a conflict.
    pub async fn assign(
        &self,
        sos_id: &str,
        caller: &User,
        body: AssignSosBody,
    ) -> Result<SosRequest> {
        if !matches!(caller.role, Role::Responder | Role::Admin) {
            return Err(AppError::Forbidden(
                "only responders can accept SOS requests".to_string(),
            ));
        }

        let sos = self
            .storage
            .get_sos(sos_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("SOS request not found: {sos_id}")))?;

        if sos.status.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "SOS request is already {}",
                sos.status.as_str()
            )));
        }

        let responder_id = body.responder_id.unwrap_or_else(|| caller.id.clone());

        let mut updated = sos;
        updated.status = SosStatus::InProgress;
        updated.responder_assigned = Some(responder_id.clone());

        let won = self
            .storage
            .cas_transition(&updated, &[SosStatus::Pending, SosStatus::Dispatched])
            .await?;
        if !won {
            return Err(AppError::InvalidTransition(
                "SOS request was already taken".to_string(),
            ));
        }

        let event = format!("Responder {responder_id} assigned");
        self.storage.append_timeline(sos_id, &event).await?;
        self.emit_status(&updated).await;

        // Notification is best-effort and never delays the caller.
        let service = self.clone();
        let assigned = updated.clone();
        let notify_responder = responder_id.clone();
        tokio::spawn(async move {
            service
                .notify_assignment(&assigned, &notify_responder)
                .await;
        });

        info!(sos_id, responder_id = %responder_id, "SOS request assigned");
        Ok(updated)
    }

    /// Tell the requester help is coming (with an ETA when the responder
    /// has a known location) and give the responder the request details.
    async fn notify_assignment(&self, sos: &SosRequest, responder_id: &str) {
        let eta = match self.storage.get_user(responder_id).await {
            Ok(Some(responder)) => responder
                .location
                .as_ref()
                .map(|loc| eta_minutes(geo::distance_km(loc, &sos.location))),
            Ok(None) => None,
            Err(e) => {
                warn!(sos_id = %sos.id, error = %e, "Responder lookup failed");
                None
            }
        };

        let requester_body = match eta {
            Some(minutes) => format!("A responder is on the way. ETA ~{minutes} min."),
            None => "A responder has been assigned to your SOS.".to_string(),
        };
        if let Err(e) = self
            .senders
            .push
            .send(&sos.user_id, "Responder Assigned", &requester_body)
            .await
        {
            warn!(sos_id = %sos.id, error = %e, "Requester notification failed");
        }

        let responder_body = format!(
            "{} emergency at {:.4}, {:.4}. {}",
            sos.emergency_type, sos.location.latitude, sos.location.longitude, sos.description
        );
        if let Err(e) = self
            .senders
            .push
            .send(responder_id, "SOS Assignment", &responder_body)
            .await
        {
            warn!(sos_id = %sos.id, error = %e, "Responder notification failed");
        }
    }

    /// Apply a status transition requested by the assigned responder or
    /// an admin.
    pub async fn update_status(
        &self,
        sos_id: &str,
        caller: &User,
        body: UpdateSosBody,
    ) -> Result<SosRequest> {
        let sos = self
            .storage
            .get_sos(sos_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("SOS request not found: {sos_id}")))?;

        let is_requester = sos.user_id == caller.id;
        let is_assigned = sos.responder_assigned.as_deref() == Some(caller.id.as_str());
        if !is_requester && !is_assigned && caller.role != Role::Admin {
            return Err(AppError::Forbidden(
                "only the requester or assigned responder can update this request".to_string(),
            ));
        }

        if !transition_allowed(sos.status, body.status) {
            return Err(AppError::InvalidTransition(format!(
                "cannot move SOS from {} to {}",
                sos.status.as_str(),
                body.status.as_str()
            )));
        }

        let from = sos.status;
        let mut updated = sos;
        updated.status = body.status;
        if let Some(notes) = body.notes {
            updated.responder_notes = Some(notes);
        }
        if body.status == SosStatus::Resolved {
            updated.resolved_at = Some(chrono::Utc::now());
        }

        let won = self.storage.cas_transition(&updated, &[from]).await?;
        if !won {
            return Err(AppError::InvalidTransition(
                "SOS request changed concurrently".to_string(),
            ));
        }

        let event = format!("Status changed to {}", body.status.as_str());
        self.storage.append_timeline(sos_id, &event).await?;
        self.emit_status(&updated).await;

        // Both parties hear about the change, off the caller's path.
        let service = self.clone();
        let changed = updated.clone();
        tokio::spawn(async move {
            let status_body = format!("SOS status is now {}.", changed.status.as_str());
            if let Err(e) = service
                .senders
                .push
                .send(&changed.user_id, "SOS Update", &status_body)
                .await
            {
                warn!(sos_id = %changed.id, error = %e, "Requester notification failed");
            }
            if let Some(responder_id) = &changed.responder_assigned {
                if let Err(e) = service
                    .senders
                    .push
                    .send(responder_id, "SOS Update", &status_body)
                    .await
                {
                    warn!(sos_id = %changed.id, error = %e, "Responder notification failed");
                }
            }
        });

        info!(sos_id, status = body.status.as_str(), "SOS status updated");
        Ok(updated)
    }

    /// Cancel a request. Only the requester may cancel, and only before
    /// it reaches a terminal state.
    pub async fn cancel(&self, sos_id: &str, caller_id: &str) -> Result<SosRequest> {
        let sos = self
            .storage
            .get_sos(sos_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("SOS request not found: {sos_id}")))?;

        if sos.user_id != caller_id {
            return Err(AppError::Forbidden(
                "only the requester can cancel an SOS request".to_string(),
            ));
        }

        if sos.status.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "SOS request is already {}",
                sos.status.as_str()
            )));
        }

        let from = sos.status;
        let mut updated = sos;
        updated.status = SosStatus::Cancelled;
        updated.responder_notes = Some("Cancelled by user".to_string());

        let won = self.storage.cas_transition(&updated, &[from]).await?;
        if !won {
            return Err(AppError::InvalidTransition(
                "SOS request changed concurrently".to_string(),
            ));
        }

        self.storage
            .append_timeline(sos_id, "Cancelled by requester")
            .await?;
        self.emit_status(&updated).await;

        info!(sos_id, "SOS request cancelled");
        Ok(updated)
    }

    /// Tracking view: status, responder details with an ETA estimate, and
    /// the recorded timeline.
    pub async fn tracking(&self, sos_id: &str, caller: &User) -> Result<SosTracking> {
        let sos = self
            .storage
            .get_sos(sos_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("SOS request not found: {sos_id}")))?;

        let is_requester = sos.user_id == caller.id;
        let is_assigned = sos.responder_assigned.as_deref() == Some(caller.id.as_str());
        if !is_requester && !is_assigned && caller.role != Role::Admin {
            return Err(AppError::Forbidden(
                "not authorized to view this SOS request".to_string(),
            ));
        }

        let responder = match &sos.responder_assigned {
            Some(responder_id) => match self.storage.get_user(responder_id).await? {
                Some(responder) => {
                    let eta_minutes = responder
                        .location
                        .as_ref()
                        .map(|loc| eta_minutes(geo::distance_km(loc, &sos.location)));
                    Some(ResponderInfo {
                        name: responder.name,
                        phone: responder.phone_number,
                        eta_minutes,
                    })
                }
                None => None,
            },
            None => None,
        };

        let timeline = self.storage.get_timeline(sos_id).await?;

        Ok(SosTracking {
            id: sos.id,
            status: sos.status,
            emergency_type: sos.emergency_type,
            severity: sos.severity,
            description: sos.description,
            location: sos.location,
            created_at: sos.created_at,
            responder,
            responder_notes: sos.responder_notes,
            timeline,
        })
    }

    async fn emit_status(&self, sos: &SosRequest) {
        let payload = serde_json::json!({
            "sos_id": sos.id,
            "status": sos.status,
            "responder_assigned": sos.responder_assigned,
        });
        self.realtime
            .emit(
                &geo::user_room(&sos.user_id),
                RealtimeEvent::new("sos-update", payload),
            )
            .await;
    }
}

/// The legal status transitions.
fn transition_allowed(from: SosStatus, to: SosStatus) -> bool {
    use SosStatus::*;
    matches!(
        (from, to),
        (Pending, Dispatched)
            | (Pending, InProgress)
            | (Pending, Cancelled)
            | (Dispatched, InProgress)
            | (Dispatched, Cancelled)
            | (InProgress, Resolved)
            | (InProgress, Cancelled)
    )
}

/// Minutes to cover `distance_km` at the assumed responder speed,
/// rounded up.
fn eta_minutes(distance_km: f64) -> i64 {
    (distance_km / RESPONDER_SPEED_KM_PER_MIN).ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::RecordingSender;
    use crate::delivery::ChannelSender;
    use crate::model::{
        EmergencyContact, EmergencyType, Location, NotificationPreferences, Severity,
    };
    use std::sync::Arc;

    fn loc(lat: f64, lon: f64) -> Location {
        Location {
            latitude: lat,
            longitude: lon,
            address: None,
            radius: None,
        }
    }

    fn test_user(id: &str, role: Role, location: Option<Location>) -> User {
        User {
            id: id.to_string(),
            name: id.to_string(),
            location,
            role,
            preferences: NotificationPreferences::default(),
            preferred_language: "en".to_string(),
            device_tokens: vec![],
            phone_number: Some("+15550002222".to_string()),
            email: None,
            is_verified: role == Role::Responder,
            emergency_contacts: vec![],
        }
    }

    fn sos_body(severity: Severity) -> CreateSosBody {
        CreateSosBody {
            location: loc(34.05, -118.24),
            emergency_type: EmergencyType::Trapped,
            description: "under debris".to_string(),
            severity,
            media_urls: vec![],
        }
    }

    struct Fixture {
        service: SosService,
        storage: Storage,
        push: Arc<RecordingSender>,
        sms: Arc<RecordingSender>,
        voice: Arc<RecordingSender>,
    }

    async fn fixture(auto_call: bool) -> Fixture {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let push = Arc::new(RecordingSender::default());
        let sms = Arc::new(RecordingSender::default());
        let voice = Arc::new(RecordingSender::default());
        let senders = Senders {
            push: push.clone() as Arc<dyn ChannelSender>,
            sms: sms.clone() as Arc<dyn ChannelSender>,
            email: Arc::new(RecordingSender::default()),
            voice: voice.clone() as Arc<dyn ChannelSender>,
        };
        let service = SosService::new(storage.clone(), senders, Realtime::new(), auto_call);
        Fixture {
            service,
            storage,
            push,
            sms,
            voice,
        }
    }

    #[tokio::test]
    async fn test_create_is_pending_and_persisted() {
        let fx = fixture(false).await;
        fx.storage
            .upsert_user(&test_user("u1", Role::User, None))
            .await
            .unwrap();

        let created = fx.service.create("u1", sos_body(Severity::High)).await.unwrap();
        assert_eq!(created.status, SosStatus::Pending);

        let stored = fx.storage.get_sos(&created.sos_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SosStatus::Pending);
        assert_eq!(stored.user_id, "u1");
        assert!(stored.responder_assigned.is_none());

        let timeline = fx.storage.get_timeline(&created.sos_id).await.unwrap();
        assert_eq!(timeline[0].event, "SOS request created");
    }

    #[tokio::test]
    async fn test_create_rejects_long_description() {
        let fx = fixture(false).await;
        let mut body = sos_body(Severity::High);
        body.description = "x".repeat(501);
        let err = fx.service.create("u1", body).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_unknown_user_rejected() {
        let fx = fixture(false).await;
        let err = fx
            .service
            .create("ghost", sos_body(Severity::High))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fanout_notifies_nearby_responders_only() {
        let fx = fixture(false).await;
        fx.storage
            .upsert_user(&test_user("u1", Role::User, None))
            .await
            .unwrap();
        // ~2 km away: notified. ~500 km away: not.
        fx.storage
            .upsert_user(&test_user("r-near", Role::Responder, Some(loc(34.06, -118.25))))
            .await
            .unwrap();
        fx.storage
            .upsert_user(&test_user("r-far", Role::Responder, Some(loc(38.0, -122.0))))
            .await
            .unwrap();
        // Unverified responders are never matched.
        let mut unverified = test_user("r-unverified", Role::Responder, Some(loc(34.05, -118.24)));
        unverified.is_verified = false;
        fx.storage.upsert_user(&unverified).await.unwrap();

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Medical,
            Severity::High,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();
        fx.service.dispatch_notifications(&sos).await;

        let calls = fx.push.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "r-near");
    }

    #[tokio::test]
    async fn test_fanout_caps_at_five_responders() {
        let fx = fixture(false).await;
        fx.storage
            .upsert_user(&test_user("u1", Role::User, None))
            .await
            .unwrap();
        for i in 0..8 {
            // Spread within ~5 km of the SOS.
            let offset = 0.005 * f64::from(i);
            fx.storage
                .upsert_user(&test_user(
                    &format!("r{i}"),
                    Role::Responder,
                    Some(loc(34.05 + offset, -118.24)),
                ))
                .await
                .unwrap();
        }

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Fire,
            Severity::Critical,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();
        fx.service.dispatch_notifications(&sos).await;

        assert_eq!(fx.push.call_count().await, 5);
        // Closest responder is among the notified set.
        let calls = fx.push.calls.lock().await;
        assert!(calls.iter().any(|(id, _)| id == "r0"));
    }

    #[tokio::test]
    async fn test_fanout_notifies_emergency_contacts() {
        let fx = fixture(false).await;
        let mut requester = test_user("u1", Role::User, None);
        requester.emergency_contacts = vec![EmergencyContact {
            name: "Ana".to_string(),
            phone: Some("+15559998888".to_string()),
            user_id: Some("u-ana".to_string()),
        }];
        fx.storage.upsert_user(&requester).await.unwrap();

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Injury,
            Severity::Medium,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();
        fx.service.dispatch_notifications(&sos).await;

        let sms_calls = fx.sms.calls.lock().await;
        assert_eq!(sms_calls.len(), 1);
        assert_eq!(sms_calls[0].0, "+15559998888");
        assert!(sms_calls[0].1.contains("u1 has sent an SOS"));

        // Registered contact also gets a push.
        let push_calls = fx.push.calls.lock().await;
        assert!(push_calls.iter().any(|(id, _)| id == "u-ana"));
    }

    #[tokio::test]
    async fn test_emergency_services_recorded_even_without_auto_call() {
        let fx = fixture(false).await;
        fx.storage
            .upsert_user(&test_user("u1", Role::User, None))
            .await
            .unwrap();

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Medical,
            Severity::Medium,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();
        fx.service.dispatch_notifications(&sos).await;

        assert_eq!(fx.voice.call_count().await, 0);
        let timeline = fx.storage.get_timeline(&sos.id).await.unwrap();
        assert!(timeline
            .iter()
            .any(|e| e.event == "Emergency services notified"));
    }

    #[tokio::test]
    async fn test_emergency_call_placed_for_any_severity_when_enabled() {
        let fx = fixture(true).await;
        fx.storage
            .upsert_user(&test_user("u1", Role::User, None))
            .await
            .unwrap();

        let medium = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Medical,
            Severity::Medium,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&medium).await.unwrap();
        fx.service.dispatch_notifications(&medium).await;

        assert_eq!(fx.voice.call_count().await, 1);
        let calls = fx.voice.calls.lock().await;
        assert_eq!(calls[0].0, "911");

        let timeline = fx.storage.get_timeline(&medium.id).await.unwrap();
        assert!(timeline
            .iter()
            .any(|e| e.event == "Automated emergency call placed"));
    }

    #[tokio::test]
    async fn test_assign_moves_to_in_progress() {
        let fx = fixture(false).await;
        let responder = test_user("r1", Role::Responder, Some(loc(34.06, -118.25)));
        fx.storage.upsert_user(&responder).await.unwrap();

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Trapped,
            Severity::High,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();

        let updated = fx
            .service
            .assign(&sos.id, &responder, AssignSosBody::default())
            .await
            .unwrap();
        assert_eq!(updated.status, SosStatus::InProgress);
        assert_eq!(updated.responder_assigned.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_second_assign_is_rejected() {
        let fx = fixture(false).await;
        let first = test_user("r1", Role::Responder, None);
        let second = test_user("r2", Role::Responder, None);
        fx.storage.upsert_user(&first).await.unwrap();
        fx.storage.upsert_user(&second).await.unwrap();

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Trapped,
            Severity::High,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();

        fx.service
            .assign(&sos.id, &first, AssignSosBody::default())
            .await
            .unwrap();
        let err = fx
            .service
            .assign(&sos.id, &second, AssignSosBody::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        // First responder keeps the request.
        let stored = fx.storage.get_sos(&sos.id).await.unwrap().unwrap();
        assert_eq!(stored.responder_assigned.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_plain_user_cannot_assign() {
        let fx = fixture(false).await;
        let civilian = test_user("u2", Role::User, None);

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Trapped,
            Severity::High,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();

        let err = fx
            .service
            .assign(&sos.id, &civilian, AssignSosBody::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_resolve_stamps_resolved_at() {
        let fx = fixture(false).await;
        let responder = test_user("r1", Role::Responder, None);
        fx.storage.upsert_user(&responder).await.unwrap();

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Medical,
            Severity::High,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();
        fx.service
            .assign(&sos.id, &responder, AssignSosBody::default())
            .await
            .unwrap();

        let resolved = fx
            .service
            .update_status(
                &sos.id,
                &responder,
                UpdateSosBody {
                    status: SosStatus::Resolved,
                    notes: Some("patient stabilized".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(resolved.status, SosStatus::Resolved);
        assert!(resolved.resolved_at.is_some());
        assert_eq!(resolved.responder_notes.as_deref(), Some("patient stabilized"));
    }

    #[tokio::test]
    async fn test_unassigned_responder_cannot_update() {
        let fx = fixture(false).await;
        let assigned = test_user("r1", Role::Responder, None);
        let other = test_user("r2", Role::Responder, None);
        fx.storage.upsert_user(&assigned).await.unwrap();
        fx.storage.upsert_user(&other).await.unwrap();

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Medical,
            Severity::High,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();
        fx.service
            .assign(&sos.id, &assigned, AssignSosBody::default())
            .await
            .unwrap();

        let err = fx
            .service
            .update_status(
                &sos.id,
                &other,
                UpdateSosBody {
                    status: SosStatus::Resolved,
                    notes: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_admin_can_update_without_assignment() {
        let fx = fixture(false).await;
        let admin = test_user("a1", Role::Admin, None);
        fx.storage.upsert_user(&admin).await.unwrap();

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Fire,
            Severity::High,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();

        let updated = fx
            .service
            .update_status(
                &sos.id,
                &admin,
                UpdateSosBody {
                    status: SosStatus::Dispatched,
                    notes: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, SosStatus::Dispatched);
    }

    #[tokio::test]
    async fn test_terminal_state_rejects_transitions() {
        let fx = fixture(false).await;
        let admin = test_user("a1", Role::Admin, None);

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Other,
            Severity::Low,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();
        fx.service.cancel(&sos.id, "u1").await.unwrap();

        let err = fx
            .service
            .update_status(
                &sos.id,
                &admin,
                UpdateSosBody {
                    status: SosStatus::InProgress,
                    notes: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_cancel_is_requester_only() {
        let fx = fixture(false).await;

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Other,
            Severity::Low,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();

        let err = fx.service.cancel(&sos.id, "someone-else").await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let cancelled = fx.service.cancel(&sos.id, "u1").await.unwrap();
        assert_eq!(cancelled.status, SosStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_tracking_includes_eta_and_timeline() {
        let fx = fixture(false).await;
        // Responder ~5.5 km away: ETA = ceil(5.5 / 0.5) = 11-12 minutes.
        let responder = test_user("r1", Role::Responder, Some(loc(34.05, -118.30)));
        fx.storage.upsert_user(&responder).await.unwrap();
        let requester = test_user("u1", Role::User, None);
        fx.storage.upsert_user(&requester).await.unwrap();

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Trapped,
            Severity::High,
            "under debris".to_string(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();
        fx.storage
            .append_timeline(&sos.id, "SOS request created")
            .await
            .unwrap();
        fx.service
            .assign(&sos.id, &responder, AssignSosBody::default())
            .await
            .unwrap();

        let tracking = fx.service.tracking(&sos.id, &requester).await.unwrap();
        assert_eq!(tracking.status, SosStatus::InProgress);
        let info = tracking.responder.unwrap();
        assert_eq!(info.name, "r1");
        let eta = info.eta_minutes.unwrap();
        assert!((10..=13).contains(&eta), "eta was {eta}");
        assert!(tracking
            .timeline
            .iter()
            .any(|e| e.event == "SOS request created"));
    }

    #[tokio::test]
    async fn test_tracking_denied_to_strangers() {
        let fx = fixture(false).await;
        let stranger = test_user("u2", Role::User, None);

        let sos = SosRequest::new(
            "u1".to_string(),
            loc(34.05, -118.24),
            EmergencyType::Trapped,
            Severity::High,
            String::new(),
            vec![],
        );
        fx.storage.insert_sos(&sos).await.unwrap();

        let err = fx.service.tracking(&sos.id, &stranger).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[test]
    fn test_transition_table() {
        use SosStatus::*;
        assert!(transition_allowed(Pending, Dispatched));
        assert!(transition_allowed(Dispatched, InProgress));
        assert!(transition_allowed(InProgress, Resolved));
        assert!(transition_allowed(Pending, Cancelled));
        assert!(!transition_allowed(Resolved, InProgress));
        assert!(!transition_allowed(Cancelled, Pending));
        assert!(!transition_allowed(InProgress, Pending));
        assert!(!transition_allowed(Pending, Resolved));
    }
}
