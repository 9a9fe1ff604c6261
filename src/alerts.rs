//! Alert creation: geographic targeting, message templating, translation
//! fan-out, and handoff to the delivery queue.
//!
//! Creating an alert is a batch operation: one disaster, one target
//! radius, one alert row per user inside it. The base message is always
//! English; translated variants for every language spoken in the target
//! set are attached to each alert so the delivery worker can resolve the
//! recipient's preferred language without another service call.
//!
//! Targeting an area with nobody in it is a successful no-op, and a
//! single user's persistence failure never voids the rest of the batch.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};
use uuid::Uuid;

use crate::delivery::DeliveryQueue;
use crate::error::{AppError, Result};
use crate::model::{
    Alert, AlertType, DeliveryMethod, DeliveryStatus, DisasterEvent, DisasterStatus, GeoTarget,
    Severity, User,
};
use crate::realtime::Realtime;
use crate::storage::Storage;
use crate::translate::Translator;

/// Domain hint passed to the translation service.
const TRANSLATION_CONTEXT: &str = "Emergency disaster alert";

/// Alert creation and targeting.
#[derive(Clone)]
pub struct AlertService {
    storage: Storage,
    translator: Arc<dyn Translator>,
    queue: DeliveryQueue,
    realtime: Realtime,
}

impl AlertService {
    pub fn new(
        storage: Storage,
        translator: Arc<dyn Translator>,
        queue: DeliveryQueue,
        realtime: Realtime,
    ) -> Self {
        Self {
            storage,
            translator,
            queue,
            realtime,
        }
    }

    /// Create and queue alerts for every user inside the target area.
    ///
    /// The area is centered on the disaster; the radius comes from the
    /// target, falling back to the disaster's own radius. Returns the
    /// alerts that were actually persisted.
    pub async fn create_alert(&self, disaster_id: &str, target: &GeoTarget) -> Result<Vec<Alert>> {
        let disaster = self
            .storage
            .get_disaster(disaster_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("disaster not found: {disaster_id}")))?;

        let radius_km = target.radius.unwrap_or_else(|| disaster.radius_km());
        if radius_km <= 0.0 {
            return Err(AppError::Validation(
                "target radius must be positive".to_string(),
            ));
        }

        let users = self
            .storage
            .users_within(&disaster.location, radius_km)
            .await?;

        if users.is_empty() {
            info!(disaster_id, radius_km, "No users in target area");
            return Ok(Vec::new());
        }

        let message = alert_message(&disaster);
        let alert_type = determine_alert_type(&disaster);
        let translated = self.translations_for(&users, &message).await;

        let mut created = Vec::with_capacity(users.len());
        for user in &users {
            let alert = Alert {
                id: Uuid::new_v4().to_string(),
                disaster_id: Some(disaster.id.clone()),
                user_id: user.id.clone(),
                alert_type,
                message: message.clone(),
                translated_messages: translated.clone(),
                delivery_method: delivery_method_for(disaster.severity, user),
                delivery_status: DeliveryStatus::Pending,
                is_read: false,
                location: Some(disaster.location.clone()),
                created_at: chrono::Utc::now(),
                sent_at: None,
                delivered_at: None,
            };

            match self.storage.insert_alert(&alert).await {
                Ok(()) => created.push(alert),
                Err(e) => {
                    // Partial success: the rest of the batch still goes out.
                    warn!(user_id = %user.id, error = %e, "Alert persistence failed");
                }
            }
        }

        info!(
            disaster_id,
            targeted = users.len(),
            created = created.len(),
            alert_type = ?alert_type,
            "Alerts created"
        );

        self.queue.enqueue_batch(&created).await;

        // One grid-room fan-out for the whole batch, but every targeted
        // user hears on their direct channel regardless of delivery method.
        if let Some(first) = created.first() {
            self.realtime.broadcast_alert(&self.storage, first).await;
            for alert in created.iter().skip(1) {
                self.realtime.send_alert_to_user(&alert.user_id, alert).await;
            }
        }

        Ok(created)
    }

    /// Translate the base message into every non-English language the
    /// target users prefer. A failed translation falls back to the base
    /// message so nobody is left out.
    async fn translations_for(&self, users: &[User], message: &str) -> HashMap<String, String> {
        let mut languages: Vec<&str> = users
            .iter()
            .map(|u| u.preferred_language.as_str())
            .filter(|lang| *lang != "en" && !lang.is_empty())
            .collect();
        languages.sort_unstable();
        languages.dedup();

        let results = join_all(languages.iter().map(|lang| async move {
            let translated = self
                .translator
                .translate(message, lang, TRANSLATION_CONTEXT)
                .await;
            (*lang, translated)
        }))
        .await;

        let mut translated = HashMap::new();
        for (lang, result) in results {
            match result {
                Ok(text) => {
                    translated.insert(lang.to_string(), text);
                }
                Err(e) => {
                    warn!(lang, error = %e, "Translation failed, using base message");
                    translated.insert(lang.to_string(), message.to_string());
                }
            }
        }
        translated
    }
}

/// Severity-keyed message template. All-clear wording takes over once the
/// disaster is resolved.
fn alert_message(disaster: &DisasterEvent) -> String {
    if disaster.status == DisasterStatus::Resolved {
        return format!(
            "ALL CLEAR: The {} emergency has been resolved. Normal activities may resume.",
            disaster.title
        );
    }

    match disaster.severity {
        Severity::Critical => format!(
            "EMERGENCY ALERT: {}. EVACUATE IMMEDIATELY. {}",
            disaster.title, disaster.description
        ),
        Severity::High => format!(
            "URGENT WARNING: {}. Take immediate precautions. {}",
            disaster.title, disaster.description
        ),
        Severity::Medium => format!(
            "ALERT: {}. Stay alert and follow official guidance. {}",
            disaster.title, disaster.description
        ),
        Severity::Low => format!("Advisory: {}. {}", disaster.title, disaster.description),
    }
}

fn determine_alert_type(disaster: &DisasterEvent) -> AlertType {
    if disaster.status == DisasterStatus::Resolved {
        return AlertType::AllClear;
    }
    match disaster.severity {
        Severity::Critical => AlertType::Evacuation,
        Severity::High => AlertType::Warning,
        Severity::Medium | Severity::Low => AlertType::Update,
    }
}

/// Channel selection: the most urgent severities get the most intrusive
/// channel the user allows, everything else lands in the in-app inbox.
fn delivery_method_for(severity: Severity, user: &User) -> DeliveryMethod {
    match severity {
        Severity::Critical => {
            if user.preferences.sms && user.phone_number.is_some() {
                DeliveryMethod::Sms
            } else if user.preferences.push {
                DeliveryMethod::Push
            } else {
                DeliveryMethod::InApp
            }
        }
        Severity::High => {
            if user.preferences.push {
                DeliveryMethod::Push
            } else {
                DeliveryMethod::InApp
            }
        }
        Severity::Medium | Severity::Low => DeliveryMethod::InApp,
    }
}
