//! Prioritized, retrying alert delivery queue.
//!
//! Jobs are keyed by alert id and drained by a small pool of worker
//! tasks, bounded so downstream push/SMS providers are not hammered.
//! Priority follows the alert type (evacuation first, all-clear last) and
//! is advisory across concurrent workers: the heap hands out the highest
//! priority job available, but two workers may finish out of order.
//!
//! Within a single job, attempts are strictly sequential: up to three
//! tries with exponential backoff starting at two seconds. A job that
//! exhausts its attempts is parked on the dead-letter list for manual
//! inspection and never retried again. A job whose alert has vanished is
//! dropped outright - there is nothing left to deliver.
//!
//! Channel senders are external collaborators behind [`ChannelSender`];
//! the queue's whole contract with them is "send or error".

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::model::{Alert, DeliveryMethod, DeliveryStatus};
use crate::realtime::Realtime;
use crate::storage::Storage;

/// A pluggable delivery channel (push provider, SMS gateway, email
/// transport, automated voice dialer).
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Deliver a rendered message to a recipient address. The recipient
    /// format is channel-specific: user id for push, phone number for
    /// SMS/voice, email address for email.
    async fn send(&self, recipient: &str, title: &str, body: &str) -> anyhow::Result<()>;
}

/// Sender that only logs, standing in for an unconfigured provider.
pub struct LogSender {
    channel: &'static str,
}

impl LogSender {
    pub fn new(channel: &'static str) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelSender for LogSender {
    async fn send(&self, recipient: &str, title: &str, body: &str) -> anyhow::Result<()> {
        info!(
            channel = self.channel,
            recipient, title, body, "Message sent"
        );
        Ok(())
    }
}

/// The full set of channel senders, shared across the queue and the SOS
/// notification paths.
#[derive(Clone)]
pub struct Senders {
    pub push: Arc<dyn ChannelSender>,
    pub sms: Arc<dyn ChannelSender>,
    pub email: Arc<dyn ChannelSender>,
    pub voice: Arc<dyn ChannelSender>,
}

impl Senders {
    /// Log-only senders for deployments without configured providers.
    pub fn logging() -> Self {
        Self {
            push: Arc::new(LogSender::new("push")),
            sms: Arc::new(LogSender::new("sms")),
            email: Arc::new(LogSender::new("email")),
            voice: Arc::new(LogSender::new("voice")),
        }
    }
}

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Concurrent worker tasks draining the queue.
    pub workers: usize,
    /// First retry delay; doubles on each subsequent attempt.
    pub base_backoff: Duration,
    /// Total attempts per job, including the first.
    pub max_attempts: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            base_backoff: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

/// A job that exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub alert_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub parked_at: DateTime<Utc>,
}

/// Heap entry. Ordered so the binary max-heap pops the lowest priority
/// number first, FIFO within equal priority.
#[derive(Debug, Eq, PartialEq)]
struct Job {
    priority: u8,
    seq: u64,
    alert_id: String,
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: Mutex<BinaryHeap<Job>>,
    notify: Notify,
    seq: AtomicU64,
    dead: Mutex<Vec<DeadLetter>>,
    storage: Storage,
    senders: Senders,
    realtime: Realtime,
    config: DeliveryConfig,
}

/// The delivery queue handle. Cheap to clone; workers run until the
/// process exits.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    /// Build the queue and spawn its worker pool.
    pub fn new(
        storage: Storage,
        senders: Senders,
        realtime: Realtime,
        config: DeliveryConfig,
    ) -> Self {
        let inner = Arc::new(QueueInner {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            dead: Mutex::new(Vec::new()),
            storage,
            senders,
            realtime,
            config,
        });

        for _ in 0..inner.config.workers {
            let worker_inner = Arc::clone(&inner);
            tokio::spawn(async move {
                loop {
                    if !Self::process_one(&worker_inner).await {
                        worker_inner.notify.notified().await;
                    }
                }
            });
        }

        Self { inner }
    }

    /// Queue an alert for delivery at its type's priority.
    pub async fn enqueue(&self, alert: &Alert) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let job = Job {
            priority: alert.alert_type.queue_priority(),
            seq,
            alert_id: alert.id.clone(),
        };

        self.inner.heap.lock().await.push(job);
        self.inner.notify.notify_one();
    }

    /// Queue a batch of alerts.
    pub async fn enqueue_batch(&self, alerts: &[Alert]) {
        for alert in alerts {
            self.enqueue(alert).await;
        }
        info!(count = alerts.len(), "Alerts queued for delivery");
    }

    /// Jobs parked after exhausting their retry budget.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead.lock().await.clone()
    }

    /// Pop and fully process the highest-priority job.
    ///
    /// Returns false when the queue was empty. Exposed for deterministic
    /// draining in tests; the worker pool calls this in a loop.
    pub async fn process_next(&self) -> bool {
        Self::process_one(&self.inner).await
    }

    async fn process_one(inner: &Arc<QueueInner>) -> bool {
        let job = { inner.heap.lock().await.pop() };
        let Some(job) = job else {
            return false;
        };

        Self::run_job(inner, job).await;
        true
    }

    /// Run a job to completion: sequential attempts with backoff, then
    /// dead-letter on exhaustion.
    async fn run_job(inner: &Arc<QueueInner>, job: Job) {
        let alert = match inner.storage.get_alert(&job.alert_id).await {
            Ok(Some(alert)) => alert,
            Ok(None) => {
                // Nothing to deliver; dropping is the only sane outcome.
                warn!(alert_id = %job.alert_id, "Alert missing, delivery job dropped");
                return;
            }
            Err(e) => {
                warn!(alert_id = %job.alert_id, error = %e, "Alert load failed, delivery job dropped");
                return;
            }
        };

        let mut last_error = String::new();
        for attempt in 1..=inner.config.max_attempts {
            match Self::dispatch(inner, &alert).await {
                Ok(()) => {
                    if let Err(e) = inner
                        .storage
                        .set_alert_delivery(&alert.id, DeliveryStatus::Delivered)
                        .await
                    {
                        warn!(alert_id = %alert.id, error = %e, "Delivered but status update failed");
                    }
                    info!(
                        alert_id = %alert.id,
                        method = ?alert.delivery_method,
                        attempt,
                        "Alert delivered"
                    );
                    return;
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        alert_id = %alert.id,
                        attempt,
                        error = %e,
                        "Alert delivery attempt failed"
                    );
                    if let Err(e) = inner
                        .storage
                        .set_alert_delivery(&alert.id, DeliveryStatus::Failed)
                        .await
                    {
                        warn!(alert_id = %alert.id, error = %e, "Failed-status update failed");
                    }

                    if attempt < inner.config.max_attempts {
                        let backoff = inner.config.base_backoff * 2u32.pow(attempt - 1);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        warn!(
            alert_id = %alert.id,
            attempts = inner.config.max_attempts,
            "Alert delivery exhausted retries, parked"
        );
        inner.dead.lock().await.push(DeadLetter {
            alert_id: alert.id.clone(),
            attempts: inner.config.max_attempts,
            last_error,
            parked_at: Utc::now(),
        });
    }

    /// One delivery attempt over the alert's configured channel.
    async fn dispatch(inner: &Arc<QueueInner>, alert: &Alert) -> anyhow::Result<()> {
        let user = inner
            .storage
            .get_user(&alert.user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user not found: {}", alert.user_id))?;

        // Preferred-language variant, falling back to the base message.
        let message = alert
            .translated_messages
            .get(&user.preferred_language)
            .unwrap_or(&alert.message);
        let title = title_for(alert);

        match alert.delivery_method {
            DeliveryMethod::Push => {
                inner.senders.push.send(&user.id, title, message).await?;
            }
            DeliveryMethod::Sms => {
                let phone = user
                    .phone_number
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("user {} has no phone number", user.id))?;
                inner.senders.sms.send(phone, title, message).await?;
            }
            DeliveryMethod::Email => {
                let email = user
                    .email
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("user {} has no email address", user.id))?;
                inner.senders.email.send(email, title, message).await?;
            }
            DeliveryMethod::InApp => {
                // The persisted alert row is the in-app inbox; nothing to
                // push, the client polls or listens on its room.
                info!(alert_id = %alert.id, "In-app alert ready");
            }
            DeliveryMethod::Websocket => {
                inner.realtime.send_alert_to_user(&user.id, alert).await;
            }
        }

        Ok(())
    }
}

fn title_for(alert: &Alert) -> &'static str {
    match alert.alert_type {
        crate::model::AlertType::Evacuation => "Evacuation Order",
        crate::model::AlertType::Warning => "Disaster Warning",
        crate::model::AlertType::Update => "Disaster Update",
        crate::model::AlertType::AllClear => "All Clear",
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSender;
    use super::*;
    use crate::model::{AlertType, Location, NotificationPreferences, Role, User};
    use std::collections::HashMap;

    fn test_user(id: &str) -> User {
        User {
            id: id.to_string(),
            name: id.to_string(),
            location: Some(Location {
                latitude: 34.05,
                longitude: -118.24,
                address: None,
                radius: None,
            }),
            role: Role::User,
            preferences: NotificationPreferences::default(),
            preferred_language: "en".to_string(),
            device_tokens: vec![],
            phone_number: Some("+15551234567".to_string()),
            email: Some("u@example.com".to_string()),
            is_verified: false,
            emergency_contacts: vec![],
        }
    }

    fn test_alert(id: &str, alert_type: AlertType, method: DeliveryMethod) -> Alert {
        Alert {
            id: id.to_string(),
            disaster_id: Some("d1".to_string()),
            user_id: "u1".to_string(),
            alert_type,
            message: "evacuate now".to_string(),
            translated_messages: HashMap::new(),
            delivery_method: method,
            delivery_status: DeliveryStatus::Pending,
            is_read: false,
            location: None,
            created_at: Utc::now(),
            sent_at: None,
            delivered_at: None,
        }
    }

    /// A queue with no background workers so tests drain deterministically.
    async fn manual_queue(senders: Senders) -> (DeliveryQueue, Storage) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        storage.upsert_user(&test_user("u1")).await.unwrap();
        let queue = DeliveryQueue::new(
            storage.clone(),
            senders,
            Realtime::new(),
            DeliveryConfig {
                workers: 0,
                base_backoff: Duration::from_millis(1),
                max_attempts: 3,
            },
        );
        (queue, storage)
    }

    #[tokio::test]
    async fn test_successful_push_delivery() {
        let push = Arc::new(RecordingSender::default());
        let senders = Senders {
            push: push.clone(),
            sms: Arc::new(RecordingSender::default()),
            email: Arc::new(RecordingSender::default()),
            voice: Arc::new(RecordingSender::default()),
        };
        let (queue, storage) = manual_queue(senders).await;

        let alert = test_alert("a1", AlertType::Warning, DeliveryMethod::Push);
        storage.insert_alert(&alert).await.unwrap();
        queue.enqueue(&alert).await;

        assert!(queue.process_next().await);
        assert!(!queue.process_next().await);

        assert_eq!(push.call_count().await, 1);
        let stored = storage.get_alert("a1").await.unwrap().unwrap();
        assert_eq!(stored.delivery_status, DeliveryStatus::Delivered);
        assert!(stored.delivered_at.is_some());
        assert!(queue.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_priority_evacuation_first() {
        let push = Arc::new(RecordingSender::default());
        let senders = Senders {
            push: push.clone(),
            sms: Arc::new(RecordingSender::default()),
            email: Arc::new(RecordingSender::default()),
            voice: Arc::new(RecordingSender::default()),
        };
        let (queue, storage) = manual_queue(senders).await;

        let update = test_alert("a-update", AlertType::Update, DeliveryMethod::Push);
        let evac = test_alert("a-evac", AlertType::Evacuation, DeliveryMethod::Push);
        storage.insert_alert(&update).await.unwrap();
        storage.insert_alert(&evac).await.unwrap();

        // Enqueued in the "wrong" order.
        queue.enqueue(&update).await;
        queue.enqueue(&evac).await;

        queue.process_next().await;
        let first_delivered = storage.get_alert("a-evac").await.unwrap().unwrap();
        assert_eq!(first_delivered.delivery_status, DeliveryStatus::Delivered);
        let still_pending = storage.get_alert("a-update").await.unwrap().unwrap();
        assert_eq!(still_pending.delivery_status, DeliveryStatus::Pending);

        queue.process_next().await;
    }

    #[tokio::test]
    async fn test_fifo_within_same_priority() {
        let push = Arc::new(RecordingSender::default());
        let senders = Senders {
            push: push.clone(),
            sms: Arc::new(RecordingSender::default()),
            email: Arc::new(RecordingSender::default()),
            voice: Arc::new(RecordingSender::default()),
        };
        let (queue, storage) = manual_queue(senders).await;

        let first = test_alert("a-first", AlertType::Warning, DeliveryMethod::Push);
        let second = test_alert("a-second", AlertType::Warning, DeliveryMethod::Push);
        storage.insert_alert(&first).await.unwrap();
        storage.insert_alert(&second).await.unwrap();
        queue.enqueue(&first).await;
        queue.enqueue(&second).await;

        queue.process_next().await;
        assert_eq!(
            storage
                .get_alert("a-first")
                .await
                .unwrap()
                .unwrap()
                .delivery_status,
            DeliveryStatus::Delivered
        );
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        // First attempt fails, second succeeds; status ends DELIVERED.
        let push = Arc::new(RecordingSender::failing(1));
        let senders = Senders {
            push: push.clone(),
            sms: Arc::new(RecordingSender::default()),
            email: Arc::new(RecordingSender::default()),
            voice: Arc::new(RecordingSender::default()),
        };
        let (queue, storage) = manual_queue(senders).await;

        let alert = test_alert("a1", AlertType::Warning, DeliveryMethod::Push);
        storage.insert_alert(&alert).await.unwrap();
        queue.enqueue(&alert).await;
        queue.process_next().await;

        assert_eq!(push.call_count().await, 2);
        let stored = storage.get_alert("a1").await.unwrap().unwrap();
        assert_eq!(stored.delivery_status, DeliveryStatus::Delivered);
        assert!(queue.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        // All attempts fail: exactly 3 tries, FAILED status, one dead letter.
        let push = Arc::new(RecordingSender::failing(99));
        let senders = Senders {
            push: push.clone(),
            sms: Arc::new(RecordingSender::default()),
            email: Arc::new(RecordingSender::default()),
            voice: Arc::new(RecordingSender::default()),
        };
        let (queue, storage) = manual_queue(senders).await;

        let alert = test_alert("a1", AlertType::Evacuation, DeliveryMethod::Push);
        storage.insert_alert(&alert).await.unwrap();
        queue.enqueue(&alert).await;
        queue.process_next().await;

        assert_eq!(push.call_count().await, 3);
        let stored = storage.get_alert("a1").await.unwrap().unwrap();
        assert_eq!(stored.delivery_status, DeliveryStatus::Failed);

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].alert_id, "a1");
        assert_eq!(dead[0].attempts, 3);

        // Nothing left in the queue: never a 4th attempt.
        assert!(!queue.process_next().await);
        assert_eq!(push.call_count().await, 3);
    }

    #[tokio::test]
    async fn test_missing_alert_dropped() {
        let senders = Senders::logging();
        let (queue, _storage) = manual_queue(senders).await;

        // Job references an alert that was never persisted.
        let ghost = test_alert("ghost", AlertType::Warning, DeliveryMethod::Push);
        queue.enqueue(&ghost).await;

        assert!(queue.process_next().await);
        // Dropped, not parked.
        assert!(queue.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_translated_message_resolution() {
        let sms = Arc::new(RecordingSender::default());
        let senders = Senders {
            push: Arc::new(RecordingSender::default()),
            sms: sms.clone(),
            email: Arc::new(RecordingSender::default()),
            voice: Arc::new(RecordingSender::default()),
        };
        let (queue, storage) = manual_queue(senders).await;

        let mut user = test_user("u1");
        user.preferred_language = "es".to_string();
        storage.upsert_user(&user).await.unwrap();

        let mut alert = test_alert("a1", AlertType::Evacuation, DeliveryMethod::Sms);
        alert
            .translated_messages
            .insert("es".to_string(), "evacuar ahora".to_string());
        storage.insert_alert(&alert).await.unwrap();

        queue.enqueue(&alert).await;
        queue.process_next().await;

        let calls = sms.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "+15551234567");
        assert_eq!(calls[0].1, "evacuar ahora");
    }

    #[tokio::test]
    async fn test_websocket_fallback_channel() {
        let senders = Senders::logging();
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        storage.upsert_user(&test_user("u1")).await.unwrap();
        let realtime = Realtime::new();
        let mut rx = realtime.join(&crate::geo::user_room("u1")).await;

        let queue = DeliveryQueue::new(
            storage.clone(),
            senders,
            realtime,
            DeliveryConfig {
                workers: 0,
                base_backoff: Duration::from_millis(1),
                max_attempts: 3,
            },
        );

        let alert = test_alert("a1", AlertType::Update, DeliveryMethod::Websocket);
        storage.insert_alert(&alert).await.unwrap();
        queue.enqueue(&alert).await;
        queue.process_next().await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "personal-alert");
        assert_eq!(
            storage
                .get_alert("a1")
                .await
                .unwrap()
                .unwrap()
                .delivery_status,
            DeliveryStatus::Delivered
        );
    }

    #[tokio::test]
    async fn test_background_workers_drain() {
        let push = Arc::new(RecordingSender::default());
        let senders = Senders {
            push: push.clone(),
            sms: Arc::new(RecordingSender::default()),
            email: Arc::new(RecordingSender::default()),
            voice: Arc::new(RecordingSender::default()),
        };
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        storage.upsert_user(&test_user("u1")).await.unwrap();
        let queue = DeliveryQueue::new(
            storage.clone(),
            senders,
            Realtime::new(),
            DeliveryConfig {
                workers: 2,
                base_backoff: Duration::from_millis(1),
                max_attempts: 3,
            },
        );

        for i in 0..5 {
            let alert = test_alert(&format!("a{i}"), AlertType::Warning, DeliveryMethod::Push);
            storage.insert_alert(&alert).await.unwrap();
            queue.enqueue(&alert).await;
        }

        // Give the workers a moment to drain.
        for _ in 0..50 {
            if push.call_count().await == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(push.call_count().await, 5);
    }
}
