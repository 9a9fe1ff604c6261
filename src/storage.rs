//! SQLite storage layer.
//!
//! Entities are stored as JSON documents (TEXT columns) alongside the few
//! columns the engine filters on directly: disaster status, user role,
//! alert delivery status, SOS status. Geographic filtering happens in Rust
//! with a linear scan, which is acceptable at the target scale; the
//! real-time layer's grid sharding, not the database, is what keeps
//! fan-out cheap.
//!
//! SOS status transitions go through [`Storage::cas_transition`], a SQL
//! compare-and-set keyed on the current status, so a concurrent cancel and
//! assign for the same request can never both win.

use chrono::{TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::geo;
use crate::model::{
    Alert, DeliveryStatus, DisasterEvent, DisasterStatus, Location, Role, SosRequest, SosStatus,
    TimelineEvent, User,
};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:beacon.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                data TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS disasters (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                data TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                delivery_status TEXT NOT NULL,
                data TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sos_requests (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Append-only record of SOS lifecycle transitions.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sos_timeline (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sos_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                event TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sos_timeline_sos_id
            ON sos_timeline(sos_id, ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_alerts_delivery_status
            ON alerts(delivery_status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Insert or replace a user record.
    pub async fn upsert_user(&self, user: &User) -> anyhow::Result<()> {
        let data = serde_json::to_string(user)?;

        sqlx::query(
            r#"
            INSERT INTO users (id, role, data) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET role = excluded.role, data = excluded.data
            "#,
        )
        .bind(&user.id)
        .bind(user.role.as_str())
        .bind(&data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>> {
        let row = sqlx::query("SELECT data FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Ok(serde_json::from_str(r.get::<String, _>("data").as_str())?))
            .transpose()
    }

    /// Update a user's last known location.
    pub async fn update_user_location(&self, id: &str, location: &Location) -> anyhow::Result<()> {
        let mut user = self
            .get_user(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user not found: {id}"))?;
        user.location = Some(location.clone());
        self.upsert_user(&user).await
    }

    pub async fn list_users(&self) -> anyhow::Result<Vec<User>> {
        let rows = sqlx::query("SELECT data FROM users")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| Ok(serde_json::from_str(r.get::<String, _>("data").as_str())?))
            .collect()
    }

    /// Users with a known location within `radius_km` of `center`.
    pub async fn users_within(&self, center: &Location, radius_km: f64) -> anyhow::Result<Vec<User>> {
        let users = self.list_users().await?;
        Ok(users
            .into_iter()
            .filter(|u| match &u.location {
                Some(loc) => geo::distance_km(center, loc) <= radius_km,
                None => false,
            })
            .collect())
    }

    /// All verified responders (location filtering happens at the caller).
    pub async fn verified_responders(&self) -> anyhow::Result<Vec<User>> {
        let rows = sqlx::query("SELECT data FROM users WHERE role = ?")
            .bind(Role::Responder.as_str())
            .fetch_all(&self.pool)
            .await?;

        let responders: Vec<User> = rows
            .iter()
            .map(|r| serde_json::from_str(r.get::<String, _>("data").as_str()))
            .collect::<std::result::Result<_, _>>()?;

        Ok(responders.into_iter().filter(|u| u.is_verified).collect())
    }

    // ------------------------------------------------------------------
    // Disasters
    // ------------------------------------------------------------------

    /// Insert a disaster event, enforcing the positive-radius invariant.
    pub async fn insert_disaster(&self, disaster: &DisasterEvent) -> anyhow::Result<()> {
        if let Some(r) = disaster.location.radius {
            if !r.is_finite() || r <= 0.0 {
                anyhow::bail!("disaster radius must be positive: {r}");
            }
        }
        let data = serde_json::to_string(disaster)?;

        sqlx::query(
            r#"
            INSERT INTO disasters (id, status, data) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET status = excluded.status, data = excluded.data
            "#,
        )
        .bind(&disaster.id)
        .bind(disaster.status.as_str())
        .bind(&data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_disaster(&self, id: &str) -> anyhow::Result<Option<DisasterEvent>> {
        let row = sqlx::query("SELECT data FROM disasters WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Ok(serde_json::from_str(r.get::<String, _>("data").as_str())?))
            .transpose()
    }

    pub async fn list_active_disasters(&self) -> anyhow::Result<Vec<DisasterEvent>> {
        let rows = sqlx::query("SELECT data FROM disasters WHERE status = ?")
            .bind(DisasterStatus::Active.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| Ok(serde_json::from_str(r.get::<String, _>("data").as_str())?))
            .collect()
    }

    /// Active disasters whose center lies within `radius_km` of `location`.
    pub async fn active_disasters_within(
        &self,
        location: &Location,
        radius_km: f64,
    ) -> anyhow::Result<Vec<DisasterEvent>> {
        let disasters = self.list_active_disasters().await?;
        Ok(disasters
            .into_iter()
            .filter(|d| geo::distance_km(location, &d.location) <= radius_km)
            .collect())
    }

    /// Transition a disaster's status, returning the updated event.
    pub async fn update_disaster_status(
        &self,
        id: &str,
        status: DisasterStatus,
    ) -> anyhow::Result<Option<DisasterEvent>> {
        let Some(mut disaster) = self.get_disaster(id).await? else {
            return Ok(None);
        };
        disaster.status = status;
        if status == DisasterStatus::Resolved && disaster.ended_at.is_none() {
            disaster.ended_at = Some(Utc::now());
        }
        self.insert_disaster(&disaster).await?;
        Ok(Some(disaster))
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    pub async fn insert_alert(&self, alert: &Alert) -> anyhow::Result<()> {
        let data = serde_json::to_string(alert)?;

        sqlx::query(
            r#"
            INSERT INTO alerts (id, user_id, delivery_status, data) VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&alert.id)
        .bind(&alert.user_id)
        .bind(alert.delivery_status.as_str())
        .bind(&data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_alert(&self, id: &str) -> anyhow::Result<Option<Alert>> {
        let row = sqlx::query("SELECT data FROM alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Ok(serde_json::from_str(r.get::<String, _>("data").as_str())?))
            .transpose()
    }

    /// Record a delivery outcome on an alert.
    pub async fn set_alert_delivery(
        &self,
        id: &str,
        status: DeliveryStatus,
    ) -> anyhow::Result<()> {
        let Some(mut alert) = self.get_alert(id).await? else {
            anyhow::bail!("alert not found: {id}");
        };

        alert.delivery_status = status;
        let now = Utc::now();
        match status {
            DeliveryStatus::Sent => {
                alert.sent_at.get_or_insert(now);
            }
            DeliveryStatus::Delivered => {
                alert.sent_at.get_or_insert(now);
                alert.delivered_at = Some(now);
            }
            _ => {}
        }

        let data = serde_json::to_string(&alert)?;
        sqlx::query("UPDATE alerts SET delivery_status = ?, data = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(&data)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Alerts still awaiting delivery, for re-enqueueing at startup.
    pub async fn list_pending_alerts(&self) -> anyhow::Result<Vec<Alert>> {
        let rows = sqlx::query("SELECT data FROM alerts WHERE delivery_status = ?")
            .bind(DeliveryStatus::Pending.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| Ok(serde_json::from_str(r.get::<String, _>("data").as_str())?))
            .collect()
    }

    // ------------------------------------------------------------------
    // SOS requests
    // ------------------------------------------------------------------

    pub async fn insert_sos(&self, sos: &SosRequest) -> anyhow::Result<()> {
        let data = serde_json::to_string(sos)?;

        sqlx::query(
            r#"
            INSERT INTO sos_requests (id, user_id, status, data) VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&sos.id)
        .bind(&sos.user_id)
        .bind(sos.status.as_str())
        .bind(&data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_sos(&self, id: &str) -> anyhow::Result<Option<SosRequest>> {
        let row = sqlx::query("SELECT data FROM sos_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Ok(serde_json::from_str(r.get::<String, _>("data").as_str())?))
            .transpose()
    }

    /// Compare-and-set update of an SOS request.
    ///
    /// Writes `updated` only if the row's current status is one of
    /// `allowed_from`. Returns false when the guard fails, which means a
    /// concurrent transition won the race (or the caller's view was stale).
    pub async fn cas_transition(
        &self,
        updated: &SosRequest,
        allowed_from: &[SosStatus],
    ) -> anyhow::Result<bool> {
        let data = serde_json::to_string(updated)?;

        // SQLite has no array binds; the allowed set is at most three
        // states so the IN list is built from fixed placeholders.
        let placeholders = vec!["?"; allowed_from.len()].join(", ");
        let sql = format!(
            "UPDATE sos_requests SET status = ?, data = ? WHERE id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(updated.status.as_str())
            .bind(&data)
            .bind(&updated.id);
        for status in allowed_from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Append an event to an SOS request's timeline.
    pub async fn append_timeline(&self, sos_id: &str, event: &str) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO sos_timeline (sos_id, ts, event) VALUES (?, ?, ?)")
            .bind(sos_id)
            .bind(Utc::now().timestamp())
            .bind(event)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_timeline(&self, sos_id: &str) -> anyhow::Result<Vec<TimelineEvent>> {
        let rows = sqlx::query("SELECT ts, event FROM sos_timeline WHERE sos_id = ? ORDER BY id")
            .bind(sos_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|r| TimelineEvent {
                timestamp: Utc
                    .timestamp_opt(r.get::<i64, _>("ts"), 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                event: r.get("event"),
            })
            .collect())
    }
}
