//! Domain types for Beacon.
//!
//! Everything the engine reasons about lives here: geographic locations,
//! disaster events, danger zones, alerts, SOS requests and the users they
//! belong to. Payloads that arrive as loose JSON in upstream feeds are
//! represented as explicit tagged structs with validated constructors so
//! malformed input is rejected at the system boundary instead of flowing
//! through the core as untyped blobs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default radius in kilometers applied when a disaster does not carry one.
pub const DEFAULT_DISASTER_RADIUS_KM: f64 = 50.0;

/// A geographic point, optionally with a human-readable address and a
/// radius of effect.
///
/// Immutable value type. Latitude and longitude are validated at the
/// system boundary via [`Location::validate`]; the geo math assumes
/// finite, in-range coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Radius of effect in kilometers, when this location describes an area.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
}

impl Location {
    /// Check that coordinates are finite and within range.
    ///
    /// Latitude must be in [-90, 90], longitude in [-180, 180], and a
    /// radius, if present, must be positive.
    pub fn validate(&self) -> Result<(), String> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(format!("latitude out of range: {}", self.latitude));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(format!("longitude out of range: {}", self.longitude));
        }
        if let Some(r) = self.radius {
            if !r.is_finite() || r <= 0.0 {
                return Err(format!("radius must be positive: {r}"));
            }
        }
        Ok(())
    }

    /// The radius to use for area computations, falling back to `default_km`.
    pub fn effective_radius(&self, default_km: f64) -> f64 {
        self.radius.unwrap_or(default_km)
    }
}

/// Severity scale shared by disasters and SOS requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Base risk contribution before distance decay (0-100 scale).
    pub fn base_score(self) -> f64 {
        match self {
            Severity::Low => 20.0,
            Severity::Medium => 50.0,
            Severity::High => 75.0,
            Severity::Critical => 100.0,
        }
    }
}

/// Lifecycle status of a disaster event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisasterStatus {
    Active,
    Monitoring,
    Resolved,
}

impl DisasterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DisasterStatus::Active => "ACTIVE",
            DisasterStatus::Monitoring => "MONITORING",
            DisasterStatus::Resolved => "RESOLVED",
        }
    }
}

/// A disaster event ingested from an external feed.
///
/// Read-only from this engine's perspective apart from status transitions,
/// which trigger zone regeneration and user re-assessment. Only `ACTIVE`
/// disasters participate in risk and zone computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisasterEvent {
    pub id: String,
    /// Free-form disaster type from the feed ("WILDFIRE", "FLOOD", ...).
    pub event_type: String,
    pub severity: Severity,
    pub status: DisasterStatus,
    /// Center of effect. `location.radius` is the disaster radius in km.
    pub location: Location,
    pub title: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl DisasterEvent {
    /// Radius of effect in km, defaulting to 50 when the feed omits one.
    pub fn radius_km(&self) -> f64 {
        self.location.effective_radius(DEFAULT_DISASTER_RADIUS_KM)
    }
}

/// Role of a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Responder,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Responder => "RESPONDER",
            Role::Admin => "ADMIN",
        }
    }
}

/// Per-channel notification opt-ins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreferences {
    #[serde(default = "default_true")]
    pub push: bool,
    #[serde(default = "default_true")]
    pub sms: bool,
    #[serde(default = "default_true")]
    pub email: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            push: true,
            sms: true,
            email: true,
        }
    }
}

/// A contact to notify when the user triggers an SOS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Set when the contact is also a registered user (gets push too).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// The risk-relevant subset of a user account.
///
/// Account lifecycle is owned by the user-management collaborator; this
/// engine only reads users and updates their last known location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub role: Role,
    #[serde(default)]
    pub preferences: NotificationPreferences,
    #[serde(default = "default_language")]
    pub preferred_language: String,
    #[serde(default)]
    pub device_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Responders must be verified before they are matched to SOS requests.
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub emergency_contacts: Vec<EmergencyContact>,
}

fn default_language() -> String {
    "en".to_string()
}

/// Severity of a danger-zone ring, innermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneSeverity {
    Red,
    Orange,
    Yellow,
}

impl ZoneSeverity {
    /// Ordering rank for sorting matched zones (RED > ORANGE > YELLOW).
    pub fn rank(self) -> u8 {
        match self {
            ZoneSeverity::Red => 3,
            ZoneSeverity::Orange => 2,
            ZoneSeverity::Yellow => 1,
        }
    }
}

/// A concentric risk ring derived from a disaster.
///
/// Always reproducible from the owning disaster; cached with a TTL but
/// never treated as source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DangerZone {
    /// `{disaster_id}-{ring}`, e.g. `d42-red`.
    pub id: String,
    pub center: Location,
    pub radius_km: f64,
    pub severity: ZoneSeverity,
    pub disaster_id: String,
    pub label: String,
}

/// Result of checking a user against all active danger zones.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneCheck {
    pub in_danger: bool,
    /// Matched zones sorted by severity descending (RED first).
    pub zones: Vec<DangerZone>,
}

impl ZoneCheck {
    /// The fail-safe result: not in danger, no zones.
    pub fn clear() -> Self {
        Self {
            in_danger: false,
            zones: Vec::new(),
        }
    }
}

/// Category of an alert, which also determines its queue priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    Warning,
    Evacuation,
    AllClear,
    Update,
}

impl AlertType {
    /// Delivery queue priority; lower is dequeued first.
    ///
    /// Evacuation alerts must always drain ahead of informational ones
    /// under load.
    pub fn queue_priority(self) -> u8 {
        match self {
            AlertType::Evacuation => 1,
            AlertType::Warning => 2,
            AlertType::Update => 3,
            AlertType::AllClear => 4,
        }
    }
}

/// Channel an alert is delivered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMethod {
    Push,
    Sms,
    Email,
    InApp,
    Websocket,
}

/// Delivery progress of an alert.
///
/// Lifecycle: `PENDING -> SENT|FAILED -> DELIVERED`. Delivered is
/// best-effort and not always reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Failed => "FAILED",
        }
    }
}

/// A targeted alert for a single user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    /// None for ad-hoc broadcasts not tied to a disaster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disaster_id: Option<String>,
    pub user_id: String,
    pub alert_type: AlertType,
    /// Base (English) message.
    pub message: String,
    /// Translated variants keyed by language code.
    #[serde(default)]
    pub translated_messages: HashMap<String, String>,
    pub delivery_method: DeliveryMethod,
    pub delivery_status: DeliveryStatus,
    #[serde(default)]
    pub is_read: bool,
    /// Snapshot of the disaster location at creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Category of a user-reported emergency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyType {
    Medical,
    Fire,
    Trapped,
    Injury,
    NaturalDisaster,
    Other,
}

impl std::fmt::Display for EmergencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EmergencyType::Medical => "MEDICAL",
            EmergencyType::Fire => "FIRE",
            EmergencyType::Trapped => "TRAPPED",
            EmergencyType::Injury => "INJURY",
            EmergencyType::NaturalDisaster => "NATURAL_DISASTER",
            EmergencyType::Other => "OTHER",
        };
        write!(f, "{s}")
    }
}

/// State of an SOS request.
///
/// `RESOLVED` and `CANCELLED` are terminal; no further transitions are
/// permitted once either is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SosStatus {
    Pending,
    Dispatched,
    InProgress,
    Resolved,
    Cancelled,
}

impl SosStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SosStatus::Resolved | SosStatus::Cancelled)
    }

    /// Wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            SosStatus::Pending => "PENDING",
            SosStatus::Dispatched => "DISPATCHED",
            SosStatus::InProgress => "IN_PROGRESS",
            SosStatus::Resolved => "RESOLVED",
            SosStatus::Cancelled => "CANCELLED",
        }
    }
}

/// A user-submitted emergency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SosRequest {
    pub id: String,
    pub user_id: String,
    pub location: Location,
    pub emergency_type: EmergencyType,
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub status: SosStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_assigned: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SosRequest {
    /// Build a fresh PENDING request with a generated id.
    pub fn new(
        user_id: String,
        location: Location,
        emergency_type: EmergencyType,
        severity: Severity,
        description: String,
        media_urls: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            location,
            emergency_type,
            severity,
            description,
            media_urls,
            status: SosStatus::Pending,
            responder_assigned: None,
            responder_notes: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Overall risk level for a user, derived from the max risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Unknown,
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Map a 0-100 risk score to a level.
    ///
    /// # Thresholds
    ///
    /// - `>= 80`: critical
    /// - `>= 60`: high
    /// - `>= 40`: medium
    /// - `>= 20`: low
    /// - otherwise: safe
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            RiskLevel::Critical
        } else if score >= 60.0 {
            RiskLevel::High
        } else if score >= 40.0 {
            RiskLevel::Medium
        } else if score >= 20.0 {
            RiskLevel::Low
        } else {
            RiskLevel::Safe
        }
    }
}

/// A disaster that scored above the alerting threshold for a user.
#[derive(Debug, Clone, Serialize)]
pub struct ThreateningDisaster {
    pub disaster: DisasterEvent,
    pub distance_km: f64,
    pub risk_score: f64,
}

/// Result of assessing one user against all active disasters.
#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub disasters: Vec<ThreateningDisaster>,
    pub max_risk_score: f64,
}

impl RiskAssessment {
    /// The assessment for a user with no known location, or when a lookup
    /// fails mid-assessment.
    pub fn unknown() -> Self {
        Self {
            level: RiskLevel::Unknown,
            disasters: Vec::new(),
            max_risk_score: 0.0,
        }
    }

    pub fn safe() -> Self {
        Self {
            level: RiskLevel::Safe,
            disasters: Vec::new(),
            max_risk_score: 0.0,
        }
    }
}

/// Geographic targeting override for alert creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeoTarget {
    /// Radius in km; falls back to the disaster radius, then 50 km.
    #[serde(default)]
    pub radius: Option<f64>,
}

/// Request body for `POST /emergency/sos`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSosBody {
    pub location: Location,
    pub emergency_type: EmergencyType,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

/// Maximum length accepted for an SOS description.
pub const MAX_SOS_DESCRIPTION_LEN: usize = 500;

impl CreateSosBody {
    pub fn validate(&self) -> Result<(), String> {
        self.location.validate()?;
        if self.description.chars().count() > MAX_SOS_DESCRIPTION_LEN {
            return Err(format!(
                "description exceeds {MAX_SOS_DESCRIPTION_LEN} characters"
            ));
        }
        Ok(())
    }
}

/// Response for `POST /emergency/sos`.
#[derive(Debug, Clone, Serialize)]
pub struct SosCreated {
    pub sos_id: String,
    pub status: SosStatus,
    pub estimated_response: String,
}

/// Request body for `PATCH /emergency/sos/:id`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSosBody {
    pub status: SosStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Request body for `PATCH /emergency/sos/:id/assign`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssignSosBody {
    /// Responder taking the request; defaults to the caller.
    #[serde(default)]
    pub responder_id: Option<String>,
}

/// A recorded SOS lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
}

/// Responder details exposed through tracking.
#[derive(Debug, Clone, Serialize)]
pub struct ResponderInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Minutes until arrival, when the responder has a known location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_minutes: Option<i64>,
}

/// Response for `GET /emergency/sos/:id`.
#[derive(Debug, Clone, Serialize)]
pub struct SosTracking {
    pub id: String,
    pub status: SosStatus,
    pub emergency_type: EmergencyType,
    pub severity: Severity,
    pub description: String,
    pub location: Location,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder: Option<ResponderInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder_notes: Option<String>,
    pub timeline: Vec<TimelineEvent>,
}

/// Request body for the admin broadcast endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastAlertBody {
    pub disaster_id: String,
    #[serde(default)]
    pub radius: Option<f64>,
}
