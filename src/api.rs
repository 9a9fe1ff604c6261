//! HTTP API handlers.
//!
//! Identity arrives as an `x-user-id` header set by the gateway that
//! fronts this engine; handlers resolve it to a stored user and enforce
//! role checks from there. Responses use a uniform envelope:
//! `{"success": true, "data": ...}` on success and
//! `{"success": false, "error": {"message": ...}}` on failure.
//!
//! SOS creation is rate limited per user so a stuck client retry loop
//! cannot flood responders with duplicates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::alerts::AlertService;
use crate::error::{AppError, Result};
use crate::model::{
    AssignSosBody, BroadcastAlertBody, CreateSosBody, GeoTarget, Role, UpdateSosBody, User,
};
use crate::realtime::Realtime;
use crate::risk::RiskEngine;
use crate::sos::SosService;
use crate::storage::Storage;
use crate::zones::ZoneService;

/// SOS creations allowed per user per window.
const SOS_RATE_LIMIT: usize = 3;
const SOS_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub risk: RiskEngine,
    pub zones: ZoneService,
    pub alerts: AlertService,
    pub sos: SosService,
    pub realtime: Realtime,
    pub sos_limiter: RateLimiter,
}

/// Sliding-window request counter keyed by user id.
#[derive(Clone)]
pub struct RateLimiter {
    hits: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
    max: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            hits: Arc::new(Mutex::new(HashMap::new())),
            max,
            window,
        }
    }

    /// Record a hit for `key`; false when the window is already full.
    ///
    /// Keys whose hits have all aged out are dropped, so the map stays
    /// bounded by the set of recently active callers.
    pub async fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        hits.retain(|_, stamps| {
            stamps.retain(|t| now.duration_since(*t) < self.window);
            !stamps.is_empty()
        });

        let entry = hits.entry(key.to_string()).or_default();
        if entry.len() >= self.max {
            return false;
        }
        entry.push(now);
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(SOS_RATE_LIMIT, SOS_RATE_WINDOW)
    }
}

/// Wrap a payload in the success envelope.
fn envelope<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Resolve the calling user from the `x-user-id` header.
async fn caller(state: &AppState, headers: &HeaderMap) -> Result<User> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Forbidden("authentication required".to_string()))?;

    state
        .storage
        .get_user(user_id)
        .await?
        .ok_or_else(|| AppError::Forbidden("unknown user".to_string()))
}

/// POST /emergency/sos - Create an SOS request.
///
/// Returns `201 Created` with the new request id; notifications fan out
/// in the background.
#[instrument(skip(state, headers, body))]
pub async fn create_sos(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSosBody>,
) -> Result<impl IntoResponse> {
    let user = caller(&state, &headers).await?;

    if !state.sos_limiter.allow(&user.id).await {
        warn!(user_id = %user.id, "SOS rate limit hit");
        return Err(AppError::RateLimited);
    }

    let created = state.sos.create(&user.id, body).await?;
    Ok((StatusCode::CREATED, envelope(created)))
}

/// PATCH /emergency/sos/:id/assign - Responder claims a request.
#[instrument(skip(state, headers, body))]
pub async fn assign_sos(
    State(state): State<AppState>,
    Path(sos_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AssignSosBody>,
) -> Result<impl IntoResponse> {
    let user = caller(&state, &headers).await?;
    let updated = state.sos.assign(&sos_id, &user, body).await?;
    Ok(envelope(updated))
}

/// PATCH /emergency/sos/:id - Advance the request lifecycle.
#[instrument(skip(state, headers, body))]
pub async fn update_sos_status(
    State(state): State<AppState>,
    Path(sos_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateSosBody>,
) -> Result<impl IntoResponse> {
    let user = caller(&state, &headers).await?;
    let updated = state.sos.update_status(&sos_id, &user, body).await?;
    Ok(envelope(updated))
}

/// PATCH /emergency/sos/:id/cancel - Requester withdraws the request.
#[instrument(skip(state, headers))]
pub async fn cancel_sos(
    State(state): State<AppState>,
    Path(sos_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let user = caller(&state, &headers).await?;
    let cancelled = state.sos.cancel(&sos_id, &user.id).await?;
    Ok(envelope(cancelled))
}

/// GET /emergency/sos/:id - Tracking view with responder ETA and timeline.
#[instrument(skip(state, headers))]
pub async fn track_sos(
    State(state): State<AppState>,
    Path(sos_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let user = caller(&state, &headers).await?;
    let tracking = state.sos.tracking(&sos_id, &user).await?;
    Ok(envelope(tracking))
}

/// GET /disasters/risk-assessment - The caller's current risk picture.
#[instrument(skip(state, headers))]
pub async fn get_risk_assessment(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let user = caller(&state, &headers).await?;
    let assessment = state.risk.assess_user_risk(&user.id).await;

    info!(
        user_id = %user.id,
        level = ?assessment.level,
        score = assessment.max_risk_score,
        "Risk assessment queried"
    );
    Ok(envelope(assessment))
}

/// GET /disasters/:id/zones - Danger zone rings for a disaster.
#[instrument(skip(state))]
pub async fn get_disaster_zones(
    State(state): State<AppState>,
    Path(disaster_id): Path<String>,
) -> Result<impl IntoResponse> {
    let disaster = state
        .storage
        .get_disaster(&disaster_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("disaster not found: {disaster_id}")))?;

    let zones = state.zones.get_zones(&disaster.id).await;
    Ok(envelope(zones))
}

/// GET /disasters/zones/check - Check the caller against all active zones.
#[instrument(skip(state, headers))]
pub async fn check_zones(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let user = caller(&state, &headers).await?;
    let check = state.zones.check_user_in_zones(&user.id).await;

    if check.in_danger {
        warn!(user_id = %user.id, zones = check.zones.len(), "User inside danger zone");
    }
    Ok(envelope(check))
}

/// POST /alerts/broadcast - Admin-triggered alert batch for a disaster.
#[instrument(skip(state, headers, body))]
pub async fn broadcast_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BroadcastAlertBody>,
) -> Result<impl IntoResponse> {
    let user = caller(&state, &headers).await?;
    if user.role != Role::Admin {
        return Err(AppError::Forbidden(
            "only admins can broadcast alerts".to_string(),
        ));
    }

    let target = GeoTarget {
        radius: body.radius,
    };
    let created = state.alerts.create_alert(&body.disaster_id, &target).await?;

    info!(
        disaster_id = %body.disaster_id,
        created = created.len(),
        "Broadcast requested"
    );
    Ok((
        StatusCode::CREATED,
        envelope(json!({ "alerts_created": created.len() })),
    ))
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Build the router. Shared with the integration tests.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/emergency/sos", post(create_sos))
        .route("/emergency/sos/:id", get(track_sos).patch(update_sos_status))
        .route("/emergency/sos/:id/assign", patch(assign_sos))
        .route("/emergency/sos/:id/cancel", patch(cancel_sos))
        .route("/disasters/risk-assessment", get(get_risk_assessment))
        .route("/disasters/zones/check", get(check_zones))
        .route("/disasters/:id/zones", get(get_disaster_zones))
        .route("/alerts/broadcast", post(broadcast_alert))
        .route("/health", get(health_check))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_allows_up_to_max() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.allow("u1").await);
        assert!(limiter.allow("u1").await);
        assert!(limiter.allow("u1").await);
        assert!(!limiter.allow("u1").await);

        // Other keys are independent.
        assert!(limiter.allow("u2").await);
    }

    #[tokio::test]
    async fn test_rate_limiter_window_expiry() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.allow("u1").await);
        assert!(!limiter.allow("u1").await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.allow("u1").await);
    }

    #[tokio::test]
    async fn test_rate_limiter_evicts_idle_keys() {
        let limiter = RateLimiter::new(3, Duration::from_millis(20));
        assert!(limiter.allow("u1").await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.allow("u2").await);

        let hits = limiter.hits.lock().await;
        assert!(!hits.contains_key("u1"));
        assert!(hits.contains_key("u2"));
    }
}
