//! Beacon server entry point.
//!
//! Configuration comes from environment variables:
//!
//! - `BEACON_PORT` - listen port (default 3000)
//! - `BEACON_DATABASE_URL` - SQLite database URL
//! - `BEACON_TRANSLATE_URL` - translation service endpoint (optional;
//!   alerts go out untranslated without it)
//! - `BEACON_DELIVERY_WORKERS` - delivery worker count (default 4)
//! - `BEACON_AUTO_EMERGENCY_CALL` - set to `1` to place automated voice
//!   calls for CRITICAL SOS requests

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use beacon::alerts::AlertService;
use beacon::api::{app, AppState, RateLimiter};
use beacon::delivery::{DeliveryConfig, DeliveryQueue, Senders};
use beacon::realtime::Realtime;
use beacon::risk::RiskEngine;
use beacon::sos::SosService;
use beacon::storage::Storage;
use beacon::translate::{HttpTranslator, NoopTranslator, Translator};
use beacon::zones::{ZoneCache, ZoneService, ZONE_CACHE_TTL};

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:beacon.db?mode=rwc";

/// Danger zones for active disasters are re-derived on this cadence.
const ZONE_MONITOR_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("beacon=info".parse()?))
        .init();

    let port: u16 = env::var("BEACON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let db_url = env::var("BEACON_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    let workers: usize = env::var("BEACON_DELIVERY_WORKERS")
        .ok()
        .and_then(|w| w.parse().ok())
        .unwrap_or(4);

    let auto_emergency_call = env::var("BEACON_AUTO_EMERGENCY_CALL")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    info!(port, db_url = %db_url, workers, "Starting Beacon server");

    let storage = Storage::new(&db_url).await?;
    info!("Database initialized");

    let translator: Arc<dyn Translator> = match env::var("BEACON_TRANSLATE_URL") {
        Ok(url) => {
            info!(url = %url, "Translation service configured");
            Arc::new(HttpTranslator::new(&url))
        }
        Err(_) => {
            warn!("No translation service configured, alerts go out untranslated");
            Arc::new(NoopTranslator)
        }
    };

    let realtime = Realtime::new();
    let risk = RiskEngine::new(storage.clone());
    let zones = ZoneService::new(storage.clone(), Arc::new(ZoneCache::new(ZONE_CACHE_TTL)));

    let queue = DeliveryQueue::new(
        storage.clone(),
        Senders::logging(),
        realtime.clone(),
        DeliveryConfig {
            workers,
            ..DeliveryConfig::default()
        },
    );

    // Alerts interrupted by a restart go back on the queue.
    let pending = storage.list_pending_alerts().await?;
    if !pending.is_empty() {
        info!(count = pending.len(), "Re-queueing pending alerts from last run");
        queue.enqueue_batch(&pending).await;
    }

    let alerts = AlertService::new(
        storage.clone(),
        translator,
        queue.clone(),
        realtime.clone(),
    );
    let sos = SosService::new(
        storage.clone(),
        Senders::logging(),
        realtime.clone(),
        auto_emergency_call,
    );

    // Background zone monitor: keeps rings fresh for active disasters and
    // re-scores the users around them.
    {
        let zones = zones.clone();
        let risk = risk.clone();
        let storage = storage.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ZONE_MONITOR_INTERVAL);
            loop {
                ticker.tick().await;
                match storage.list_active_disasters().await {
                    Ok(disasters) => {
                        for disaster in disasters {
                            zones.refresh_zones(&disaster.id).await;
                            let radius = disaster.radius_km();
                            if let Err(e) =
                                risk.reassess_users_in_area(&disaster.location, radius).await
                            {
                                warn!(disaster_id = %disaster.id, error = %e, "Area reassessment failed");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Zone monitor sweep failed"),
                }
            }
        });
    }

    let state = AppState {
        storage,
        risk,
        zones,
        alerts,
        sos,
        realtime,
        sos_limiter: RateLimiter::default(),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Beacon is listening");

    axum::serve(listener, app(state)).await?;

    Ok(())
}
