//! Danger-zone generation and membership checks.
//!
//! A disaster produces three concentric rings at 30%, 60% and 100% of its
//! radius, RED innermost through YELLOW outermost. Zones are always
//! reproducible from the owning disaster, so the cache here is a pure
//! optimization: TTL-bounded, last-write-wins, safe to race on.
//!
//! Failure policy: a lookup error during a membership check yields
//! "not in danger, no zones" rather than an error. A false alarm storm
//! from a flaky read would be worse than a silently degraded check; the
//! risk engine provides the second line of defense.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::geo;
use crate::model::{DangerZone, DisasterEvent, DisasterStatus, ZoneCheck, ZoneSeverity};
use crate::storage::Storage;

/// How long cached zones stay valid.
pub const ZONE_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Derive the three concentric rings for a disaster.
pub fn generate_zones(disaster: &DisasterEvent) -> [DangerZone; 3] {
    let base_radius = disaster.radius_km();
    let center = disaster.location.clone();

    [
        DangerZone {
            id: format!("{}-red", disaster.id),
            center: center.clone(),
            radius_km: base_radius * 0.3,
            severity: ZoneSeverity::Red,
            disaster_id: disaster.id.clone(),
            label: "Immediate Danger - Evacuate Now".to_string(),
        },
        DangerZone {
            id: format!("{}-orange", disaster.id),
            center: center.clone(),
            radius_km: base_radius * 0.6,
            severity: ZoneSeverity::Orange,
            disaster_id: disaster.id.clone(),
            label: "High Risk - Prepare to Evacuate".to_string(),
        },
        DangerZone {
            id: format!("{}-yellow", disaster.id),
            center,
            radius_km: base_radius,
            severity: ZoneSeverity::Yellow,
            disaster_id: disaster.id.clone(),
            label: "Elevated Risk - Stay Alert".to_string(),
        },
    ]
}

/// In-process TTL cache for generated zones, keyed by disaster id.
///
/// Injectable so tests can assert cache behavior deterministically.
/// Writers may race benignly; entries are always reproducible.
pub struct ZoneCache {
    entries: RwLock<HashMap<String, (Vec<DangerZone>, DateTime<Utc>)>>,
    ttl: Duration,
}

impl ZoneCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Fetch unexpired zones for a disaster.
    pub async fn get(&self, disaster_id: &str) -> Option<Vec<DangerZone>> {
        let entries = self.entries.read().await;
        let (zones, stored_at) = entries.get(disaster_id)?;
        let age = Utc::now().signed_duration_since(*stored_at);
        if age.to_std().map(|a| a < self.ttl).unwrap_or(false) {
            Some(zones.clone())
        } else {
            None
        }
    }

    pub async fn set(&self, disaster_id: &str, zones: Vec<DangerZone>) {
        let mut entries = self.entries.write().await;
        entries.insert(disaster_id.to_string(), (zones, Utc::now()));
    }

    /// Drop a cached entry (used when the owning disaster changes).
    pub async fn expire(&self, disaster_id: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(disaster_id);
    }
}

impl Default for ZoneCache {
    fn default() -> Self {
        Self::new(ZONE_CACHE_TTL)
    }
}

/// Zone computation backed by storage and the TTL cache.
#[derive(Clone)]
pub struct ZoneService {
    storage: Storage,
    cache: Arc<ZoneCache>,
}

impl ZoneService {
    pub fn new(storage: Storage, cache: Arc<ZoneCache>) -> Self {
        Self { storage, cache }
    }

    /// Zones for a disaster, from cache when fresh.
    ///
    /// Returns an empty list (logged) when the disaster is missing or the
    /// lookup fails, matching the fail-safe-open policy.
    pub async fn get_zones(&self, disaster_id: &str) -> Vec<DangerZone> {
        if let Some(zones) = self.cache.get(disaster_id).await {
            return zones;
        }

        match self.storage.get_disaster(disaster_id).await {
            Ok(Some(disaster)) => {
                let zones = generate_zones(&disaster).to_vec();
                self.cache.set(disaster_id, zones.clone()).await;
                info!(disaster_id, zones = zones.len(), "Danger zones generated");
                zones
            }
            Ok(None) => {
                warn!(disaster_id, "Danger zone generation skipped, disaster not found");
                Vec::new()
            }
            Err(e) => {
                warn!(disaster_id, error = %e, "Danger zone generation failed");
                Vec::new()
            }
        }
    }

    /// Check whether a user currently sits inside any active danger zone.
    ///
    /// Matched zones are sorted by severity descending (RED first). Any
    /// failure along the way degrades to [`ZoneCheck::clear`].
    pub async fn check_user_in_zones(&self, user_id: &str) -> ZoneCheck {
        let user_location = match self.storage.get_user(user_id).await {
            Ok(Some(user)) => match user.location {
                Some(loc) => loc,
                None => return ZoneCheck::clear(),
            },
            Ok(None) => return ZoneCheck::clear(),
            Err(e) => {
                warn!(user_id, error = %e, "Danger zone check failed");
                return ZoneCheck::clear();
            }
        };

        let disasters = match self.storage.list_active_disasters().await {
            Ok(d) => d,
            Err(e) => {
                warn!(user_id, error = %e, "Danger zone check failed");
                return ZoneCheck::clear();
            }
        };

        let mut matched = Vec::new();
        for disaster in &disasters {
            for zone in self.get_zones(&disaster.id).await {
                if geo::distance_km(&user_location, &zone.center) <= zone.radius_km {
                    matched.push(zone);
                }
            }
        }

        matched.sort_by(|a, b| b.severity.rank().cmp(&a.severity.rank()));

        ZoneCheck {
            in_danger: !matched.is_empty(),
            zones: matched,
        }
    }

    /// Recompute zones after a disaster update.
    ///
    /// Non-active disasters are skipped; their zones simply expire from
    /// the cache.
    pub async fn refresh_zones(&self, disaster_id: &str) {
        self.cache.expire(disaster_id).await;

        match self.storage.get_disaster(disaster_id).await {
            Ok(Some(disaster)) if disaster.status == DisasterStatus::Active => {
                let zones = generate_zones(&disaster).to_vec();
                self.cache.set(disaster_id, zones).await;
                info!(disaster_id, "Danger zones refreshed");
            }
            Ok(_) => {
                info!(disaster_id, "Disaster not active, skipping zone refresh");
            }
            Err(e) => {
                warn!(disaster_id, error = %e, "Zone refresh failed");
            }
        }
    }

    /// All zones of all active disasters (for map visualization).
    pub async fn all_active_zones(&self) -> anyhow::Result<Vec<DangerZone>> {
        let disasters = self.storage.list_active_disasters().await?;

        let mut zones = Vec::new();
        for disaster in &disasters {
            zones.extend(self.get_zones(&disaster.id).await);
        }
        Ok(zones)
    }
}
