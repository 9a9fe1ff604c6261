//! Risk assessment: distance-decayed severity scoring.
//!
//! A disaster's threat to a user is its severity base score scaled down
//! linearly with distance, reaching zero at the disaster's effective
//! radius. The assessment is read-only and idempotent so it can run
//! synchronously on every location update.

use tracing::{info, warn};

use crate::geo;
use crate::model::{
    DisasterEvent, RiskAssessment, RiskLevel, ThreateningDisaster, DEFAULT_DISASTER_RADIUS_KM,
};
use crate::storage::Storage;

/// Coarse prefilter: only disasters within this many km are considered.
const NEARBY_RADIUS_KM: f64 = 50.0;

/// A disaster scoring above this is recorded as threatening.
const THREAT_THRESHOLD: f64 = 30.0;

/// Risk score for one user/disaster pair, in [0, 100].
///
/// `severity_base * max(0, 1 - distance / effective_radius)` where the
/// effective radius defaults to 50 km. Monotonically non-increasing in
/// distance for a fixed severity.
pub fn risk_score(disaster: &DisasterEvent, distance_km: f64) -> f64 {
    let effective_radius = disaster
        .location
        .effective_radius(DEFAULT_DISASTER_RADIUS_KM);
    let distance_factor = (1.0 - distance_km / effective_radius).max(0.0);
    disaster.severity.base_score() * distance_factor
}

/// Risk computation backed by storage.
#[derive(Clone)]
pub struct RiskEngine {
    storage: Storage,
}

impl RiskEngine {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Assess a user's exposure to all active disasters.
    ///
    /// Returns `UNKNOWN` when the user has no known location or a lookup
    /// fails, and `SAFE` when nothing nearby scores any risk. Read-only;
    /// never mutates state.
    pub async fn assess_user_risk(&self, user_id: &str) -> RiskAssessment {
        let user_location = match self.storage.get_user(user_id).await {
            Ok(Some(user)) => match user.location {
                Some(loc) => loc,
                None => return RiskAssessment::unknown(),
            },
            Ok(None) => return RiskAssessment::unknown(),
            Err(e) => {
                warn!(user_id, error = %e, "Risk assessment failed");
                return RiskAssessment::unknown();
            }
        };

        let nearby = match self
            .storage
            .active_disasters_within(&user_location, NEARBY_RADIUS_KM)
            .await
        {
            Ok(d) => d,
            Err(e) => {
                warn!(user_id, error = %e, "Risk assessment failed");
                return RiskAssessment::unknown();
            }
        };

        if nearby.is_empty() {
            return RiskAssessment::safe();
        }

        let mut max_risk: f64 = 0.0;
        let mut threatening = Vec::new();

        for disaster in nearby {
            let distance_km = geo::distance_km(&user_location, &disaster.location);
            let score = risk_score(&disaster, distance_km);

            max_risk = max_risk.max(score);

            if score > THREAT_THRESHOLD {
                threatening.push(ThreateningDisaster {
                    disaster,
                    distance_km,
                    risk_score: score,
                });
            }
        }

        RiskAssessment {
            level: RiskLevel::from_score(max_risk),
            disasters: threatening,
            max_risk_score: max_risk,
        }
    }

    /// Re-assess everyone near an updated disaster and log elevated risk.
    ///
    /// Called from zone monitoring when a disaster changes. Per-user
    /// failures do not abort the sweep.
    pub async fn reassess_users_in_area(
        &self,
        center: &crate::model::Location,
        radius_km: f64,
    ) -> anyhow::Result<()> {
        let users = self.storage.users_within(center, radius_km).await?;

        info!(count = users.len(), "Reassessing users in area");

        for user in users {
            let assessment = self.assess_user_risk(&user.id).await;

            if matches!(assessment.level, RiskLevel::High | RiskLevel::Critical) {
                warn!(
                    user_id = %user.id,
                    level = ?assessment.level,
                    score = assessment.max_risk_score,
                    "User at elevated risk"
                );
            }
        }

        Ok(())
    }
}
