use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use idrs_config::EngineConfig;
use idrs_core::{
    ConsistencyLevel, EngineError, EngineResult, FingerprintSummary, Geolocation, ViolationKind,
};

use crate::geo::haversine_km;
use crate::ledger::{ConsistencyLedger, ConsistencyRecord};

/// Score lost per violation.
const VIOLATION_COST: f64 = 0.1;

#[derive(Clone, Debug, PartialEq)]
pub struct ValidatorSettings {
    pub level: ConsistencyLevel,
    pub max_plausible_speed_kmh: f64,
    pub geo_tolerance_km: f64,
    pub fingerprint_drift_threshold: f64,
}

impl ValidatorSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            level: config.consistency_level,
            max_plausible_speed_kmh: config.max_plausible_speed_kmh,
            geo_tolerance_km: config.geo_tolerance_km,
            fingerprint_drift_threshold: config.fingerprint_drift_threshold,
        }
    }
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// State a session is about to present.
#[derive(Clone, Debug, PartialEq)]
pub struct ProposedUpdate {
    pub geolocation: Option<Geolocation>,
    pub fingerprint: Option<FingerprintSummary>,
    pub at: DateTime<Utc>,
}

impl From<&ConsistencyRecord> for ProposedUpdate {
    fn from(record: &ConsistencyRecord) -> Self {
        Self {
            geolocation: record.geolocation.clone(),
            fingerprint: Some(record.fingerprint.clone()),
            at: record.recorded_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub violations: Vec<ViolationKind>,
    pub score: f64,
}

impl ValidationReport {
    fn from_violations(violations: Vec<ViolationKind>) -> Self {
        let score = (1.0 - VIOLATION_COST * violations.len() as f64).max(0.0);
        Self {
            valid: violations.is_empty(),
            violations,
            score,
        }
    }
}

/// Session-specific behavior check. The default finds nothing.
pub trait BehaviorCheck: Send + Sync {
    fn check(
        &self,
        session_key: &str,
        history: &[ConsistencyRecord],
        proposed: &ProposedUpdate,
    ) -> Vec<ViolationKind>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBehaviorCheck;

impl BehaviorCheck for NoopBehaviorCheck {
    fn check(&self, _: &str, _: &[ConsistencyRecord], _: &ProposedUpdate) -> Vec<ViolationKind> {
        Vec::new()
    }
}

pub struct ConsistencyValidator {
    settings: ValidatorSettings,
    behavior: Arc<dyn BehaviorCheck>,
}

impl ConsistencyValidator {
    pub fn new(settings: ValidatorSettings) -> Self {
        Self {
            settings,
            behavior: Arc::new(NoopBehaviorCheck),
        }
    }

    pub fn with_behavior_check(mut self, behavior: Arc<dyn BehaviorCheck>) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn settings(&self) -> &ValidatorSettings {
        &self.settings
    }

    pub fn level(&self) -> ConsistencyLevel {
        self.settings.level
    }

    /// Validate `proposed` against the session's and resource's history.
    ///
    /// Geography is compared with the session's latest located record;
    /// fingerprint drift with the record of the resource being presented.
    pub fn validate(
        &self,
        ledger: &ConsistencyLedger,
        session_key: &str,
        resource_prior: Option<&ConsistencyRecord>,
        proposed: &ProposedUpdate,
    ) -> ValidationReport {
        let session_prior = ledger.last_located_for_session(session_key);
        let mut violations = Vec::new();

        if let Some(prior) = &session_prior
            && self.impossible_travel(prior, proposed)
        {
            violations.push(ViolationKind::ImpossibleTravel);
        }

        if self.settings.level != ConsistencyLevel::Relaxed {
            if let (Some(prior), Some(fingerprint)) = (resource_prior, &proposed.fingerprint)
                && self.drastic_change(&prior.fingerprint, fingerprint)
            {
                violations.push(ViolationKind::FingerprintDrasticChange);
            }
            let history = ledger.session_history(session_key);
            for kind in self.behavior.check(session_key, &history, proposed) {
                if !violations.contains(&kind) {
                    violations.push(kind);
                }
            }
        }

        let report = ValidationReport::from_violations(violations);
        if !report.valid {
            debug!(
                session_key,
                violations = ?report.violations,
                score = report.score,
                "Consistency violations"
            );
        }
        report
    }

    /// Strict mode turns any violation into an error.
    pub fn enforce(&self, report: &ValidationReport) -> EngineResult<()> {
        if self.settings.level == ConsistencyLevel::Strict && !report.valid {
            return Err(EngineError::ConsistencyViolation {
                violations: report.violations.clone(),
            });
        }
        Ok(())
    }

    fn impossible_travel(&self, prior: &ConsistencyRecord, proposed: &ProposedUpdate) -> bool {
        let (Some(from), Some(to)) = (&prior.geolocation, &proposed.geolocation) else {
            return false;
        };
        let distance = haversine_km(from.latitude, from.longitude, to.latitude, to.longitude);
        let elapsed_hours =
            ((proposed.at - prior.recorded_at).num_milliseconds().max(0) as f64) / 3_600_000.0;
        let reachable =
            elapsed_hours * self.settings.max_plausible_speed_kmh + self.settings.geo_tolerance_km;
        distance > reachable
    }

    fn drastic_change(&self, prior: &FingerprintSummary, proposed: &FingerprintSummary) -> bool {
        proposed.drift_from(prior) > self.settings.fingerprint_drift_threshold
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
