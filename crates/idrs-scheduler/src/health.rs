//! Connectivity probing and the fleet consistency audit.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use idrs_consistency::{ConsistencyLedger, ConsistencyRecord, ConsistencyValidator, ProposedUpdate};
use idrs_core::{
    EngineEvent, Resource, ResourceId, ResourceKind, ResourceProfile, ResourceStatus,
    RotationTrigger,
};
use idrs_pool::{ResourceFilter, ResourcePool};

use crate::rotation::RotationScheduler;

/// Below this health score a bound resource is rotated out right away.
const EMERGENCY_HEALTH_FLOOR: f64 = 0.3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    Healthy { response_ms: u64 },
    Failed { reason: String },
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, resource: &Resource) -> ProbeResult;
}

/// Opens a TCP connection to each proxy gateway. Devices and session
/// identities have nothing to dial and always pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, resource: &Resource) -> ProbeResult {
        let ResourceProfile::Proxy(proxy) = &resource.profile else {
            return ProbeResult::Healthy { response_ms: 0 };
        };
        let started = Instant::now();
        match TcpStream::connect((proxy.host.as_str(), proxy.port)).await {
            Ok(_) => ProbeResult::Healthy {
                response_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            },
            Err(e) => ProbeResult::Failed {
                reason: e.to_string(),
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub healthy: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Bindings rotated away from degraded resources.
    pub rotated: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AuditReport {
    pub sessions: usize,
    pub bindings: usize,
    pub violations: usize,
    pub score: f64,
}

pub struct HealthMonitor {
    pool: Arc<ResourcePool>,
    scheduler: Arc<RotationScheduler>,
    validator: Arc<ConsistencyValidator>,
    ledger: Arc<ConsistencyLedger>,
    prober: Arc<dyn Prober>,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<ResourcePool>,
        scheduler: Arc<RotationScheduler>,
        validator: Arc<ConsistencyValidator>,
        ledger: Arc<ConsistencyLedger>,
        prober: Arc<dyn Prober>,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            scheduler,
            validator,
            ledger,
            prober,
            timeout,
        }
    }

    /// Probe every active resource concurrently and feed the results back
    /// into the pool. A probe that outlives the timeout counts as failed.
    pub async fn probe_all(&self) -> ProbeReport {
        let mut report = ProbeReport::default();
        let mut join_set = JoinSet::new();

        for kind in ResourceKind::ALL {
            for resource in self.pool.list_active(kind, ResourceFilter::default()) {
                let prober = self.prober.clone();
                let timeout = self.timeout;
                join_set.spawn(async move {
                    let outcome = tokio::time::timeout(timeout, prober.probe(&resource)).await;
                    (resource.id, outcome)
                });
            }
        }

        while let Some(joined) = join_set.join_next().await {
            let (id, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Probe task join error: {}", e);
                    continue;
                }
            };
            match outcome {
                Ok(ProbeResult::Healthy { response_ms }) => {
                    report.healthy += 1;
                    self.apply(&id, |pool| pool.mark_healthy(&id, response_ms).map(drop));
                }
                Ok(ProbeResult::Failed { reason }) => {
                    report.failed += 1;
                    warn!(resource_id = %id, %reason, "Probe failed");
                    self.apply(&id, |pool| pool.mark_failed(&id).map(drop));
                }
                Err(_) => {
                    report.timed_out += 1;
                    warn!(resource_id = %id, timeout_ms = self.timeout.as_millis() as u64, "Probe timed out");
                    self.apply(&id, |pool| pool.mark_failed(&id).map(drop));
                }
            }
        }

        report.rotated = self.rotate_degraded();
        debug!(
            healthy = report.healthy,
            failed = report.failed,
            timed_out = report.timed_out,
            rotated = report.rotated,
            "Health probe pass finished"
        );
        report
    }

    fn apply(
        &self,
        id: &ResourceId,
        f: impl FnOnce(&ResourcePool) -> idrs_core::EngineResult<()>,
    ) {
        if let Err(error) = f(&self.pool) {
            warn!(resource_id = %id, %error, "Could not record probe result");
        }
    }

    /// Rotate sessions off quarantined or badly degraded resources.
    fn rotate_degraded(&self) -> usize {
        let mut rotated = 0;
        for binding in self.pool.live_bindings() {
            let Ok(resource) = self.pool.get(&binding.resource_id) else {
                continue;
            };
            let degraded = resource.status == ResourceStatus::Quarantined
                || resource.health.score < EMERGENCY_HEALTH_FLOOR;
            if !degraded {
                continue;
            }
            if let Ok(Some(_)) = self.scheduler.rotate_from(
                &binding.session_key,
                binding.kind,
                &resource.id,
                RotationTrigger::HealthDegraded,
            ) {
                rotated += 1;
            }
        }
        rotated
    }

    /// Re-validate every live binding against the ledger and emit the mean
    /// consistency score. Violations are reported, never enforced.
    pub fn audit(&self) -> AuditReport {
        let now = self.pool.now();
        let bindings = self.pool.live_bindings();
        let mut sessions = BTreeSet::new();
        let mut total = 0.0;
        let mut violations = 0;

        for binding in &bindings {
            sessions.insert(binding.session_key.as_str());
            let Ok(resource) = self.pool.get(&binding.resource_id) else {
                total += 1.0;
                continue;
            };
            let record = ConsistencyRecord::observe(&binding.session_key, &resource, now);
            let prior = self.ledger.last_for_resource(&resource.id);
            let report = self.validator.validate(
                &self.ledger,
                &binding.session_key,
                prior.as_ref(),
                &ProposedUpdate::from(&record),
            );
            total += report.score;
            if !report.valid {
                violations += report.violations.len();
                self.pool
                    .events()
                    .emit(EngineEvent::ConsistencyViolationDetected {
                        session_key: binding.session_key.clone(),
                        resource_id: resource.id.clone(),
                        violations: report.violations,
                        score: report.score,
                    });
            }
        }

        let score = if bindings.is_empty() {
            1.0
        } else {
            total / bindings.len() as f64
        };
        let report = AuditReport {
            sessions: sessions.len(),
            bindings: bindings.len(),
            violations,
            score,
        };
        info!(
            sessions = report.sessions,
            bindings = report.bindings,
            violations = report.violations,
            score = report.score,
            "Consistency audit"
        );
        self.pool.events().emit(EngineEvent::ConsistencyAudit {
            sessions: report.sessions,
            score: report.score,
        });
        report
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
