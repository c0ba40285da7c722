//! Public facade.
//!
//! `Engine` wires the pool, store, validator, scheduler and health monitor
//! from one `EngineConfig` and owns the background tasks. Foreground calls
//! are synchronous; only start, flush and shutdown suspend.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use idrs_config::{EngineConfig, PersistenceMode};
use idrs_consistency::{
    BehaviorCheck, ConsistencyLedger, ConsistencyRecord, ConsistencyValidator, ProposedUpdate,
    ValidatorSettings,
};
use idrs_core::{
    Binding, BrowserContext, Clock, EndedBinding, EngineError, EngineEvent, EngineResult,
    EventSink, HashedRngSource, ProxyConfig, Resource, ResourceId, ResourceKind, ResourceProfile,
    RngSource, SystemClock, TracingEventSink, TransportBundle,
};
use idrs_pool::{FlushReport, PoolSettings, PoolStats, ProfileGenerator, ResourcePool};
use idrs_store::{AesGcmCipher, Cipher, DirtySet, SnapshotStore};

use crate::health::{HealthMonitor, Prober, TcpProber};
use crate::rotation::RotationScheduler;
use crate::selector::{AcquireRequest, Selector};
use crate::tasks::{BackgroundTasks, jittered};

/// What happened in a session that used a bound resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Success,
    Failure,
    /// The target flagged the session as automated.
    Detected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every background task finished before the timeout.
    pub tasks_stopped: bool,
    pub flush: FlushReport,
    /// Nothing is left dirty (always true without persistence).
    pub drained: bool,
}

pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    rng: Option<Arc<dyn RngSource>>,
    events: Option<Arc<dyn EventSink>>,
    prober: Option<Arc<dyn Prober>>,
    cipher: Option<Arc<dyn Cipher>>,
    behavior: Option<Arc<dyn BehaviorCheck>>,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn rng(mut self, rng: Arc<dyn RngSource>) -> Self {
        self.rng = Some(rng);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Overrides the AES-GCM cipher derived from `encryption_key`.
    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn behavior_check(mut self, behavior: Arc<dyn BehaviorCheck>) -> Self {
        self.behavior = Some(behavior);
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| EngineError::Config(format!("{e:#}")))?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let rng: Arc<dyn RngSource> = match self.rng {
            Some(rng) => rng,
            None => Arc::new(HashedRngSource::default()),
        };
        let events: Arc<dyn EventSink> = match self.events {
            Some(events) => events,
            None => Arc::new(TracingEventSink),
        };
        let prober: Arc<dyn Prober> = match self.prober {
            Some(prober) => prober,
            None => Arc::new(TcpProber),
        };

        let generator = ProfileGenerator::new(config.proxy_upstreams.clone(), rng.clone());
        let mut pool =
            ResourcePool::new(PoolSettings::from_config(&config), generator, clock, events);
        if config.persistence_mode.is_durable() {
            let dir = config
                .resolved_data_directory()
                .ok_or_else(|| EngineError::Config("no data directory available".into()))?;
            let cipher: Option<Arc<dyn Cipher>> = match self.cipher {
                Some(cipher) => Some(cipher),
                None if config.encryption_enabled => {
                    let key = config.encryption_key.as_deref().ok_or_else(|| {
                        EngineError::Config("encryption enabled without a key".into())
                    })?;
                    let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::from_secret(key));
                    Some(cipher)
                }
                None => None,
            };
            let eager = config.persistence_mode == PersistenceMode::File;
            pool = pool.with_persistence(
                SnapshotStore::new(dir, cipher),
                Arc::new(DirtySet::new(eager)),
            );
        }
        let pool = Arc::new(pool);

        let mut validator = ConsistencyValidator::new(ValidatorSettings::from_config(&config));
        if let Some(behavior) = self.behavior {
            validator = validator.with_behavior_check(behavior);
        }
        let validator = Arc::new(validator);
        let ledger = Arc::new(ConsistencyLedger::default());
        let config = Arc::new(config);

        let selector = Arc::new(Selector::new(
            pool.clone(),
            validator.clone(),
            ledger.clone(),
            rng.clone(),
            config.clone(),
        ));
        let scheduler = Arc::new(RotationScheduler::new(selector.clone()));
        let health = Arc::new(HealthMonitor::new(
            pool.clone(),
            scheduler.clone(),
            validator.clone(),
            ledger.clone(),
            prober,
            config.probe_timeout(),
        ));

        info!(
            mode = ?config.persistence_mode,
            strategy = ?config.rotation_strategy,
            level = ?config.consistency_level,
            encrypted = pool.store().is_some_and(SnapshotStore::is_encrypted),
            "Engine built"
        );
        Ok(Engine {
            config,
            pool,
            validator,
            ledger,
            selector,
            scheduler,
            health,
            rng,
            started: AtomicBool::new(false),
            tasks: Mutex::new(None),
        })
    }
}

pub struct Engine {
    config: Arc<EngineConfig>,
    pool: Arc<ResourcePool>,
    validator: Arc<ConsistencyValidator>,
    ledger: Arc<ConsistencyLedger>,
    selector: Arc<Selector>,
    scheduler: Arc<RotationScheduler>,
    health: Arc<HealthMonitor>,
    rng: Arc<dyn RngSource>,
    started: AtomicBool,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            clock: None,
            rng: None,
            events: None,
            prober: None,
            cipher: None,
            behavior: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    pub fn ledger(&self) -> &Arc<ConsistencyLedger> {
        &self.ledger
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn scheduler(&self) -> &Arc<RotationScheduler> {
        &self.scheduler
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Restore snapshots (durable modes) and spawn the background tasks.
    /// Calling it again while running is a no-op.
    pub async fn start(&self) -> EngineResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Engine already started");
            return Ok(());
        }

        if let Some(store) = self.pool.store() {
            let dir = store.dir().display().to_string();
            let pool = self.pool.clone();
            let loaded = tokio::task::spawn_blocking(move || pool.load_from_store())
                .await
                .map_err(|e| EngineError::Persistence {
                    id: dir.clone(),
                    message: e.to_string(),
                })?
                .map_err(|e| EngineError::Persistence {
                    id: dir,
                    message: format!("{e:#}"),
                })?;
            debug!(loaded, "Restored resources");
        }

        let intervals = &self.config.intervals;
        let jitter = intervals.jitter;
        let mut tasks = BackgroundTasks::new(self.rng.clone());

        let scheduler = self.scheduler.clone();
        tasks.spawn_periodic(
            "rotation_sweep",
            Duration::from_secs(intervals.rotation_sweep_secs),
            jitter,
            move || {
                let scheduler = scheduler.clone();
                async move {
                    scheduler.sweep();
                }
            },
        );

        let health = self.health.clone();
        tasks.spawn_periodic(
            "health_probe",
            Duration::from_secs(intervals.health_probe_secs),
            jitter,
            move || {
                let health = health.clone();
                async move {
                    health.probe_all().await;
                }
            },
        );

        let health = self.health.clone();
        tasks.spawn_periodic(
            "consistency_audit",
            Duration::from_secs(intervals.audit_secs),
            jitter,
            move || {
                let health = health.clone();
                async move {
                    health.audit();
                }
            },
        );

        if self.pool.store().is_some() {
            tasks.spawn(flush_loop(
                self.pool.clone(),
                tasks.token(),
                FlushSchedule {
                    period: Duration::from_secs(intervals.flush_secs),
                    jitter,
                    timeout: self.config.shutdown_timeout(),
                    rng: tasks.rng().clone(),
                },
            ));
        }

        info!(tasks = tasks.len(), "Engine started");
        *self.tasks.lock() = Some(tasks);
        Ok(())
    }

    /// Bind (or reuse) a resource for the request's session and kind.
    pub fn acquire(&self, request: AcquireRequest) -> EngineResult<Binding> {
        self.selector.acquire(&request)
    }

    /// End a binding without retiring its resource.
    pub fn release(&self, session_key: &str, kind: ResourceKind) -> EngineResult<Binding> {
        self.pool.release(session_key, kind)
    }

    pub fn get(&self, id: &ResourceId) -> EngineResult<Resource> {
        self.pool.get(id)
    }

    /// Record how a session went on its bound resource, then re-check the
    /// rotation triggers for that binding. Returns the replacement binding
    /// if one was made.
    pub fn report_outcome(
        &self,
        session_key: &str,
        kind: ResourceKind,
        outcome: SessionOutcome,
    ) -> EngineResult<Option<Binding>> {
        let binding = self
            .pool
            .binding(session_key, kind)
            .ok_or_else(|| EngineError::binding_not_found(session_key, kind))?;
        let id = &binding.resource_id;
        match outcome {
            SessionOutcome::Success => {
                self.pool.record_usage(id, true)?;
            }
            SessionOutcome::Failure => {
                self.pool.record_usage(id, false)?;
            }
            SessionOutcome::Detected => {
                self.pool.record_usage(id, false)?;
                self.pool.record_detection(id)?;
            }
        }
        self.scheduler.after_usage(session_key, kind)
    }

    /// Replace a resource's profile after checking fingerprint drift
    /// against the resource's last recorded state.
    ///
    /// In strict mode a violation rejects the update and nothing changes.
    pub fn update_profile(
        &self,
        session_key: &str,
        id: &ResourceId,
        profile: ResourceProfile,
    ) -> EngineResult<Resource> {
        let resource = self.pool.get(id)?;
        if resource.kind() != profile.kind() {
            return Err(EngineError::Generation {
                kind: resource.kind(),
                reason: format!("cannot replace profile with a {} profile", profile.kind()),
            });
        }

        let now = self.pool.now();
        let prior = self
            .ledger
            .last_for_resource(id)
            .unwrap_or_else(|| ConsistencyRecord::observe(session_key, &resource, now));
        let proposed = ProposedUpdate {
            geolocation: resource.geolocation.clone(),
            fingerprint: Some(profile.fingerprint()),
            at: now,
        };
        let report = self
            .validator
            .validate(&self.ledger, session_key, Some(&prior), &proposed);
        if !report.valid {
            self.pool
                .events()
                .emit(EngineEvent::ConsistencyViolationDetected {
                    session_key: session_key.to_string(),
                    resource_id: id.clone(),
                    violations: report.violations.clone(),
                    score: report.score,
                });
            self.validator.enforce(&report)?;
        }

        let updated = self.pool.update_profile(id, profile)?;
        self.ledger
            .append(ConsistencyRecord::observe(session_key, &updated, now));
        Ok(updated)
    }

    /// Proxy and browser context for the session's bound resources.
    pub fn transport(&self, session_key: &str) -> TransportBundle {
        let bound = |kind: ResourceKind| {
            self.pool
                .binding(session_key, kind)
                .and_then(|b| self.pool.get(&b.resource_id).ok())
        };
        let proxy = bound(ResourceKind::Proxy);
        let device = bound(ResourceKind::Device);
        let identity = bound(ResourceKind::SessionIdentity);

        TransportBundle {
            proxy: proxy.as_ref().and_then(|r| match &r.profile {
                ResourceProfile::Proxy(p) => Some(ProxyConfig::from(p)),
                _ => None,
            }),
            context: BrowserContext::derive(identity.as_ref(), device.as_ref(), proxy.as_ref()),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn rotation_history(&self, session_key: &str) -> Vec<EndedBinding> {
        self.pool.rotation_history(session_key)
    }

    /// Persist every dirty resource now.
    pub async fn flush(&self) -> FlushReport {
        flush_blocking(&self.pool).await.unwrap_or_default()
    }

    /// Stop the background tasks, then drain dirty resources to disk. Both
    /// steps are bounded by `shutdown_timeout_secs`.
    pub async fn shutdown(&self) -> ShutdownReport {
        let timeout = self.config.shutdown_timeout();
        let mut report = ShutdownReport {
            tasks_stopped: true,
            ..Default::default()
        };

        let tasks = self.tasks.lock().take();
        if let Some(mut tasks) = tasks {
            report.tasks_stopped = tasks.shutdown(timeout).await;
        }

        if self.pool.store().is_some() {
            if let Some(flush) = bounded("shutdown", timeout, flush_blocking(&self.pool)).await {
                report.flush = flush;
            }
            report.drained = self.pool.dirty().is_empty();
        } else {
            report.drained = true;
        }

        self.started.store(false, Ordering::SeqCst);
        info!(
            tasks_stopped = report.tasks_stopped,
            written = report.flush.written,
            drained = report.drained,
            "Engine stopped"
        );
        report
    }
}

async fn flush_blocking(pool: &Arc<ResourcePool>) -> Option<FlushReport> {
    let pool = pool.clone();
    match tokio::task::spawn_blocking(move || pool.flush()).await {
        Ok(report) => Some(report),
        Err(e) => {
            warn!("Flush task join error: {}", e);
            None
        }
    }
}

/// Await a flush for at most `timeout`. The blocking write keeps running
/// after a timeout; its resources stay dirty until a later pass succeeds.
async fn bounded(
    what: &'static str,
    timeout: Duration,
    flush: impl Future<Output = Option<FlushReport>>,
) -> Option<FlushReport> {
    match tokio::time::timeout(timeout, flush).await {
        Ok(report) => report,
        Err(_) => {
            warn!(flush = what, timeout_ms = timeout.as_millis() as u64, "Flush timed out");
            None
        }
    }
}

struct FlushSchedule {
    period: Duration,
    jitter: f64,
    timeout: Duration,
    rng: Arc<dyn RngSource>,
}

/// Periodic flush. In `file` mode every mutation also wakes it early.
async fn flush_loop(pool: Arc<ResourcePool>, token: CancellationToken, schedule: FlushSchedule) {
    let dirty = pool.dirty().clone();
    let eager = dirty.is_eager();
    let mut rng = schedule.rng.for_selection();
    loop {
        let delay = jittered(schedule.period, schedule.jitter, &mut rng);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
            _ = dirty.notified(), if eager => {}
        }
        bounded("periodic", schedule.timeout, flush_blocking(&pool)).await;
    }
    debug!("Flush task stopped");
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
