//! In-memory resource registry and binding table.
//!
//! Each resource sits behind its own mutex; the id map is only write-locked
//! to insert. Each `(session_key, kind)` has its own binding slot, so bind
//! and rotate for one key are serialized while unrelated keys proceed.
//! Lock order is slot → resource, never the reverse.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use idrs_config::EngineConfig;
use idrs_core::{
    Binding, BindingEnd, BindingKey, BindingReason, Clock, EndedBinding, EngineError, EngineEvent,
    EngineResult, EventSink, HealthState, Resource, ResourceId, ResourceKind, ResourceProfile,
    ResourceStatus, RotationStrategy, RotationTrigger,
};
use idrs_store::{DirtySet, PersistOutcome, SnapshotStore};

use crate::generator::{ProfileGenerator, ResourceHints};
use crate::history::RotationHistory;

/// Weight kept from the previous health score on each probe result.
const HEALTH_EWMA_KEEP: f64 = 0.8;

const DEFAULT_HISTORY_PER_SESSION: usize = 32;
const DEFAULT_HISTORY_SESSIONS: usize = 10_000;

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub strategy: RotationStrategy,
    pub failure_threshold: u32,
    pub quarantine: Duration,
    pub history_per_session: usize,
    /// Sessions whose rotation history is kept.
    pub history_sessions: usize,
}

impl PoolSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            strategy: config.rotation_strategy,
            failure_threshold: config.failure_threshold,
            quarantine: config.quarantine(),
            history_per_session: DEFAULT_HISTORY_PER_SESSION,
            history_sessions: DEFAULT_HISTORY_SESSIONS,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Narrows `list_active`.
#[derive(Clone, Debug, Default)]
pub struct ResourceFilter {
    pub region: Option<String>,
    pub avoid_region: Option<String>,
    pub exclude: Vec<ResourceId>,
}

impl ResourceFilter {
    pub fn matches(&self, resource: &Resource) -> bool {
        if self.exclude.contains(&resource.id) {
            return false;
        }
        let region = resource.region();
        if let Some(wanted) = self.region.as_deref()
            && !region.is_some_and(|r| r.eq_ignore_ascii_case(wanted))
        {
            return false;
        }
        if let Some(avoid) = self.avoid_region.as_deref()
            && region.is_some_and(|r| r.eq_ignore_ascii_case(avoid))
        {
            return false;
        }
        true
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub active: usize,
    pub quarantined: usize,
    pub retired: usize,
    pub compromised: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub kinds: BTreeMap<ResourceKind, KindStats>,
    pub live_bindings: usize,
    pub dirty: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct Entry {
    kind: ResourceKind,
    resource: Arc<Mutex<Resource>>,
}

type Slot = Arc<Mutex<Option<Binding>>>;

pub struct ResourcePool {
    settings: PoolSettings,
    generator: ProfileGenerator,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    resources: RwLock<HashMap<ResourceId, Entry>>,
    slots: Mutex<HashMap<BindingKey, Slot>>,
    history: Mutex<RotationHistory>,
    dirty: Arc<DirtySet>,
    store: Option<SnapshotStore>,
}

/// Exclusive access to one `(session_key, kind)` binding.
pub struct BindingSlot<'a> {
    pool: &'a ResourcePool,
    key: &'a BindingKey,
    current: &'a mut Option<Binding>,
}

impl BindingSlot<'_> {
    pub fn key(&self) -> &BindingKey {
        self.key
    }

    pub fn current(&self) -> Option<&Binding> {
        self.current.as_ref()
    }

    /// The current binding, if its resource is still selectable.
    pub fn usable(&self) -> Option<Binding> {
        let binding = self.current.as_ref()?;
        match self.pool.get(&binding.resource_id) {
            Ok(resource) if resource.status == ResourceStatus::Active => Some(binding.clone()),
            _ => None,
        }
    }

    /// End the current binding (if any) and bind `resource_id`.
    pub fn bind(&mut self, resource_id: &ResourceId, reason: BindingReason) -> EngineResult<Binding> {
        let kind = self.key.kind;
        self.pool.update(resource_id, |r, now| {
            if r.kind() != kind {
                return Err(EngineError::NotFound {
                    what: "Resource",
                    id: format!("{resource_id} ({kind})"),
                });
            }
            if r.status != ResourceStatus::Active {
                return Err(EngineError::Unavailable {
                    id: resource_id.to_string(),
                    status: r.status,
                });
            }
            r.last_used_at = Some(now);
            Ok(())
        })??;

        let now = self.pool.now();
        let binding = Binding {
            session_key: self.key.session_key.clone(),
            resource_id: resource_id.clone(),
            kind,
            bound_at: now,
            reason,
        };
        if let Some(previous) = self.current.replace(binding.clone()) {
            self.pool.history.lock().push(EndedBinding {
                binding: previous,
                ended_at: now,
                end: BindingEnd::Replaced(reason),
            });
        }
        debug!(
            session_key = %self.key.session_key,
            kind = %kind,
            resource_id = %resource_id,
            reason = %reason,
            "Bound resource"
        );
        Ok(binding)
    }

    pub fn release(&mut self) -> Option<Binding> {
        let previous = self.current.take()?;
        self.pool.history.lock().push(EndedBinding {
            binding: previous.clone(),
            ended_at: self.pool.now(),
            end: BindingEnd::Released,
        });
        Some(previous)
    }
}

impl ResourcePool {
    pub fn new(
        settings: PoolSettings,
        generator: ProfileGenerator,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let history = RotationHistory::new(settings.history_per_session, settings.history_sessions);
        Self {
            settings,
            generator,
            clock,
            events,
            resources: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            history: Mutex::new(history),
            dirty: Arc::new(DirtySet::new(false)),
            store: None,
        }
    }

    pub fn with_persistence(mut self, store: SnapshotStore, dirty: Arc<DirtySet>) -> Self {
        self.store = Some(store);
        self.dirty = dirty;
        self
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn dirty(&self) -> &Arc<DirtySet> {
        &self.dirty
    }

    pub fn store(&self) -> Option<&SnapshotStore> {
        self.store.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn entry(&self, id: &ResourceId) -> EngineResult<Arc<Mutex<Resource>>> {
        self.resources
            .read()
            .get(id)
            .map(|e| e.resource.clone())
            .ok_or_else(|| EngineError::resource_not_found(id))
    }

    /// Apply pending time-based transitions. Returns `true` if anything changed.
    fn refresh(&self, resource: &mut Resource, now: DateTime<Utc>) -> bool {
        let deadline = resource.quarantine_until;
        if resource.release_quarantine_if_due(now) {
            info!(resource_id = %resource.id, "Quarantine lifted");
            self.events.emit(EngineEvent::QuarantineLifted {
                id: resource.id.clone(),
            });
            return true;
        }
        deadline != resource.quarantine_until
    }

    /// Mutate one resource under its lock and mark it dirty.
    fn update<T>(
        &self,
        id: &ResourceId,
        f: impl FnOnce(&mut Resource, DateTime<Utc>) -> T,
    ) -> EngineResult<T> {
        let entry = self.entry(id)?;
        let now = self.now();
        let out = {
            let mut resource = entry.lock();
            self.refresh(&mut resource, now);
            f(&mut resource, now)
        };
        self.dirty.mark(id);
        Ok(out)
    }

    /// Add an existing record. Returns `false` if the id is already present.
    pub fn insert(&self, resource: Resource) -> bool {
        let mut resources = self.resources.write();
        if resources.contains_key(&resource.id) {
            return false;
        }
        resources.insert(
            resource.id.clone(),
            Entry {
                kind: resource.kind(),
                resource: Arc::new(Mutex::new(resource)),
            },
        );
        true
    }

    pub fn create(&self, kind: ResourceKind, hints: &ResourceHints) -> EngineResult<Resource> {
        let resource = self.prepare(kind, hints)?;
        self.commit(resource.clone());
        Ok(resource)
    }

    /// Generate a resource without registering it.
    pub fn prepare(&self, kind: ResourceKind, hints: &ResourceHints) -> EngineResult<Resource> {
        self.generator.generate(
            ResourceId::generate(),
            kind,
            hints,
            self.settings.strategy,
            self.now(),
        )
    }

    /// Register a resource returned by [`prepare`](Self::prepare).
    pub fn commit(&self, resource: Resource) {
        let id = resource.id.clone();
        let kind = resource.kind();
        let region = resource.region().map(str::to_string);
        if !self.insert(resource) {
            return;
        }
        self.dirty.mark(&id);
        info!(
            resource_id = %id,
            kind = %kind,
            region = region.as_deref().unwrap_or("-"),
            "Created resource"
        );
        self.events
            .emit(EngineEvent::ResourceCreated { id, kind, region });
    }

    pub fn get(&self, id: &ResourceId) -> EngineResult<Resource> {
        let entry = self.entry(id)?;
        let (snapshot, changed) = {
            let mut resource = entry.lock();
            let changed = self.refresh(&mut resource, self.now());
            (resource.clone(), changed)
        };
        if changed {
            self.dirty.mark(id);
        }
        Ok(snapshot)
    }

    /// Ids of one kind (or all kinds), sorted.
    pub fn ids(&self, kind: Option<ResourceKind>) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self
            .resources
            .read()
            .iter()
            .filter(|(_, e)| kind.is_none_or(|k| e.kind == k))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Lazily yields `Active` resources of `kind` that pass `filter`.
    pub fn list_active(&self, kind: ResourceKind, filter: ResourceFilter) -> ActiveResources<'_> {
        ActiveResources {
            pool: self,
            kind,
            filter,
            ids: self.ids(Some(kind)),
            pos: 0,
        }
    }

    pub fn with_binding_slot<T>(
        &self,
        key: &BindingKey,
        f: impl FnOnce(&mut BindingSlot<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let slot = self.slots.lock().entry(key.clone()).or_default().clone();
        let out = {
            let mut guard = slot.lock();
            let mut handle = BindingSlot {
                pool: self,
                key,
                current: &mut guard,
            };
            f(&mut handle)
        };
        self.prune_slot(key, slot);
        out
    }

    /// Drop an unbound slot from the table once nobody else holds it.
    ///
    /// Slots are only cloned out of the table under its lock, so a count of
    /// two (the table and `slot`) means no other caller can reach it.
    fn prune_slot(&self, key: &BindingKey, slot: Slot) {
        let mut slots = self.slots.lock();
        if Arc::strong_count(&slot) == 2
            && slot.try_lock().is_some_and(|current| current.is_none())
        {
            slots.remove(key);
        }
    }

    /// Keys with a slot in the table.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn bind(
        &self,
        session_key: &str,
        kind: ResourceKind,
        resource_id: &ResourceId,
    ) -> EngineResult<Binding> {
        let key = BindingKey::new(session_key, kind);
        self.with_binding_slot(&key, |slot| {
            let reason = match slot.current() {
                Some(b) if b.resource_id == *resource_id => BindingReason::Reused,
                _ => BindingReason::New,
            };
            slot.bind(resource_id, reason)
        })
    }

    pub fn release(&self, session_key: &str, kind: ResourceKind) -> EngineResult<Binding> {
        let key = BindingKey::new(session_key, kind);
        self.with_binding_slot(&key, |slot| {
            slot.release()
                .ok_or_else(|| EngineError::binding_not_found(session_key, kind))
        })
    }

    pub fn binding(&self, session_key: &str, kind: ResourceKind) -> Option<Binding> {
        let slot = self
            .slots
            .lock()
            .get(&BindingKey::new(session_key, kind))
            .cloned()?;
        let current = slot.lock().clone();
        current
    }

    pub fn live_bindings(&self) -> Vec<Binding> {
        let slots: Vec<Slot> = self.slots.lock().values().cloned().collect();
        let mut bindings: Vec<Binding> = slots.iter().filter_map(|s| s.lock().clone()).collect();
        bindings.sort_by(|a, b| a.key().cmp(&b.key()));
        bindings
    }

    pub fn bindings_for_resource(&self, id: &ResourceId) -> Vec<Binding> {
        self.live_bindings()
            .into_iter()
            .filter(|b| b.resource_id == *id)
            .collect()
    }

    pub fn rotation_history(&self, session_key: &str) -> Vec<EndedBinding> {
        self.history.lock().for_session(session_key)
    }

    pub fn mark_failed(&self, id: &ResourceId) -> EngineResult<HealthState> {
        let threshold = self.settings.failure_threshold;
        let window = self.settings.quarantine;
        let (health, quarantined_until) = self.update(id, |r, now| {
            r.health.consecutive_failures = r.health.consecutive_failures.saturating_add(1);
            r.health.score *= HEALTH_EWMA_KEEP;
            r.health.last_checked_at = Some(now);
            let mut until = None;
            if r.status == ResourceStatus::Active && r.health.consecutive_failures >= threshold {
                r.status = ResourceStatus::Quarantined;
                r.quarantined_at = Some(now);
                r.quarantine_until = Some(now + window);
                until = r.quarantine_until;
            }
            (r.health.clone(), until)
        })?;
        if let Some(until) = quarantined_until {
            warn!(
                resource_id = %id,
                failures = health.consecutive_failures,
                until = %until,
                "Resource quarantined"
            );
            self.events.emit(EngineEvent::ResourceQuarantined {
                id: id.clone(),
                until,
            });
        }
        Ok(health)
    }

    pub fn mark_healthy(&self, id: &ResourceId, response_ms: u64) -> EngineResult<HealthState> {
        self.update(id, |r, now| {
            r.health.consecutive_failures = 0;
            r.health.score = HEALTH_EWMA_KEEP * r.health.score + (1.0 - HEALTH_EWMA_KEEP);
            r.health.last_checked_at = Some(now);
            r.health.last_response_ms = Some(response_ms);
            r.health.clone()
        })
    }

    /// Count one session outcome against the resource.
    pub fn record_usage(&self, id: &ResourceId, success: bool) -> EngineResult<Resource> {
        self.update(id, |r, now| {
            r.usage.record_session(now, success);
            r.last_used_at = Some(now);
            r.clone()
        })
    }

    pub fn record_detection(&self, id: &ResourceId) -> EngineResult<Resource> {
        let resource = self.update(id, |r, now| {
            r.record_detection(now);
            r.clone()
        })?;
        debug!(resource_id = %id, recent = resource.detections.len(), "Detection recorded");
        Ok(resource)
    }

    /// Replace the kind-specific profile. The kind cannot change.
    pub fn update_profile(&self, id: &ResourceId, profile: ResourceProfile) -> EngineResult<Resource> {
        self.update(id, |r, _| {
            if r.kind() != profile.kind() {
                return Err(EngineError::Generation {
                    kind: r.kind(),
                    reason: format!("cannot replace profile with a {} profile", profile.kind()),
                });
            }
            r.profile = profile;
            Ok(r.clone())
        })?
    }

    /// Move a replaced resource to its terminal status.
    pub fn dispose(
        &self,
        id: &ResourceId,
        status: ResourceStatus,
        trigger: RotationTrigger,
    ) -> EngineResult<()> {
        self.update(id, |r, now| {
            r.status = status;
            r.retired_at = Some(now);
            r.quarantined_at = None;
            r.quarantine_until = None;
            if status == ResourceStatus::Compromised && r.last_detection_at.is_none() {
                r.last_detection_at = Some(now);
            }
        })?;
        info!(resource_id = %id, status = %status, trigger = %trigger, "Resource retired");
        self.events.emit(EngineEvent::ResourceRetired {
            id: id.clone(),
            status,
            trigger,
        });
        Ok(())
    }

    /// Record `successor` as the next generation after `predecessor`.
    pub fn link_successor(
        &self,
        predecessor: &ResourceId,
        successor: &ResourceId,
    ) -> EngineResult<()> {
        let generation = self.update(predecessor, |r, now| {
            r.rotation.last_rotated_at = Some(now);
            r.rotation.generation
        })?;
        self.update(successor, |r, now| {
            r.rotation.generation = r.rotation.generation.max(generation.saturating_add(1));
            r.rotation.predecessor = Some(predecessor.clone());
            r.rotation.last_rotated_at = Some(now);
        })
    }

    pub fn stats(&self) -> PoolStats {
        let entries: Vec<(ResourceKind, Arc<Mutex<Resource>>)> = self
            .resources
            .read()
            .values()
            .map(|e| (e.kind, e.resource.clone()))
            .collect();
        let now = self.now();
        let mut stats = PoolStats::default();
        for kind in ResourceKind::ALL {
            stats.kinds.insert(kind, KindStats::default());
        }
        for (kind, resource) in entries {
            let status = {
                let mut r = resource.lock();
                self.refresh(&mut r, now);
                r.status
            };
            let counts = stats.kinds.entry(kind).or_default();
            match status {
                ResourceStatus::Active => counts.active += 1,
                ResourceStatus::Quarantined => counts.quarantined += 1,
                ResourceStatus::Retired => counts.retired += 1,
                ResourceStatus::Compromised => counts.compromised += 1,
            }
        }
        stats.live_bindings = self.live_bindings().len();
        stats.dirty = self.dirty.len();
        stats
    }

    /// Insert every snapshot found on disk. Returns the number added.
    pub fn load_from_store(&self) -> anyhow::Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load_all()?;
        let added = loaded.into_iter().filter(|r| self.insert(r.clone())).count();
        info!(count = added, dir = %store.dir().display(), "Loaded resources from snapshots");
        Ok(added)
    }

    /// Persist one resource immediately.
    pub fn persist(&self, id: &ResourceId) -> EngineResult<PersistOutcome> {
        let Some(store) = &self.store else {
            return Ok(PersistOutcome::Skipped);
        };
        let snapshot = self.entry(id)?.lock().clone();
        store
            .persist(&snapshot)
            .map_err(|e| EngineError::Persistence {
                id: id.to_string(),
                message: format!("{e:#}"),
            })
    }

    /// Write every dirty resource. Failures stay dirty for the next pass.
    pub fn flush(&self) -> FlushReport {
        let ids = self.dirty.drain();
        let mut report = FlushReport::default();
        if self.store.is_none() {
            return report;
        }
        let mut retry = Vec::new();
        for id in ids {
            match self.persist(&id) {
                Ok(PersistOutcome::Written) => report.written += 1,
                Ok(PersistOutcome::Skipped) => {
                    report.skipped += 1;
                    retry.push(id);
                }
                Err(EngineError::NotFound { .. }) => {}
                Err(error) => {
                    warn!(resource_id = %id, %error, "Persist failed, will retry");
                    report.failed += 1;
                    retry.push(id);
                }
            }
        }
        self.dirty.restore(retry);
        if report.written + report.skipped + report.failed > 0 {
            debug!(
                written = report.written,
                skipped = report.skipped,
                failed = report.failed,
                "Flushed dirty resources"
            );
        }
        report
    }
}

/// Iterator returned by [`ResourcePool::list_active`].
///
/// Ids are captured up front; each resource is read when reached, so
/// status changes made meanwhile are honoured. `restart` re-captures ids.
pub struct ActiveResources<'a> {
    pool: &'a ResourcePool,
    kind: ResourceKind,
    filter: ResourceFilter,
    ids: Vec<ResourceId>,
    pos: usize,
}

impl ActiveResources<'_> {
    pub fn restart(&mut self) {
        self.ids = self.pool.ids(Some(self.kind));
        self.pos = 0;
    }
}

impl Iterator for ActiveResources<'_> {
    type Item = Resource;

    fn next(&mut self) -> Option<Resource> {
        while let Some(id) = self.ids.get(self.pos) {
            self.pos += 1;
            let Ok(resource) = self.pool.get(id) else {
                continue;
            };
            if resource.status == ResourceStatus::Active && self.filter.matches(&resource) {
                return Some(resource);
            }
        }
        None
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
