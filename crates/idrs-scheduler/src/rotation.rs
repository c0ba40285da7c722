//! Rotation triggers and all-or-nothing replacement.
//!
//! A rotation runs inside the binding slot of the session being rotated,
//! so it is serialized with foreground `acquire` for the same key. When no
//! replacement can be found the binding is left as it was and the work is
//! queued for the next sweep.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use idrs_config::EngineConfig;
use idrs_core::{
    Binding, BindingKey, BindingReason, EngineError, EngineEvent, EngineResult, Resource,
    ResourceId, ResourceKind, ResourceStatus, RotationStrategy, RotationTrigger,
};
use idrs_pool::{BindingSlot, ResourcePool};

use crate::selector::{SelectionPlan, Selector};

const DETECTION_WINDOW_HOURS: i64 = 1;
const HEALTH_FLOOR: f64 = 0.3;
const ADAPTIVE_MIN_SESSIONS: u64 = 5;
const ADAPTIVE_WINDOW_HOURS: i64 = 24;

/// Triggers checked for a bound resource, first match wins.
///
/// Detection always leads; the strategy's dominant trigger comes next.
/// Adaptive optimization is only considered under the adaptive strategy.
pub fn trigger_order(strategy: RotationStrategy) -> Vec<RotationTrigger> {
    use RotationTrigger::{AdaptiveOptimization, AgeLimit, DetectionPattern, HealthDegraded, UsageLimit};
    match strategy {
        RotationStrategy::TimeBased => vec![DetectionPattern, AgeLimit, HealthDegraded, UsageLimit],
        RotationStrategy::UsageBased => vec![DetectionPattern, UsageLimit, HealthDegraded, AgeLimit],
        RotationStrategy::DetectionBased => {
            vec![DetectionPattern, HealthDegraded, UsageLimit, AgeLimit]
        }
        RotationStrategy::Adaptive => vec![
            DetectionPattern,
            HealthDegraded,
            UsageLimit,
            AgeLimit,
            AdaptiveOptimization,
        ],
    }
}

/// A rotation that could not complete and will be retried.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingRotation {
    pub trigger: RotationTrigger,
    pub key: BindingKey,
    /// Resource the rotation was meant to replace. If the session has moved
    /// on to something else, the entry is dropped.
    pub from: ResourceId,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub rotated: usize,
    pub failed: usize,
    pub deferred: usize,
    pub dropped: usize,
}

pub struct RotationScheduler {
    pool: Arc<ResourcePool>,
    selector: Arc<Selector>,
    config: Arc<EngineConfig>,
    order: Vec<RotationTrigger>,
    pending: Mutex<BTreeSet<PendingRotation>>,
}

impl RotationScheduler {
    pub fn new(selector: Arc<Selector>) -> Self {
        let config = selector.config().clone();
        Self {
            pool: selector.pool().clone(),
            order: trigger_order(config.rotation_strategy),
            selector,
            config,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn pending(&self) -> Vec<PendingRotation> {
        self.pending.lock().iter().cloned().collect()
    }

    /// The trigger that should rotate `resource` out, if any.
    pub fn evaluate(&self, resource: &Resource, now: DateTime<Utc>) -> Option<RotationTrigger> {
        if resource.status == ResourceStatus::Compromised {
            return Some(RotationTrigger::DetectionPattern);
        }
        if let Some(trigger) = self
            .order
            .iter()
            .copied()
            .find(|t| self.fires(*t, resource, now))
        {
            return Some(trigger);
        }
        match resource.status {
            ResourceStatus::Quarantined => Some(RotationTrigger::HealthDegraded),
            // Retired under another session that shared it.
            ResourceStatus::Retired => Some(RotationTrigger::Scheduled),
            _ => None,
        }
    }

    fn fires(&self, trigger: RotationTrigger, resource: &Resource, now: DateTime<Utc>) -> bool {
        match trigger {
            RotationTrigger::DetectionPattern => {
                let since = now - Duration::hours(DETECTION_WINDOW_HOURS);
                resource.detections_since(since) >= self.config.detection_threshold as usize
            }
            RotationTrigger::HealthDegraded => resource.health.score < HEALTH_FLOOR,
            RotationTrigger::UsageLimit => resource.usage.session_count >= self.config.max_usage,
            RotationTrigger::AgeLimit => resource.age(now) > self.config.max_age(),
            RotationTrigger::AdaptiveOptimization => {
                let window = now - Duration::hours(ADAPTIVE_WINDOW_HOURS);
                resource.usage.session_count >= ADAPTIVE_MIN_SESSIONS
                    && resource
                        .usage
                        .last_success_at
                        .is_none_or(|at| at < window)
                    && resource.last_used_at.is_some_and(|at| at >= window)
            }
            RotationTrigger::Scheduled => false,
        }
    }

    /// Replace the resource bound to `(session_key, kind)`.
    ///
    /// On success the old resource is linked to its successor and moved to
    /// the trigger's disposition. On failure nothing changes and the
    /// rotation is queued.
    pub fn rotate(
        &self,
        session_key: &str,
        kind: ResourceKind,
        trigger: RotationTrigger,
    ) -> EngineResult<Binding> {
        self.rotate_inner(session_key, kind, trigger, None)?
            .ok_or_else(|| EngineError::binding_not_found(session_key, kind))
    }

    /// Like [`rotate`](Self::rotate), but only if `from` is still the bound
    /// resource.
    ///
    /// Returns `Ok(None)` and leaves the slot alone when the session was
    /// released or rebound after `trigger` was evaluated against `from`.
    pub fn rotate_from(
        &self,
        session_key: &str,
        kind: ResourceKind,
        from: &ResourceId,
        trigger: RotationTrigger,
    ) -> EngineResult<Option<Binding>> {
        self.rotate_inner(session_key, kind, trigger, Some(from))
    }

    fn rotate_inner(
        &self,
        session_key: &str,
        kind: ResourceKind,
        trigger: RotationTrigger,
        expected: Option<&ResourceId>,
    ) -> EngineResult<Option<Binding>> {
        let key = BindingKey::new(session_key, kind);
        let mut from: Option<ResourceId> = None;
        let result = self.pool.with_binding_slot(&key, |slot| {
            let current = match (slot.current(), expected) {
                (Some(current), Some(expected)) if current.resource_id != *expected => {
                    debug!(
                        session_key,
                        kind = %kind,
                        expected = %expected,
                        bound = %current.resource_id,
                        "Binding moved on, rotation skipped"
                    );
                    return Ok(None);
                }
                (None, Some(_)) => return Ok(None),
                (Some(current), _) => current.clone(),
                (None, None) => return Err(EngineError::binding_not_found(session_key, kind)),
            };
            from = Some(current.resource_id.clone());
            let old = self.pool.get(&current.resource_id)?;

            let binding = self.replace(slot, &old, trigger)?;
            self.pool.link_successor(&old.id, &binding.resource_id)?;
            if let Some(status) = trigger.disposition()
                && !self.pool.get(&old.id)?.status.is_terminal()
            {
                self.pool.dispose(&old.id, status, trigger)?;
            }
            Ok(Some((old.id, binding)))
        });

        match result {
            Ok(Some((old_id, binding))) => {
                self.pending.lock().retain(|p| p.key != key);
                info!(
                    session_key,
                    kind = %kind,
                    from = %old_id,
                    to = %binding.resource_id,
                    trigger = %trigger,
                    "Rotated resource"
                );
                self.pool.events().emit(EngineEvent::ResourceRotated {
                    session_key: session_key.to_string(),
                    kind,
                    from: old_id,
                    to: binding.resource_id.clone(),
                    trigger,
                });
                Ok(Some(binding))
            }
            Ok(None) => Ok(None),
            Err(error) => {
                if let Some(from) = from {
                    warn!(
                        session_key,
                        kind = %kind,
                        trigger = %trigger,
                        %error,
                        "Rotation failed, re-queued"
                    );
                    self.pending.lock().insert(PendingRotation { trigger, key, from });
                }
                Err(error)
            }
        }
    }

    fn replace(
        &self,
        slot: &mut BindingSlot<'_>,
        old: &Resource,
        trigger: RotationTrigger,
    ) -> EngineResult<Binding> {
        let region = old.region().map(str::to_string);
        let reason = BindingReason::Rotated(trigger);
        let exclude = vec![old.id.clone()];

        if trigger != RotationTrigger::DetectionPattern {
            let plan = SelectionPlan {
                region,
                avoid_region: None,
                exclude,
                reason,
            };
            return self.selector.select_into(slot, &plan);
        }

        // Detection: move away from the old region when that is possible.
        if region.is_some() {
            let plan = SelectionPlan {
                region: None,
                avoid_region: region,
                exclude: exclude.clone(),
                reason,
            };
            match self.selector.select_into(slot, &plan) {
                Ok(binding) => return Ok(binding),
                Err(
                    error @ (EngineError::Exhaustion { .. }
                    | EngineError::ConsistencyViolation { .. }),
                ) => {
                    debug!(resource_id = %old.id, %error, "No replacement outside the old region");
                }
                Err(error) => return Err(error),
            }
        }
        let plan = SelectionPlan {
            region: None,
            avoid_region: None,
            exclude,
            reason,
        };
        self.selector.select_into(slot, &plan)
    }

    /// Re-evaluate one binding after its usage counters changed.
    ///
    /// Returns the new binding when a rotation happened. A failed rotation
    /// is queued, not reported.
    pub fn after_usage(&self, session_key: &str, kind: ResourceKind) -> EngineResult<Option<Binding>> {
        let binding = self
            .pool
            .binding(session_key, kind)
            .ok_or_else(|| EngineError::binding_not_found(session_key, kind))?;
        let resource = self.pool.get(&binding.resource_id)?;
        let Some(trigger) = self.evaluate(&resource, self.pool.now()) else {
            return Ok(None);
        };
        Ok(self
            .rotate_from(session_key, kind, &resource.id, trigger)
            .ok()
            .flatten())
    }

    /// One periodic pass: queued rotations first, then every live binding.
    ///
    /// Adaptive optimizations are deferred when anything more urgent is due
    /// in the same pass. Failures are isolated per binding.
    pub fn sweep(&self) -> SweepReport {
        let now = self.pool.now();
        let mut report = SweepReport::default();

        let mut retry: BTreeMap<BindingKey, Due> = BTreeMap::new();
        let queued = std::mem::take(&mut *self.pending.lock());
        for pending in queued {
            match self
                .pool
                .binding(&pending.key.session_key, pending.key.kind)
            {
                Some(current) if current.resource_id == pending.from => {
                    upsert(&mut retry, pending.key, pending.trigger, pending.from);
                }
                _ => report.dropped += 1,
            }
        }

        let mut fresh: BTreeMap<BindingKey, Due> = BTreeMap::new();
        for binding in self.pool.live_bindings() {
            let Ok(resource) = self.pool.get(&binding.resource_id) else {
                continue;
            };
            let Some(trigger) = self.evaluate(&resource, now) else {
                continue;
            };
            let key = binding.key();
            if retry.contains_key(&key) {
                upsert(&mut retry, key, trigger, resource.id);
            } else {
                fresh.insert(key, (trigger, resource.id));
            }
        }

        let work: Vec<(RotationTrigger, BindingKey, ResourceId)> = by_priority(retry)
            .into_iter()
            .chain(by_priority(fresh))
            .collect();
        let urgent = work
            .iter()
            .any(|(t, _, _)| *t < RotationTrigger::AdaptiveOptimization);

        for (trigger, key, from) in work {
            if trigger == RotationTrigger::AdaptiveOptimization && urgent {
                report.deferred += 1;
                continue;
            }
            match self.rotate_from(&key.session_key, key.kind, &from, trigger) {
                Ok(Some(_)) => report.rotated += 1,
                Ok(None) => report.dropped += 1,
                Err(_) => report.failed += 1,
            }
        }

        if report != SweepReport::default() {
            info!(
                rotated = report.rotated,
                failed = report.failed,
                deferred = report.deferred,
                dropped = report.dropped,
                "Rotation sweep finished"
            );
        }
        report
    }
}

/// Trigger due for a key and the resource it was evaluated against.
type Due = (RotationTrigger, ResourceId);

fn upsert(
    map: &mut BTreeMap<BindingKey, Due>,
    key: BindingKey,
    trigger: RotationTrigger,
    from: ResourceId,
) {
    map.entry(key)
        .and_modify(|(t, f)| {
            if trigger < *t {
                *t = trigger;
                *f = from.clone();
            }
        })
        .or_insert((trigger, from));
}

fn by_priority(map: BTreeMap<BindingKey, Due>) -> Vec<(RotationTrigger, BindingKey, ResourceId)> {
    let mut work: Vec<(RotationTrigger, BindingKey, ResourceId)> = map
        .into_iter()
        .map(|(key, (trigger, from))| (trigger, key, from))
        .collect();
    work.sort();
    work
}

#[cfg(test)]
#[path = "rotation_tests.rs"]
mod tests;
