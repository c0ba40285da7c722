//! Candidate ranking, consistency vetting and binding.
//!
//! Everything here runs inside a held binding slot, so a selection for one
//! `(session_key, kind)` is never interleaved with another bind or rotation
//! for the same key.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use idrs_config::EngineConfig;
use idrs_consistency::{
    ConsistencyLedger, ConsistencyRecord, ConsistencyValidator, ProposedUpdate,
};
use idrs_core::regions;
use idrs_core::{
    Binding, BindingKey, BindingReason, EngineError, EngineEvent, EngineResult, Resource,
    ResourceId, ResourceKind, ResourceProfile, RngSource, ViolationKind,
};
use idrs_pool::{
    BindingSlot, ResourceFilter, ResourceHints, ResourcePool, ScoreContext, scoring, selection,
};

/// A caller asking for a resource for one session.
#[derive(Clone, Debug)]
pub struct AcquireRequest {
    pub session_key: String,
    pub kind: ResourceKind,
    /// Hard region requirement (ISO alpha-2).
    pub region: Option<String>,
    /// Never hand back the currently bound resource.
    pub force_new: bool,
}

impl AcquireRequest {
    pub fn new(session_key: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            session_key: session_key.into(),
            kind,
            region: None,
            force_new: false,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_force_new(mut self, force_new: bool) -> Self {
        self.force_new = force_new;
        self
    }
}

/// Constraints for one selection inside a held slot.
#[derive(Clone, Debug)]
pub struct SelectionPlan {
    pub region: Option<String>,
    pub avoid_region: Option<String>,
    pub exclude: Vec<ResourceId>,
    pub reason: BindingReason,
}

enum Vetted {
    Bound(Binding),
    Rejected(Vec<ViolationKind>),
    /// The candidate changed status between listing and binding.
    Gone,
}

pub struct Selector {
    pool: Arc<ResourcePool>,
    validator: Arc<ConsistencyValidator>,
    ledger: Arc<ConsistencyLedger>,
    rng: Arc<dyn RngSource>,
    config: Arc<EngineConfig>,
}

impl Selector {
    pub fn new(
        pool: Arc<ResourcePool>,
        validator: Arc<ConsistencyValidator>,
        ledger: Arc<ConsistencyLedger>,
        rng: Arc<dyn RngSource>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            pool,
            validator,
            ledger,
            rng,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    pub fn validator(&self) -> &Arc<ConsistencyValidator> {
        &self.validator
    }

    pub fn ledger(&self) -> &Arc<ConsistencyLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Return the session's usable binding, or select and bind a new one.
    pub fn acquire(&self, request: &AcquireRequest) -> EngineResult<Binding> {
        if let Some(code) = request.region.as_deref()
            && regions::lookup(code).is_none()
        {
            return Err(EngineError::Generation {
                kind: request.kind,
                reason: format!("unsupported region '{code}'"),
            });
        }

        let key = BindingKey::new(request.session_key.clone(), request.kind);
        self.pool.with_binding_slot(&key, |slot| {
            if !request.force_new
                && let Some(current) = slot.usable()
                && self.in_region(&current.resource_id, request.region.as_deref())
            {
                debug!(
                    session_key = %request.session_key,
                    kind = %request.kind,
                    resource_id = %current.resource_id,
                    "Reusing bound resource"
                );
                return Ok(Binding {
                    reason: BindingReason::Reused,
                    ..current
                });
            }

            let exclude = if request.force_new {
                slot.current()
                    .map(|b| vec![b.resource_id.clone()])
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            let plan = SelectionPlan {
                region: request.region.clone(),
                avoid_region: None,
                exclude,
                reason: BindingReason::New,
            };
            self.select_into(slot, &plan)
        })
    }

    fn in_region(&self, id: &ResourceId, region: Option<&str>) -> bool {
        let Some(wanted) = region else {
            return true;
        };
        self.pool
            .get(id)
            .is_ok_and(|r| r.region().is_some_and(|actual| actual.eq_ignore_ascii_case(wanted)))
    }

    /// Pick, vet and bind a resource for the slot's key.
    ///
    /// The drawn candidate is tried first, then the rest of the top five in
    /// rank order. When none survives, a fresh resource is generated; it
    /// joins the pool only if it passes vetting. The slot is only modified
    /// on success.
    pub fn select_into(
        &self,
        slot: &mut BindingSlot<'_>,
        plan: &SelectionPlan,
    ) -> EngineResult<Binding> {
        let kind = slot.key().kind;
        let session_key = slot.key().session_key.clone();
        let session_region = self.ledger.session_region(&session_key);
        let linked_device = self.linked_device(&session_key, kind);

        let ctx = ScoreContext::from_config(
            &self.config,
            kind,
            plan.region.clone().or_else(|| session_region.clone()),
            self.pool.now(),
        );
        let filter = ResourceFilter {
            region: plan.region.clone(),
            avoid_region: plan.avoid_region.clone(),
            exclude: plan.exclude.clone(),
        };
        let mut candidates: HashMap<ResourceId, Resource> = HashMap::new();
        let mut scored = Vec::new();
        for resource in self.pool.list_active(kind, filter) {
            if !links_to(&resource, linked_device.as_ref()) {
                continue;
            }
            scored.push((resource.id.clone(), scoring::score(&resource, &ctx)));
            candidates.insert(resource.id.clone(), resource);
        }

        let mut rng = self.rng.for_selection();
        let order = selection::draw_order(selection::rank(scored), &mut rng);
        debug!(
            session_key = %session_key,
            kind = %kind,
            candidates = order.len(),
            "Ranked candidates"
        );

        let mut rejected = Vec::new();
        for candidate in &order {
            let Some(resource) = candidates.get(&candidate.id) else {
                continue;
            };
            debug!(resource_id = %candidate.id, score = candidate.score, "Vetting candidate");
            match self.vet_and_bind(slot, resource, plan.reason)? {
                Vetted::Bound(binding) => return Ok(binding),
                Vetted::Rejected(violations) => merge(&mut rejected, violations),
                Vetted::Gone => {}
            }
        }

        let prepared = self.prepare(kind, plan, session_region, linked_device)?;
        let record = match self.vet(&session_key, &prepared) {
            Ok(record) => record,
            Err(violations) => {
                merge(&mut rejected, violations);
                return Err(EngineError::ConsistencyViolation {
                    violations: rejected,
                });
            }
        };
        let id = prepared.id.clone();
        self.pool.commit(prepared);
        self.bind(slot, &id, record, plan.reason)?
            .ok_or_else(|| EngineError::Exhaustion {
                kind,
                reason: format!("created resource '{id}' became unavailable"),
            })
    }

    fn linked_device(&self, session_key: &str, kind: ResourceKind) -> Option<Resource> {
        if kind != ResourceKind::SessionIdentity {
            return None;
        }
        let binding = self.pool.binding(session_key, ResourceKind::Device)?;
        self.pool.get(&binding.resource_id).ok()
    }

    /// Generate a fallback resource. It is not registered with the pool
    /// until it passes vetting.
    ///
    /// The session's inferred region is only a preference: if nothing can
    /// be minted there, any region is accepted.
    fn prepare(
        &self,
        kind: ResourceKind,
        plan: &SelectionPlan,
        session_region: Option<String>,
        linked_device: Option<Resource>,
    ) -> EngineResult<Resource> {
        let inferred = match (&plan.region, &linked_device) {
            (None, None) => session_region.filter(|r| {
                plan.avoid_region
                    .as_deref()
                    .is_none_or(|avoid| !avoid.eq_ignore_ascii_case(r))
            }),
            _ => None,
        };
        let mut hints = ResourceHints {
            region: plan.region.clone().or_else(|| inferred.clone()),
            avoid_region: plan.avoid_region.clone(),
            linked_device,
        };

        let mut prepared = self.pool.prepare(kind, &hints);
        if inferred.is_some() && matches!(prepared, Err(EngineError::Generation { .. })) {
            hints.region = None;
            prepared = self.pool.prepare(kind, &hints);
        }
        prepared.map_err(|error| match error {
            EngineError::Generation { reason, .. } => EngineError::Exhaustion { kind, reason },
            other => other,
        })
    }

    fn vet_and_bind(
        &self,
        slot: &mut BindingSlot<'_>,
        resource: &Resource,
        reason: BindingReason,
    ) -> EngineResult<Vetted> {
        let session_key = slot.key().session_key.clone();
        match self.vet(&session_key, resource) {
            Ok(record) => Ok(self
                .bind(slot, &resource.id, record, reason)?
                .map_or(Vetted::Gone, Vetted::Bound)),
            Err(violations) => Ok(Vetted::Rejected(violations)),
        }
    }

    /// Validate what the session would present through `resource`.
    ///
    /// Returns the observation to record on success, or the violations that
    /// block the bind under the configured level.
    fn vet(
        &self,
        session_key: &str,
        resource: &Resource,
    ) -> Result<ConsistencyRecord, Vec<ViolationKind>> {
        let record = ConsistencyRecord::observe(session_key, resource, self.pool.now());
        let prior = self.ledger.last_for_resource(&resource.id);
        let report = self.validator.validate(
            &self.ledger,
            session_key,
            prior.as_ref(),
            &ProposedUpdate::from(&record),
        );
        if !report.valid {
            self.pool
                .events()
                .emit(EngineEvent::ConsistencyViolationDetected {
                    session_key: session_key.to_string(),
                    resource_id: resource.id.clone(),
                    violations: report.violations.clone(),
                    score: report.score,
                });
            if self.validator.enforce(&report).is_err() {
                debug!(
                    session_key = %session_key,
                    resource_id = %resource.id,
                    violations = ?report.violations,
                    "Candidate rejected"
                );
                return Err(report.violations);
            }
        }
        Ok(record)
    }

    /// `None` if the resource stopped being bindable after it was vetted.
    fn bind(
        &self,
        slot: &mut BindingSlot<'_>,
        id: &ResourceId,
        record: ConsistencyRecord,
        reason: BindingReason,
    ) -> EngineResult<Option<Binding>> {
        match slot.bind(id, reason) {
            Ok(binding) => {
                self.ledger.append(record);
                Ok(Some(binding))
            }
            Err(EngineError::Unavailable { .. } | EngineError::NotFound { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

/// Session identities tied to a different device are not offered.
fn links_to(resource: &Resource, device: Option<&Resource>) -> bool {
    match (&resource.profile, device) {
        (ResourceProfile::SessionIdentity(identity), Some(device)) => identity
            .device_id
            .as_ref()
            .is_none_or(|id| *id == device.id),
        _ => true,
    }
}

fn merge(into: &mut Vec<ViolationKind>, violations: Vec<ViolationKind>) {
    for violation in violations {
        if !into.contains(&violation) {
            into.push(violation);
        }
    }
}

#[cfg(test)]
#[path = "selector_tests.rs"]
mod tests;
