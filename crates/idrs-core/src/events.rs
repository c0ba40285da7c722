//! Structured lifecycle events handed to the metrics/logging collaborator.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::types::{
    ResourceId, ResourceKind, ResourceStatus, RotationTrigger, ViolationKind,
};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ResourceCreated {
        id: ResourceId,
        kind: ResourceKind,
        region: Option<String>,
    },
    ResourceRotated {
        session_key: String,
        kind: ResourceKind,
        from: ResourceId,
        to: ResourceId,
        trigger: RotationTrigger,
    },
    ResourceQuarantined {
        id: ResourceId,
        until: DateTime<Utc>,
    },
    QuarantineLifted {
        id: ResourceId,
    },
    /// Terminal disposition (`Retired` or `Compromised`).
    ResourceRetired {
        id: ResourceId,
        status: ResourceStatus,
        trigger: RotationTrigger,
    },
    ConsistencyViolationDetected {
        session_key: String,
        resource_id: ResourceId,
        violations: Vec<ViolationKind>,
        score: f64,
    },
    ConsistencyAudit {
        sessions: usize,
        score: f64,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Renders every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: EngineEvent) {
        match event {
            EngineEvent::ResourceCreated { id, kind, region } => {
                info!(resource_id = %id, %kind, region = region.as_deref().unwrap_or("-"), "resource created");
            }
            EngineEvent::ResourceRotated {
                session_key,
                kind,
                from,
                to,
                trigger,
            } => {
                info!(%session_key, %kind, %from, %to, %trigger, "resource rotated");
            }
            EngineEvent::ResourceQuarantined { id, until } => {
                warn!(resource_id = %id, %until, "resource quarantined");
            }
            EngineEvent::QuarantineLifted { id } => {
                info!(resource_id = %id, "quarantine lifted");
            }
            EngineEvent::ResourceRetired {
                id,
                status,
                trigger,
            } => {
                info!(resource_id = %id, %status, %trigger, "resource retired");
            }
            EngineEvent::ConsistencyViolationDetected {
                session_key,
                resource_id,
                violations,
                score,
            } => {
                let kinds: Vec<&str> = violations.iter().map(|v| v.as_str()).collect();
                warn!(%session_key, %resource_id, violations = ?kinds, score, "consistency violation detected");
            }
            EngineEvent::ConsistencyAudit { sessions, score } => {
                info!(sessions, score, "consistency audit");
            }
        }
    }
}

/// Keeps events in memory; used by tests and embedders that poll.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<EngineEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}
