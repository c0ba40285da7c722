//! Session → resource leases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ResourceId, ResourceKind, RotationTrigger};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingKey {
    pub session_key: String,
    pub kind: ResourceKind,
}

impl BindingKey {
    pub fn new(session_key: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            session_key: session_key.into(),
            kind,
        }
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_key, self.kind)
    }
}

/// Why the current resource was assigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingReason {
    New,
    Reused,
    Rotated(RotationTrigger),
}

impl fmt::Display for BindingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => f.write_str("new"),
            Self::Reused => f.write_str("reused"),
            Self::Rotated(trigger) => write!(f, "rotated:{trigger}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub session_key: String,
    pub resource_id: ResourceId,
    pub kind: ResourceKind,
    pub bound_at: DateTime<Utc>,
    pub reason: BindingReason,
}

impl Binding {
    pub fn key(&self) -> BindingKey {
        BindingKey::new(self.session_key.clone(), self.kind)
    }
}

/// How a binding stopped being live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingEnd {
    /// Superseded by a new binding for the same key.
    Replaced(BindingReason),
    Released,
}

/// A binding kept in rotation history after it ended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndedBinding {
    pub binding: Binding,
    pub ended_at: DateTime<Utc>,
    pub end: BindingEnd,
}
