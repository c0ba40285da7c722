use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque resource identifier (ULID, 26 chars Crockford Base32).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Six trailing characters, used where a short sticky tag is needed.
    pub fn short(&self) -> &str {
        let start = self.0.len().saturating_sub(6);
        self.0.get(start..).unwrap_or(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Proxy,
    Device,
    SessionIdentity,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [Self::Proxy, Self::Device, Self::SessionIdentity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Device => "device",
            Self::SessionIdentity => "session_identity",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status. `Retired` and `Compromised` are terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    Active,
    Quarantined,
    Retired,
    Compromised,
}

impl ResourceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Retired | Self::Compromised)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Quarantined => "quarantined",
            Self::Retired => "retired",
            Self::Compromised => "compromised",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which trigger dominates ordering ties during rotation evaluation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    TimeBased,
    UsageBased,
    DetectionBased,
    #[default]
    Adaptive,
}

/// Reason a bound resource is replaced.
///
/// The derived ordering follows base priority: earlier variants are more
/// urgent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationTrigger {
    DetectionPattern,
    HealthDegraded,
    UsageLimit,
    AgeLimit,
    AdaptiveOptimization,
    Scheduled,
}

impl RotationTrigger {
    /// Base priority (1 = most urgent).
    pub fn priority(&self) -> u8 {
        match self {
            Self::DetectionPattern => 1,
            Self::HealthDegraded => 2,
            Self::UsageLimit => 3,
            Self::AgeLimit => 4,
            Self::AdaptiveOptimization => 5,
            Self::Scheduled => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DetectionPattern => "detection_pattern",
            Self::HealthDegraded => "health_degraded",
            Self::UsageLimit => "usage_limit",
            Self::AgeLimit => "age_limit",
            Self::AdaptiveOptimization => "adaptive_optimization",
            Self::Scheduled => "scheduled",
        }
    }

    /// Status the replaced resource moves to, or `None` to keep it selectable.
    pub fn disposition(&self) -> Option<ResourceStatus> {
        match self {
            Self::DetectionPattern => Some(ResourceStatus::Compromised),
            Self::UsageLimit | Self::AgeLimit => Some(ResourceStatus::Retired),
            Self::HealthDegraded | Self::AdaptiveOptimization | Self::Scheduled => None,
        }
    }
}

impl fmt::Display for RotationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    Strict,
    #[default]
    Moderate,
    Relaxed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    ImpossibleTravel,
    FingerprintDrasticChange,
    BehavioralDrift,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImpossibleTravel => "impossible_travel",
            Self::FingerprintDrasticChange => "fingerprint_drastic_change",
            Self::BehavioralDrift => "behavioral_drift",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
