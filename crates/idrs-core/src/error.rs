use crate::types::{ResourceKind, ResourceStatus, ViolationKind};

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },

    #[error("Cannot generate {kind} resource: {reason}")]
    Generation { kind: ResourceKind, reason: String },

    #[error("Consistency violation: {}", format_violations(.violations))]
    ConsistencyViolation { violations: Vec<ViolationKind> },

    #[error("Persistence failed for '{id}': {message}")]
    Persistence { id: String, message: String },

    #[error("No {kind} resource available: {reason}")]
    Exhaustion { kind: ResourceKind, reason: String },

    #[error("Resource '{id}' is {status} and cannot be bound")]
    Unavailable { id: String, status: ResourceStatus },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn resource_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            what: "Resource",
            id: id.to_string(),
        }
    }

    pub fn binding_not_found(session_key: &str, kind: ResourceKind) -> Self {
        Self::NotFound {
            what: "Binding",
            id: format!("{session_key}/{kind}"),
        }
    }
}

fn format_violations(violations: &[ViolationKind]) -> String {
    violations
        .iter()
        .map(|v| v.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_not_found() {
        let err = EngineError::resource_not_found("01ARZ");
        assert_eq!(err.to_string(), "Resource '01ARZ' not found");
    }

    #[test]
    fn test_display_binding_not_found() {
        let err = EngineError::binding_not_found("checkout-7", ResourceKind::Proxy);
        assert_eq!(err.to_string(), "Binding 'checkout-7/proxy' not found");
    }

    #[test]
    fn test_display_generation() {
        let err = EngineError::Generation {
            kind: ResourceKind::Device,
            reason: "unsupported region 'ZZ'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot generate device resource: unsupported region 'ZZ'"
        );
    }

    #[test]
    fn test_display_consistency_violation_lists_kinds() {
        let err = EngineError::ConsistencyViolation {
            violations: vec![
                ViolationKind::ImpossibleTravel,
                ViolationKind::FingerprintDrasticChange,
            ],
        };
        assert_eq!(
            err.to_string(),
            "Consistency violation: impossible_travel, fingerprint_drastic_change"
        );
    }

    #[test]
    fn test_display_exhaustion() {
        let err = EngineError::Exhaustion {
            kind: ResourceKind::Proxy,
            reason: "no upstream for region 'JP'".into(),
        };
        assert_eq!(
            err.to_string(),
            "No proxy resource available: no upstream for region 'JP'"
        );
    }

    #[test]
    fn test_display_unavailable() {
        let err = EngineError::Unavailable {
            id: "01ARZ".into(),
            status: ResourceStatus::Compromised,
        };
        assert_eq!(
            err.to_string(),
            "Resource '01ARZ' is compromised and cannot be bound"
        );
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineError>();
    }
}
