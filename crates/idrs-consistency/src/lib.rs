//! Cross-observation consistency: geography and fingerprint continuity.

pub mod geo;
pub mod ledger;
pub mod validator;

pub use geo::haversine_km;
pub use ledger::{ConsistencyLedger, ConsistencyRecord};
pub use validator::{
    BehaviorCheck, ConsistencyValidator, NoopBehaviorCheck, ProposedUpdate, ValidationReport,
    ValidatorSettings,
};
