pub mod config;
pub mod paths;
pub mod validate;

pub use config::{
    ENV_DATA_DIR, ENV_ENCRYPTION_KEY, EngineConfig, PersistenceMode, ProxyUpstream,
    ScoringConfig, TaskIntervals,
};
