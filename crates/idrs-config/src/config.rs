use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use idrs_core::{ConsistencyLevel, ProxyProtocol, ResourceKind, RotationStrategy};

/// Overrides `encryption_key` when set.
pub const ENV_ENCRYPTION_KEY: &str = "IDRS_ENCRYPTION_KEY";
/// Overrides `data_directory` when set.
pub const ENV_DATA_DIR: &str = "IDRS_DATA_DIR";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Nothing touches disk.
    #[default]
    Memory,
    /// Load at start, write after every mutation (via the flush task).
    File,
    /// Load at start, write on the periodic flush only.
    Hybrid,
}

impl PersistenceMode {
    pub fn is_durable(&self) -> bool {
        !matches!(self, Self::Memory)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub persistence_mode: PersistenceMode,
    /// Snapshot root. Falls back to the platform state directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_directory: Option<PathBuf>,
    #[serde(default)]
    pub encryption_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,

    #[serde(default)]
    pub rotation_strategy: RotationStrategy,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_max_usage")]
    pub max_usage: u64,
    /// Per-resource reuse delay applied by scoring.
    #[serde(default = "default_rotation_cooldown_secs")]
    pub rotation_cooldown_secs: u64,
    /// Post-failure quarantine window. Independent of the cooldown.
    #[serde(default = "default_quarantine_secs")]
    pub quarantine_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default)]
    pub consistency_level: ConsistencyLevel,
    #[serde(default = "default_max_plausible_speed_kmh")]
    pub max_plausible_speed_kmh: f64,
    #[serde(default = "default_geo_tolerance_km")]
    pub geo_tolerance_km: f64,
    #[serde(default = "default_fingerprint_drift_threshold")]
    pub fingerprint_drift_threshold: f64,
    /// Detections within the trailing hour that trigger rotation.
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: u32,

    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub intervals: TaskIntervals,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy_upstreams: Vec<ProxyUpstream>,
}

fn default_max_age_secs() -> u64 {
    30 * 24 * 3600
}

fn default_max_usage() -> u64 {
    1000
}

fn default_rotation_cooldown_secs() -> u64 {
    3600
}

fn default_quarantine_secs() -> u64 {
    600
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_max_plausible_speed_kmh() -> f64 {
    900.0
}

fn default_geo_tolerance_km() -> f64 {
    100.0
}

fn default_fingerprint_drift_threshold() -> f64 {
    0.3
}

fn default_detection_threshold() -> u32 {
    3
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persistence_mode: PersistenceMode::default(),
            data_directory: None,
            encryption_enabled: false,
            encryption_key: None,
            rotation_strategy: RotationStrategy::default(),
            max_age_secs: default_max_age_secs(),
            max_usage: default_max_usage(),
            rotation_cooldown_secs: default_rotation_cooldown_secs(),
            quarantine_secs: default_quarantine_secs(),
            failure_threshold: default_failure_threshold(),
            consistency_level: ConsistencyLevel::default(),
            max_plausible_speed_kmh: default_max_plausible_speed_kmh(),
            geo_tolerance_km: default_geo_tolerance_km(),
            fingerprint_drift_threshold: default_fingerprint_drift_threshold(),
            detection_threshold: default_detection_threshold(),
            scoring: ScoringConfig::default(),
            intervals: TaskIntervals::default(),
            probe_timeout_secs: default_probe_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            proxy_upstreams: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Sessions per day above which the usage factor starts dropping.
    #[serde(default = "default_usage_soft_limit_per_day")]
    pub usage_soft_limit_per_day: u32,
    #[serde(default = "default_proxy_optimal_age_secs")]
    pub proxy_optimal_age_secs: u64,
    #[serde(default = "default_device_optimal_age_secs")]
    pub device_optimal_age_secs: u64,
    #[serde(default = "default_session_optimal_age_secs")]
    pub session_optimal_age_secs: u64,
}

fn default_usage_soft_limit_per_day() -> u32 {
    50
}

fn default_proxy_optimal_age_secs() -> u64 {
    24 * 3600
}

fn default_device_optimal_age_secs() -> u64 {
    7 * 24 * 3600
}

fn default_session_optimal_age_secs() -> u64 {
    3 * 24 * 3600
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            usage_soft_limit_per_day: default_usage_soft_limit_per_day(),
            proxy_optimal_age_secs: default_proxy_optimal_age_secs(),
            device_optimal_age_secs: default_device_optimal_age_secs(),
            session_optimal_age_secs: default_session_optimal_age_secs(),
        }
    }
}

impl ScoringConfig {
    pub fn optimal_age(&self, kind: ResourceKind) -> chrono::Duration {
        let secs = match kind {
            ResourceKind::Proxy => self.proxy_optimal_age_secs,
            ResourceKind::Device => self.device_optimal_age_secs,
            ResourceKind::SessionIdentity => self.session_optimal_age_secs,
        };
        secs_to_chrono(secs)
    }
}

/// Cadence of the background tasks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskIntervals {
    #[serde(default = "default_five_minutes")]
    pub rotation_sweep_secs: u64,
    #[serde(default = "default_five_minutes")]
    pub health_probe_secs: u64,
    #[serde(default = "default_flush_secs")]
    pub flush_secs: u64,
    #[serde(default = "default_five_minutes")]
    pub audit_secs: u64,
    /// Fraction of the period added or removed at random on each tick.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_five_minutes() -> u64 {
    300
}

fn default_flush_secs() -> u64 {
    60
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for TaskIntervals {
    fn default() -> Self {
        Self {
            rotation_sweep_secs: default_five_minutes(),
            health_probe_secs: default_five_minutes(),
            flush_secs: default_flush_secs(),
            audit_secs: default_five_minutes(),
            jitter: default_jitter(),
        }
    }
}

/// A gateway proxy resources are minted from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyUpstream {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Exit countries (ISO alpha-2) this gateway can serve.
    #[serde(default)]
    pub countries: Vec<String>,
}

impl ProxyUpstream {
    pub fn serves(&self, region: &str) -> bool {
        self.countries.iter().any(|c| c.eq_ignore_ascii_case(region))
    }
}

fn secs_to_chrono(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

impl EngineConfig {
    /// Read, apply process-environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            .with_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        tracing::debug!(path = %path.display(), mode = ?config.persistence_mode, "Loaded engine config");
        Ok(config)
    }

    /// Parse only; no env overrides, no validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid engine config TOML")
    }

    /// Apply `IDRS_*` overrides read through `lookup`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_ENCRYPTION_KEY).filter(|k| !k.is_empty()) {
            self.encryption_key = Some(key);
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|d| !d.is_empty()) {
            self.data_directory = Some(PathBuf::from(dir));
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        crate::validate::validate_config(self)
    }

    /// Configured directory, else the platform default.
    pub fn resolved_data_directory(&self) -> Option<PathBuf> {
        self.data_directory
            .clone()
            .or_else(crate::paths::default_data_dir)
    }

    pub fn max_age(&self) -> chrono::Duration {
        secs_to_chrono(self.max_age_secs)
    }

    pub fn rotation_cooldown(&self) -> chrono::Duration {
        secs_to_chrono(self.rotation_cooldown_secs)
    }

    pub fn quarantine(&self) -> chrono::Duration {
        secs_to_chrono(self.quarantine_secs)
    }

    pub fn probe_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
