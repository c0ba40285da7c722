use anyhow::{Result, bail};

use crate::config::EngineConfig;

/// Reject configurations the engine cannot run with.
pub fn validate_config(config: &EngineConfig) -> Result<()> {
    validate_persistence(config)?;
    validate_thresholds(config)?;
    validate_consistency(config)?;
    validate_intervals(config)?;
    validate_upstreams(config)?;
    Ok(())
}

fn validate_persistence(config: &EngineConfig) -> Result<()> {
    if config.encryption_enabled
        && config
            .encryption_key
            .as_deref()
            .is_none_or(|k| k.is_empty())
    {
        bail!(
            "encryption_enabled = true requires encryption_key (or {})",
            crate::config::ENV_ENCRYPTION_KEY
        );
    }
    if config.persistence_mode.is_durable() && config.resolved_data_directory().is_none() {
        bail!(
            "persistence_mode = {:?} requires data_directory (no platform default available)",
            config.persistence_mode
        );
    }
    Ok(())
}

fn validate_thresholds(config: &EngineConfig) -> Result<()> {
    let checks = [
        ("max_age_secs", config.max_age_secs),
        ("max_usage", config.max_usage),
        ("rotation_cooldown_secs", config.rotation_cooldown_secs),
        ("quarantine_secs", config.quarantine_secs),
        ("failure_threshold", u64::from(config.failure_threshold)),
        ("detection_threshold", u64::from(config.detection_threshold)),
        ("probe_timeout_secs", config.probe_timeout_secs),
        (
            "scoring.usage_soft_limit_per_day",
            u64::from(config.scoring.usage_soft_limit_per_day),
        ),
    ];
    for (name, value) in checks {
        if value == 0 {
            bail!("{name} must be > 0 (got 0)");
        }
    }
    Ok(())
}

fn validate_consistency(config: &EngineConfig) -> Result<()> {
    let drift = config.fingerprint_drift_threshold;
    if !(drift > 0.0 && drift <= 1.0) {
        bail!("fingerprint_drift_threshold must be in (0, 1] (got {drift})");
    }
    if !(config.max_plausible_speed_kmh > 0.0) {
        bail!(
            "max_plausible_speed_kmh must be > 0 (got {})",
            config.max_plausible_speed_kmh
        );
    }
    if !(config.geo_tolerance_km >= 0.0) {
        bail!(
            "geo_tolerance_km must be >= 0 (got {})",
            config.geo_tolerance_km
        );
    }
    Ok(())
}

fn validate_intervals(config: &EngineConfig) -> Result<()> {
    let intervals = &config.intervals;
    let checks = [
        ("intervals.rotation_sweep_secs", intervals.rotation_sweep_secs),
        ("intervals.health_probe_secs", intervals.health_probe_secs),
        ("intervals.flush_secs", intervals.flush_secs),
        ("intervals.audit_secs", intervals.audit_secs),
    ];
    for (name, value) in checks {
        if value == 0 {
            bail!("{name} must be > 0 (got 0)");
        }
    }
    if !(0.0..1.0).contains(&intervals.jitter) {
        bail!(
            "intervals.jitter must be in [0, 1) (got {})",
            intervals.jitter
        );
    }
    Ok(())
}

fn validate_upstreams(config: &EngineConfig) -> Result<()> {
    for (i, upstream) in config.proxy_upstreams.iter().enumerate() {
        if upstream.host.trim().is_empty() {
            bail!("proxy_upstreams[{i}].host cannot be empty");
        }
        if upstream.port == 0 {
            bail!("proxy_upstreams[{i}].port must be > 0");
        }
        if upstream.countries.is_empty() {
            bail!("proxy_upstreams[{i}].countries cannot be empty");
        }
    }
    Ok(())
}
