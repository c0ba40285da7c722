//! Candidate scoring.
//!
//! `score` is pure: it reads a resource snapshot and the request context and
//! never touches the pool.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use idrs_config::EngineConfig;
use idrs_core::regions::geo_affinity;
use idrs_core::{Resource, ResourceKind};

const FRESHNESS_WEIGHT: f64 = 0.2;
const USAGE_WEIGHT: f64 = 0.3;
const SUCCESS_WEIGHT: f64 = 0.3;
const GEO_MATCH_BONUS: f64 = 0.2;
const DETECTION_PENALTY: f64 = 0.1;
const COOLDOWN_PENALTY: f64 = 0.15;
/// Success rate assumed when nothing has been recorded.
const NEUTRAL_SUCCESS_RATE: f64 = 0.5;
/// Freshness reaches zero at this many optimal ages past the optimum.
const FRESHNESS_TAIL: f64 = 3.0;
/// Each consecutive failure divides the health factor by `1 + 0.5n`.
const FAILURE_DAMPING: f64 = 0.5;

#[derive(Clone, Debug)]
pub struct ScoreContext {
    pub now: DateTime<Utc>,
    /// Region requested by the caller, if any.
    pub region: Option<String>,
    pub optimal_age: Duration,
    pub usage_soft_limit_per_day: u32,
    pub cooldown: Duration,
}

impl ScoreContext {
    pub fn from_config(
        config: &EngineConfig,
        kind: ResourceKind,
        region: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            now,
            region,
            optimal_age: config.scoring.optimal_age(kind),
            usage_soft_limit_per_day: config.scoring.usage_soft_limit_per_day,
            cooldown: config.rotation_cooldown(),
        }
    }
}

/// Per-factor contributions, for logging and tests.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub freshness: f64,
    pub usage: f64,
    pub success: f64,
    pub geo: f64,
    pub detection_penalty: f64,
    pub cooldown_penalty: f64,
    pub health_factor: f64,
    pub total: f64,
}

pub fn score(resource: &Resource, ctx: &ScoreContext) -> f64 {
    breakdown(resource, ctx).total
}

pub fn breakdown(resource: &Resource, ctx: &ScoreContext) -> ScoreBreakdown {
    let freshness = FRESHNESS_WEIGHT * freshness(resource.age(ctx.now), ctx.optimal_age);

    let today = resource.usage.count_on(ctx.now.date_naive());
    let usage = USAGE_WEIGHT * usage_factor(today, ctx.usage_soft_limit_per_day);

    let success = SUCCESS_WEIGHT * resource.usage.success_rate().unwrap_or(NEUTRAL_SUCCESS_RATE);

    let geo = match (ctx.region.as_deref(), resource.region()) {
        (Some(wanted), Some(actual)) => {
            if wanted.eq_ignore_ascii_case(actual) {
                GEO_MATCH_BONUS
            } else {
                GEO_MATCH_BONUS * 0.5 * geo_affinity(wanted, actual)
            }
        }
        _ => 0.0,
    };

    let recent = resource.detections_since(ctx.now - Duration::hours(1));
    let detection_penalty = DETECTION_PENALTY * recent as f64;

    let cooldown_penalty = match resource.last_used_at {
        Some(used) if ctx.now - used < ctx.cooldown => COOLDOWN_PENALTY,
        _ => 0.0,
    };

    let base = (freshness + usage + success + geo - detection_penalty - cooldown_penalty)
        .clamp(0.0, 1.0);
    let health_factor = resource.health.score.clamp(0.0, 1.0)
        / (1.0 + FAILURE_DAMPING * f64::from(resource.health.consecutive_failures));

    ScoreBreakdown {
        freshness,
        usage,
        success,
        geo,
        detection_penalty,
        cooldown_penalty,
        health_factor,
        total: base * health_factor,
    }
}

/// Triangular curve: 0 at age 0, 1 at the optimum, back to 0 after the tail.
fn freshness(age: Duration, optimal: Duration) -> f64 {
    let optimal_secs = optimal.num_seconds() as f64;
    if optimal_secs <= 0.0 {
        return 1.0;
    }
    let ratio = age.num_seconds().max(0) as f64 / optimal_secs;
    if ratio <= 1.0 {
        ratio
    } else {
        (1.0 - (ratio - 1.0) / FRESHNESS_TAIL).max(0.0)
    }
}

/// 1.0 up to the soft limit, then linear down to 0 at twice the limit.
fn usage_factor(today: u32, soft_limit: u32) -> f64 {
    if soft_limit == 0 || today <= soft_limit {
        return 1.0;
    }
    let over = f64::from(today - soft_limit) / f64::from(soft_limit);
    (1.0 - over).max(0.0)
}

#[cfg(test)]
#[path = "scoring_tests.rs"]
mod tests;
