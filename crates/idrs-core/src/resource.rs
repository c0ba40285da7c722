//! Resource records: a shared envelope plus a kind-specific profile.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{ResourceId, ResourceKind, ResourceStatus, RotationStrategy};

/// Detection timestamps older than this are pruned on every append.
pub const DETECTION_RETENTION_HOURS: i64 = 24;

/// Daily usage counters older than this are pruned on every append.
pub const DAILY_RETENTION_DAYS: i64 = 30;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
    pub region: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyProfile {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// ISO 3166-1 alpha-2 country the gateway exits from.
    pub country: String,
    #[serde(default)]
    pub protocol: ProxyProtocol,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScreenProfile {
    pub width: u32,
    pub height: u32,
    pub pixel_ratio: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub platform: String,
    pub user_agent: String,
    pub browser_version: String,
    pub screen: ScreenProfile,
    pub hardware_concurrency: u8,
    pub device_memory_gb: u8,
    pub timezone: String,
    pub locale: String,
    pub languages: Vec<String>,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    /// Seed for canvas/audio noise; derived from the resource id.
    pub fingerprint_seed: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionIdentityProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<ResourceId>,
    pub user_agent: String,
    pub locale: String,
    pub timezone: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceProfile {
    Proxy(ProxyProfile),
    Device(DeviceProfile),
    SessionIdentity(SessionIdentityProfile),
}

impl ResourceProfile {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Proxy(_) => ResourceKind::Proxy,
            Self::Device(_) => ResourceKind::Device,
            Self::SessionIdentity(_) => ResourceKind::SessionIdentity,
        }
    }

    /// Tracked fingerprint fields, used for drift detection.
    pub fn fingerprint(&self) -> FingerprintSummary {
        let mut fields = BTreeMap::new();
        match self {
            Self::Proxy(p) => {
                fields.insert("country".to_string(), p.country.clone());
                fields.insert("protocol".to_string(), p.protocol.scheme().to_string());
            }
            Self::Device(d) => {
                fields.insert("platform".to_string(), d.platform.clone());
                fields.insert("user_agent".to_string(), d.user_agent.clone());
                fields.insert(
                    "screen".to_string(),
                    format!("{}x{}@{}", d.screen.width, d.screen.height, d.screen.pixel_ratio),
                );
                fields.insert(
                    "hardware_concurrency".to_string(),
                    d.hardware_concurrency.to_string(),
                );
                fields.insert("device_memory".to_string(), d.device_memory_gb.to_string());
                fields.insert("timezone".to_string(), d.timezone.clone());
                fields.insert("locale".to_string(), d.locale.clone());
                fields.insert("webgl_renderer".to_string(), d.webgl_renderer.clone());
            }
            Self::SessionIdentity(s) => {
                fields.insert("user_agent".to_string(), s.user_agent.clone());
                fields.insert("locale".to_string(), s.locale.clone());
                fields.insert("timezone".to_string(), s.timezone.clone());
            }
        }
        FingerprintSummary(fields)
    }
}

/// Flat field → value view of a fingerprint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSummary(pub BTreeMap<String, String>);

impl FingerprintSummary {
    /// Fraction of tracked fields (union of both sides) whose value differs.
    pub fn drift_from(&self, prior: &FingerprintSummary) -> f64 {
        let mut keys: Vec<&String> = self.0.keys().chain(prior.0.keys()).collect();
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return 0.0;
        }
        let changed = keys
            .iter()
            .filter(|k| self.0.get(k.as_str()) != prior.0.get(k.as_str()))
            .count();
        changed as f64 / keys.len() as f64
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub session_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    /// Stored on disk as `[["2026-10-19", 3], ...]`.
    #[serde(default, with = "date_pairs")]
    pub daily_counts: BTreeMap<NaiveDate, u32>,
}

impl UsageStats {
    /// Historical success fraction, `None` without any outcome recorded.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return None;
        }
        Some(self.success_count as f64 / total as f64)
    }

    pub fn count_on(&self, date: NaiveDate) -> u32 {
        self.daily_counts.get(&date).copied().unwrap_or(0)
    }

    pub fn record_session(&mut self, now: DateTime<Utc>, success: bool) {
        self.session_count += 1;
        if success {
            self.success_count += 1;
            self.last_success_at = Some(now);
        } else {
            self.failure_count += 1;
        }
        let today = now.date_naive();
        *self.daily_counts.entry(today).or_insert(0) += 1;
        let cutoff = today - Duration::days(DAILY_RETENTION_DAYS);
        self.daily_counts.retain(|date, _| *date > cutoff);
    }
}

mod date_pairs {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<NaiveDate, u32>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(NaiveDate, u32)> = map.iter().map(|(d, c)| (*d, *c)).collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<NaiveDate, u32>, D::Error> {
        let pairs = Vec::<(NaiveDate, u32)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthState {
    /// In `[0, 1]`; 1.0 is fully healthy.
    pub score: f64,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response_ms: Option<u64>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            score: 1.0,
            consecutive_failures: 0,
            last_checked_at: None,
            last_response_ms: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    pub strategy: RotationStrategy,
    /// Incremented on each successor; first-generation resources are 0.
    pub generation: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rotated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<ResourceId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub profile: ResourceProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<Geolocation>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage: UsageStats,
    #[serde(default)]
    pub health: HealthState,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantined_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_until: Option<DateTime<Utc>>,
    /// Detection events in the trailing retention window.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detections: Vec<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_detection_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rotation: RotationState,
}

impl Resource {
    pub fn new(
        id: ResourceId,
        profile: ResourceProfile,
        geolocation: Option<Geolocation>,
        strategy: RotationStrategy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            profile,
            geolocation,
            created_at: now,
            last_used_at: None,
            usage: UsageStats::default(),
            health: HealthState::default(),
            status: ResourceStatus::Active,
            quarantined_at: None,
            quarantine_until: None,
            detections: Vec::new(),
            last_detection_at: None,
            retired_at: None,
            rotation: RotationState {
                strategy,
                ..Default::default()
            },
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.profile.kind()
    }

    /// Region code: geolocation region if known, else the proxy exit country.
    pub fn region(&self) -> Option<&str> {
        if let Some(geo) = &self.geolocation {
            return Some(geo.region.as_str());
        }
        match &self.profile {
            ResourceProfile::Proxy(p) => Some(p.country.as_str()),
            _ => None,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).max(Duration::zero())
    }

    pub fn detections_since(&self, since: DateTime<Utc>) -> usize {
        self.detections.iter().filter(|t| **t > since).count()
    }

    pub fn record_detection(&mut self, now: DateTime<Utc>) {
        self.detections.push(now);
        self.last_detection_at = Some(now);
        let cutoff = now - Duration::hours(DETECTION_RETENTION_HOURS);
        self.detections.retain(|t| *t > cutoff);
    }

    /// Move an expired quarantine back to `Active`.
    ///
    /// A detection observed while quarantined restarts the window instead.
    /// Returns `true` when the resource was released.
    pub fn release_quarantine_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ResourceStatus::Quarantined {
            return false;
        }
        let (Some(since), Some(until)) = (self.quarantined_at, self.quarantine_until) else {
            self.status = ResourceStatus::Active;
            self.health.consecutive_failures = 0;
            return true;
        };
        if now < until {
            return false;
        }
        if self.detections_since(since) > 0 {
            let window = until - since;
            self.quarantined_at = Some(now);
            self.quarantine_until = Some(now + window);
            return false;
        }
        self.status = ResourceStatus::Active;
        self.health.consecutive_failures = 0;
        self.quarantined_at = None;
        self.quarantine_until = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device() -> ResourceProfile {
        ResourceProfile::Device(DeviceProfile {
            platform: "Win32".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64)".into(),
            browser_version: "128.0".into(),
            screen: ScreenProfile {
                width: 1920,
                height: 1080,
                pixel_ratio: 1.0,
            },
            hardware_concurrency: 8,
            device_memory_gb: 8,
            timezone: "America/New_York".into(),
            locale: "en-US".into(),
            languages: vec!["en-US".into(), "en".into()],
            webgl_vendor: "Google Inc.".into(),
            webgl_renderer: "ANGLE (NVIDIA)".into(),
            fingerprint_seed: 42,
        })
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-19T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_daily_counts_serialize_as_pairs() {
        let mut usage = UsageStats::default();
        usage.record_session(now(), true);
        usage.record_session(now(), false);
        let json = serde_json::to_value(&usage).unwrap();
        assert_eq!(json["daily_counts"], serde_json::json!([["2026-10-19", 2]]));
        let back: UsageStats = serde_json::from_value(json).unwrap();
        assert_eq!(back, usage);
    }

    #[test]
    fn test_success_rate_defaults_to_none() {
        let mut usage = UsageStats::default();
        assert_eq!(usage.success_rate(), None);
        usage.record_session(now(), true);
        usage.record_session(now(), true);
        usage.record_session(now(), false);
        let rate = usage.success_rate().unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_daily_counts_pruned_after_retention() {
        let mut usage = UsageStats::default();
        usage.record_session(now() - Duration::days(45), true);
        usage.record_session(now(), true);
        assert_eq!(usage.daily_counts.len(), 1);
        assert_eq!(usage.count_on(now().date_naive()), 1);
    }

    #[test]
    fn test_profile_tagged_by_kind() {
        let json = serde_json::to_value(sample_device()).unwrap();
        assert_eq!(json["kind"], "device");
        assert_eq!(sample_device().kind(), ResourceKind::Device);
    }

    #[test]
    fn test_fingerprint_drift_fraction() {
        let prior = sample_device().fingerprint();
        assert_eq!(prior.drift_from(&prior), 0.0);

        let mut changed = sample_device();
        if let ResourceProfile::Device(d) = &mut changed {
            d.locale = "de-DE".into();
            d.timezone = "Europe/Berlin".into();
        }
        let drift = changed.fingerprint().drift_from(&prior);
        assert!((drift - 2.0 / 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_detections_pruned_to_retention_window() {
        let mut r = Resource::new(
            ResourceId::generate(),
            sample_device(),
            None,
            RotationStrategy::Adaptive,
            now(),
        );
        r.record_detection(now() - Duration::hours(30));
        r.record_detection(now());
        assert_eq!(r.detections.len(), 1);
        assert_eq!(r.detections_since(now() - Duration::hours(1)), 1);
    }

    #[test]
    fn test_quarantine_release_after_deadline() {
        let mut r = Resource::new(
            ResourceId::generate(),
            sample_device(),
            None,
            RotationStrategy::Adaptive,
            now(),
        );
        r.status = ResourceStatus::Quarantined;
        r.health.consecutive_failures = 5;
        r.quarantined_at = Some(now());
        r.quarantine_until = Some(now() + Duration::minutes(10));

        assert!(!r.release_quarantine_if_due(now() + Duration::minutes(9)));
        assert_eq!(r.status, ResourceStatus::Quarantined);

        assert!(r.release_quarantine_if_due(now() + Duration::minutes(10)));
        assert_eq!(r.status, ResourceStatus::Active);
        assert_eq!(r.health.consecutive_failures, 0);
        assert!(r.quarantine_until.is_none());
    }

    #[test]
    fn test_detection_during_quarantine_extends_window() {
        let mut r = Resource::new(
            ResourceId::generate(),
            sample_device(),
            None,
            RotationStrategy::Adaptive,
            now(),
        );
        r.status = ResourceStatus::Quarantined;
        r.quarantined_at = Some(now());
        r.quarantine_until = Some(now() + Duration::minutes(10));
        r.record_detection(now() + Duration::minutes(5));

        let at = now() + Duration::minutes(11);
        assert!(!r.release_quarantine_if_due(at));
        assert_eq!(r.status, ResourceStatus::Quarantined);
        assert_eq!(r.quarantine_until, Some(at + Duration::minutes(10)));
    }

    #[test]
    fn test_region_falls_back_to_proxy_country() {
        let r = Resource::new(
            ResourceId::generate(),
            ResourceProfile::Proxy(ProxyProfile {
                host: "gw.example.net".into(),
                port: 8080,
                username: None,
                password: None,
                country: "US".into(),
                protocol: ProxyProtocol::Http,
            }),
            None,
            RotationStrategy::Adaptive,
            now(),
        );
        assert_eq!(r.region(), Some("US"));
    }
}
