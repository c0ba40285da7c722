//! Append-only observation history, indexed by session and by resource.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::borrow::Borrow;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use idrs_core::{FingerprintSummary, Geolocation, Resource, ResourceId, ResourceKind};

/// Records retained per session and per resource; older ones are dropped.
const DEFAULT_RETENTION: usize = 256;
/// Sessions (and, separately, resources) tracked before the least recently
/// observed one is forgotten.
const DEFAULT_MAX_KEYS: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConsistencyRecord {
    pub session_key: String,
    pub resource_id: ResourceId,
    pub kind: ResourceKind,
    pub geolocation: Option<Geolocation>,
    pub fingerprint: FingerprintSummary,
    pub recorded_at: DateTime<Utc>,
}

impl ConsistencyRecord {
    /// What a session presented through `resource` at `at`.
    pub fn observe(session_key: &str, resource: &Resource, at: DateTime<Utc>) -> Self {
        Self {
            session_key: session_key.to_string(),
            resource_id: resource.id.clone(),
            kind: resource.kind(),
            geolocation: resource.geolocation.clone(),
            fingerprint: resource.profile.fingerprint(),
            recorded_at: at,
        }
    }
}

/// Per-key record queues, each stamped with the append that last touched it.
struct Index<K> {
    entries: HashMap<K, (u64, VecDeque<ConsistencyRecord>)>,
}

impl<K> Default for Index<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> Index<K> {
    fn push(&mut self, key: &K, record: ConsistencyRecord, tick: u64, limits: Limits) {
        if !self.entries.contains_key(key) && self.entries.len() >= limits.max_keys {
            let stalest = self
                .entries
                .iter()
                .min_by_key(|(_, (touched, _))| *touched)
                .map(|(k, _)| k.clone());
            if let Some(stalest) = stalest {
                self.entries.remove(&stalest);
            }
        }
        let (touched, queue) = self.entries.entry(key.clone()).or_default();
        *touched = tick;
        if queue.len() == limits.retention {
            queue.pop_front();
        }
        queue.push_back(record);
    }

    fn get<Q>(&self, key: &Q) -> Option<&VecDeque<ConsistencyRecord>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.get(key).map(|(_, queue)| queue)
    }
}

#[derive(Clone, Copy)]
struct Limits {
    retention: usize,
    max_keys: usize,
}

#[derive(Default)]
struct Indexes {
    tick: u64,
    by_session: Index<String>,
    by_resource: Index<ResourceId>,
}

pub struct ConsistencyLedger {
    limits: Limits,
    inner: RwLock<Indexes>,
}

impl Default for ConsistencyLedger {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION, DEFAULT_MAX_KEYS)
    }
}

impl ConsistencyLedger {
    /// `retention` records per key, at most `max_keys` sessions and
    /// `max_keys` resources.
    pub fn new(retention: usize, max_keys: usize) -> Self {
        Self {
            limits: Limits {
                retention: retention.max(1),
                max_keys: max_keys.max(1),
            },
            inner: RwLock::new(Indexes::default()),
        }
    }

    pub fn with_retention(retention: usize) -> Self {
        Self::new(retention, DEFAULT_MAX_KEYS)
    }

    pub fn append(&self, record: ConsistencyRecord) {
        let mut inner = self.inner.write();
        inner.tick += 1;
        let tick = inner.tick;
        let resource_id = record.resource_id.clone();
        let session_key = record.session_key.clone();
        inner
            .by_resource
            .push(&resource_id, record.clone(), tick, self.limits);
        inner.by_session.push(&session_key, record, tick, self.limits);
    }

    pub fn session_count(&self) -> usize {
        self.inner.read().by_session.entries.len()
    }

    pub fn resource_count(&self) -> usize {
        self.inner.read().by_resource.entries.len()
    }

    pub fn last_for_session(&self, session_key: &str) -> Option<ConsistencyRecord> {
        self.inner
            .read()
            .by_session
            .get(session_key)
            .and_then(|q| q.back().cloned())
    }

    /// Most recent record for the session that carries a geolocation.
    pub fn last_located_for_session(&self, session_key: &str) -> Option<ConsistencyRecord> {
        self.inner
            .read()
            .by_session
            .get(session_key)
            .and_then(|q| q.iter().rev().find(|r| r.geolocation.is_some()).cloned())
    }

    pub fn last_for_resource(&self, id: &ResourceId) -> Option<ConsistencyRecord> {
        self.inner
            .read()
            .by_resource
            .get(id)
            .and_then(|q| q.back().cloned())
    }

    /// Oldest first.
    pub fn session_history(&self, session_key: &str) -> Vec<ConsistencyRecord> {
        self.inner
            .read()
            .by_session
            .get(session_key)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Region of the session's latest located observation.
    pub fn session_region(&self, session_key: &str) -> Option<String> {
        self.last_located_for_session(session_key)
            .and_then(|r| r.geolocation.map(|g| g.region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idrs_core::{ProxyProfile, ProxyProtocol, ResourceProfile, RotationStrategy};

    fn proxy(id: &str, region: &str) -> Resource {
        Resource::new(
            ResourceId::from(id),
            ResourceProfile::Proxy(ProxyProfile {
                host: "h".into(),
                port: 1,
                username: None,
                password: None,
                country: region.into(),
                protocol: ProxyProtocol::Http,
            }),
            Some(Geolocation {
                latitude: 1.0,
                longitude: 2.0,
                region: region.into(),
            }),
            RotationStrategy::Adaptive,
            Utc::now(),
        )
    }

    #[test]
    fn test_indexes_by_session_and_resource() {
        let ledger = ConsistencyLedger::default();
        let now = Utc::now();
        ledger.append(ConsistencyRecord::observe("s1", &proxy("p1", "US"), now));
        ledger.append(ConsistencyRecord::observe("s1", &proxy("p2", "CA"), now));
        ledger.append(ConsistencyRecord::observe("s2", &proxy("p1", "US"), now));

        assert_eq!(
            ledger.last_for_session("s1").unwrap().resource_id.as_str(),
            "p2"
        );
        assert_eq!(ledger.session_region("s1").as_deref(), Some("CA"));
        assert_eq!(
            ledger.last_for_resource(&ResourceId::from("p1")).unwrap().session_key,
            "s2"
        );
        assert_eq!(ledger.session_history("s1").len(), 2);
        assert!(ledger.last_for_session("nope").is_none());
    }

    #[test]
    fn test_retention_drops_oldest() {
        let ledger = ConsistencyLedger::with_retention(2);
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            ledger.append(ConsistencyRecord::observe("s", &proxy(id, "US"), now));
        }
        let ids: Vec<String> = ledger
            .session_history("s")
            .into_iter()
            .map(|r| r.resource_id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_least_recently_observed_keys_forgotten() {
        let ledger = ConsistencyLedger::new(8, 2);
        let now = Utc::now();
        ledger.append(ConsistencyRecord::observe("s1", &proxy("p1", "US"), now));
        ledger.append(ConsistencyRecord::observe("s2", &proxy("p2", "US"), now));
        ledger.append(ConsistencyRecord::observe("s1", &proxy("p1", "US"), now));
        ledger.append(ConsistencyRecord::observe("s3", &proxy("p3", "DE"), now));

        assert_eq!(ledger.session_count(), 2);
        assert_eq!(ledger.resource_count(), 2);
        assert!(ledger.last_for_session("s2").is_none());
        assert!(ledger.last_for_resource(&ResourceId::from("p2")).is_none());
        assert_eq!(ledger.session_history("s1").len(), 2);
        assert_eq!(ledger.session_region("s3").as_deref(), Some("DE"));
    }
}
