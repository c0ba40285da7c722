//! Shared fixtures for the unit tests in this crate.

use chrono::{DateTime, Utc};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

use idrs_config::{EngineConfig, ProxyUpstream};
use idrs_consistency::{ConsistencyLedger, ConsistencyValidator, ValidatorSettings};
use idrs_core::{
    Binding, EngineResult, FixedRngSource, Geolocation, ManualClock, ProxyProfile,
    ProxyProtocol, RecordingEventSink, Resource, ResourceId, ResourceKind, ResourceProfile,
    RngSource, RotationStrategy,
};
use idrs_pool::{PoolSettings, ProfileGenerator, ResourcePool};

use crate::health::{HealthMonitor, Prober};
use crate::rotation::RotationScheduler;
use crate::selector::{AcquireRequest, Selector};

pub(crate) fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-10-19T09:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub(crate) fn upstreams() -> Vec<ProxyUpstream> {
    vec![ProxyUpstream {
        host: "gw.example.net".into(),
        port: 7000,
        protocol: ProxyProtocol::Http,
        username: Some("customer".into()),
        password: Some("pw".into()),
        countries: vec!["US".into(), "CA".into(), "DE".into(), "GB".into(), "FR".into()],
    }]
}

pub(crate) fn config() -> EngineConfig {
    EngineConfig {
        proxy_upstreams: upstreams(),
        ..Default::default()
    }
}

/// A proxy record built by hand, for pools without upstreams.
pub(crate) fn proxy_resource(region: &str, created_at: DateTime<Utc>) -> Resource {
    Resource::new(
        ResourceId::generate(),
        ResourceProfile::Proxy(ProxyProfile {
            host: "static.example.net".into(),
            port: 8080,
            username: None,
            password: None,
            country: region.into(),
            protocol: ProxyProtocol::Http,
        }),
        Some(Geolocation {
            latitude: 39.8,
            longitude: -98.6,
            region: region.into(),
        }),
        RotationStrategy::Adaptive,
        created_at,
    )
}

pub(crate) struct Harness {
    pub pool: Arc<ResourcePool>,
    pub validator: Arc<ConsistencyValidator>,
    pub ledger: Arc<ConsistencyLedger>,
    pub selector: Arc<Selector>,
    pub scheduler: Arc<RotationScheduler>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<RecordingEventSink>,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let events = Arc::new(RecordingEventSink::new());
        let rng: Arc<dyn RngSource> = Arc::new(FixedRngSource::new(11));
        let generator = ProfileGenerator::new(config.proxy_upstreams.clone(), rng.clone());
        let pool = Arc::new(ResourcePool::new(
            PoolSettings::from_config(&config),
            generator,
            clock.clone(),
            events.clone(),
        ));
        let validator = Arc::new(ConsistencyValidator::new(ValidatorSettings::from_config(
            &config,
        )));
        let ledger = Arc::new(ConsistencyLedger::default());
        let selector = Arc::new(Selector::new(
            pool.clone(),
            validator.clone(),
            ledger.clone(),
            rng,
            Arc::new(config),
        ));
        let scheduler = Arc::new(RotationScheduler::new(selector.clone()));
        Self {
            pool,
            validator,
            ledger,
            selector,
            scheduler,
            clock,
            events,
        }
    }

    pub fn acquire(
        &self,
        session_key: &str,
        kind: ResourceKind,
        region: Option<&str>,
    ) -> EngineResult<Binding> {
        let mut request = AcquireRequest::new(session_key, kind);
        request.region = region.map(str::to_string);
        self.selector.acquire(&request)
    }

    pub fn region_of(&self, id: &ResourceId) -> String {
        self.pool.get(id).unwrap().region().unwrap().to_string()
    }

    pub fn monitor(&self, prober: Arc<dyn Prober>, timeout: Duration) -> HealthMonitor {
        HealthMonitor::new(
            self.pool.clone(),
            self.scheduler.clone(),
            self.validator.clone(),
            self.ledger.clone(),
            prober,
            timeout,
        )
    }
}

/// Collects formatted log lines in memory.
#[derive(Clone, Default)]
pub(crate) struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// A WARN-and-above dispatcher writing into this capture.
    pub fn dispatch(&self) -> tracing::Dispatch {
        tracing::Dispatch::new(
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::WARN)
                .with_ansi(false)
                .without_time()
                .with_target(false)
                .with_writer(self.clone())
                .finish(),
        )
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
