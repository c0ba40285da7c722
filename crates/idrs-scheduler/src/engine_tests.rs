use super::*;
use crate::test_support::{LogCapture, config, t0};
use idrs_core::{
    ConsistencyLevel, FixedRngSource, ManualClock, RecordingEventSink, ResourceStatus,
    ViolationKind,
};

struct Fixture {
    engine: Engine,
    clock: Arc<ManualClock>,
    events: Arc<RecordingEventSink>,
}

fn fixture(config: EngineConfig) -> Fixture {
    let clock = Arc::new(ManualClock::new(t0()));
    let events = Arc::new(RecordingEventSink::new());
    let engine = Engine::builder(config)
        .clock(clock.clone())
        .rng(Arc::new(FixedRngSource::new(3)))
        .events(events.clone())
        .build()
        .unwrap();
    Fixture {
        engine,
        clock,
        events,
    }
}

fn device_profile(resource: &Resource) -> idrs_core::DeviceProfile {
    match &resource.profile {
        ResourceProfile::Device(d) => d.clone(),
        other => panic!("expected a device profile, got {other:?}"),
    }
}

#[test]
fn test_build_rejects_encryption_without_key() {
    let err = Engine::builder(EngineConfig {
        encryption_enabled: true,
        ..config()
    })
    .build()
    .err()
    .unwrap();
    assert!(matches!(err, EngineError::Config(_)));
}

#[test]
fn test_transport_bundle_from_bound_resources() {
    let f = fixture(config());
    assert_eq!(f.engine.transport("s1"), TransportBundle::default());

    let proxy = f
        .engine
        .acquire(AcquireRequest::new("s1", ResourceKind::Proxy).with_region("US"))
        .unwrap();
    let device = f
        .engine
        .acquire(AcquireRequest::new("s1", ResourceKind::Device))
        .unwrap();

    let bundle = f.engine.transport("s1");
    let proxy_config = bundle.proxy.unwrap();
    assert_eq!(proxy_config.server, "http://gw.example.net:7000");
    assert!(
        proxy_config
            .username
            .unwrap()
            .starts_with("customer-session-")
    );

    let device = f.engine.get(&device.resource_id).unwrap();
    let profile = device_profile(&device);
    let context = bundle.context.unwrap();
    assert_eq!(context.headers.get("User-Agent"), Some(&profile.user_agent));
    assert_eq!(context.timezone, profile.timezone);
    assert_eq!(
        context.geolocation,
        f.engine.get(&proxy.resource_id).unwrap().geolocation
    );
}

#[test]
fn test_update_profile_rejects_drastic_change_in_strict_mode() {
    let f = fixture(EngineConfig {
        consistency_level: ConsistencyLevel::Strict,
        ..config()
    });
    let binding = f
        .engine
        .acquire(AcquireRequest::new("s1", ResourceKind::Device).with_region("US"))
        .unwrap();
    let before = f.engine.get(&binding.resource_id).unwrap();

    let mut drastic = device_profile(&before);
    drastic.platform = "FreeBSD amd64".into();
    drastic.user_agent = "Mozilla/5.0 (X11; FreeBSD amd64)".into();
    drastic.webgl_renderer = "llvmpipe".into();
    drastic.screen.width += 1;
    let err = f
        .engine
        .update_profile("s1", &binding.resource_id, ResourceProfile::Device(drastic))
        .unwrap_err();
    match err {
        EngineError::ConsistencyViolation { violations } => {
            assert_eq!(violations, vec![ViolationKind::FingerprintDrasticChange]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(f.engine.get(&binding.resource_id).unwrap(), before);

    let mut minor = device_profile(&before);
    minor.timezone = "America/Chicago".into();
    let updated = f
        .engine
        .update_profile("s1", &binding.resource_id, ResourceProfile::Device(minor))
        .unwrap();
    assert_eq!(device_profile(&updated).timezone, "America/Chicago");
}

#[test]
fn test_update_profile_records_violation_in_moderate_mode() {
    let f = fixture(config());
    let binding = f
        .engine
        .acquire(AcquireRequest::new("s1", ResourceKind::Device).with_region("US"))
        .unwrap();
    let before = f.engine.get(&binding.resource_id).unwrap();
    let mut drastic = device_profile(&before);
    drastic.platform = "FreeBSD amd64".into();
    drastic.user_agent = "Mozilla/5.0 (X11; FreeBSD amd64)".into();
    drastic.locale = "eo".into();

    f.engine
        .update_profile("s1", &binding.resource_id, ResourceProfile::Device(drastic))
        .unwrap();
    assert!(f.events.events().iter().any(|e| matches!(
        e,
        EngineEvent::ConsistencyViolationDetected { .. }
    )));
}

#[test]
fn test_update_profile_kind_mismatch() {
    let f = fixture(config());
    let proxy = f
        .engine
        .acquire(AcquireRequest::new("s1", ResourceKind::Proxy).with_region("US"))
        .unwrap();
    let device = f
        .engine
        .acquire(AcquireRequest::new("s1", ResourceKind::Device))
        .unwrap();
    let device_profile = f.engine.get(&device.resource_id).unwrap().profile;
    let err = f
        .engine
        .update_profile("s1", &proxy.resource_id, device_profile)
        .unwrap_err();
    assert!(matches!(err, EngineError::Generation { .. }));
}

#[test]
fn test_report_outcome_requires_binding() {
    let f = fixture(config());
    let err = f
        .engine
        .report_outcome("ghost", ResourceKind::Proxy, SessionOutcome::Success)
        .unwrap_err();
    assert_eq!(err.to_string(), "Binding 'ghost/proxy' not found");
}

#[test]
fn test_report_outcome_counts_usage() {
    let f = fixture(config());
    let binding = f
        .engine
        .acquire(AcquireRequest::new("s1", ResourceKind::Proxy).with_region("US"))
        .unwrap();
    f.clock.advance(chrono::Duration::minutes(5));
    assert_eq!(
        f.engine
            .report_outcome("s1", ResourceKind::Proxy, SessionOutcome::Success)
            .unwrap(),
        None
    );
    f.engine
        .report_outcome("s1", ResourceKind::Proxy, SessionOutcome::Failure)
        .unwrap();

    let resource = f.engine.get(&binding.resource_id).unwrap();
    assert_eq!(resource.usage.session_count, 2);
    assert_eq!(resource.usage.success_count, 1);
    assert_eq!(resource.usage.failure_count, 1);
    assert_eq!(resource.status, ResourceStatus::Active);
}

#[tokio::test]
async fn test_memory_engine_start_and_shutdown() {
    let f = fixture(config());
    f.engine.start().await.unwrap();
    f.engine.start().await.unwrap();
    let report = f.engine.shutdown().await;
    assert!(report.tasks_stopped);
    assert!(report.drained);
    assert_eq!(report.flush, FlushReport::default());
}

#[test]
fn test_outcome_and_reports_serialize() {
    let outcome: SessionOutcome = serde_json::from_str("\"detected\"").unwrap();
    assert_eq!(outcome, SessionOutcome::Detected);

    let sweep = crate::SweepReport {
        rotated: 2,
        ..Default::default()
    };
    let json = serde_json::to_value(sweep).unwrap();
    assert_eq!(json["rotated"], 2);
    assert_eq!(json["failed"], 0);
}

#[tokio::test]
async fn test_stalled_flush_is_abandoned_with_warning() {
    let logs = LogCapture::default();
    let _guard = tracing::dispatcher::set_default(&logs.dispatch());

    let stalled = std::future::pending::<Option<FlushReport>>();
    assert_eq!(bounded("periodic", Duration::from_millis(20), stalled).await, None);
    let contents = logs.contents();
    assert!(
        contents.contains("Flush timed out") && contents.contains("periodic"),
        "Expected timeout warning, got: {contents}"
    );

    let done = FlushReport {
        written: 2,
        ..Default::default()
    };
    let ready = async move { Some(done) };
    assert_eq!(bounded("periodic", Duration::from_millis(20), ready).await, Some(done));
}

#[test]
fn test_released_sessions_leave_no_slots() {
    let f = fixture(config());
    for n in 0..20 {
        let session = format!("visit-{n}");
        f.engine
            .acquire(AcquireRequest::new(session.as_str(), ResourceKind::Proxy).with_region("US"))
            .unwrap();
        f.engine.release(&session, ResourceKind::Proxy).unwrap();
    }
    assert_eq!(f.engine.pool().slot_count(), 0);
    assert_eq!(f.engine.stats().live_bindings, 0);
}
