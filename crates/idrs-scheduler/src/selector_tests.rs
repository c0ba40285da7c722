use super::*;
use crate::test_support::{Harness, config};
use chrono::Duration;
use idrs_core::{ConsistencyLevel, ResourceStatus, RotationTrigger};

const PROXY: ResourceKind = ResourceKind::Proxy;
const DEVICE: ResourceKind = ResourceKind::Device;
const IDENTITY: ResourceKind = ResourceKind::SessionIdentity;

#[test]
fn test_acquire_creates_then_reuses() {
    let h = Harness::new(config());
    let first = h.acquire("s1", PROXY, Some("US")).unwrap();
    assert_eq!(first.reason, BindingReason::New);
    assert_eq!(h.region_of(&first.resource_id), "US");

    let second = h.acquire("s1", PROXY, Some("US")).unwrap();
    assert_eq!(second.resource_id, first.resource_id);
    assert_eq!(second.reason, BindingReason::Reused);
    assert_eq!(h.pool.ids(Some(PROXY)).len(), 1);
}

#[test]
fn test_existing_matching_resource_is_selected() {
    let h = Harness::new(config());
    let existing = h
        .pool
        .create(PROXY, &ResourceHints::region("US"))
        .unwrap();
    let binding = h.acquire("s1", PROXY, Some("US")).unwrap();
    assert_eq!(binding.resource_id, existing.id);
    assert_eq!(h.pool.ids(Some(PROXY)).len(), 1);
    assert!(h.ledger.last_for_resource(&existing.id).is_some());
}

#[test]
fn test_force_new_excludes_current() {
    let h = Harness::new(config());
    let first = h.acquire("s1", PROXY, Some("US")).unwrap();
    let second = h
        .selector
        .acquire(
            &AcquireRequest::new("s1", PROXY)
                .with_region("US")
                .with_force_new(true),
        )
        .unwrap();
    assert_ne!(second.resource_id, first.resource_id);
    assert_eq!(
        h.pool.get(&first.resource_id).unwrap().status,
        ResourceStatus::Active
    );

    let history = h.pool.rotation_history("s1");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].binding.resource_id, first.resource_id);
}

#[test]
fn test_region_is_a_hard_filter() {
    let h = Harness::new(config());
    let us = h.pool.create(PROXY, &ResourceHints::region("US")).unwrap();
    let binding = h.acquire("s1", PROXY, Some("DE")).unwrap();
    assert_ne!(binding.resource_id, us.id);
    assert_eq!(h.region_of(&binding.resource_id), "DE");
}

#[test]
fn test_region_change_rebinds_and_reports_violation() {
    let h = Harness::new(config());
    let us = h.acquire("s1", PROXY, Some("US")).unwrap();
    let de = h.acquire("s1", PROXY, Some("DE")).unwrap();
    assert_ne!(us.resource_id, de.resource_id);

    let reported = h.events.events().into_iter().any(|e| {
        matches!(
            e,
            EngineEvent::ConsistencyViolationDetected { ref violations, .. }
                if violations.contains(&ViolationKind::ImpossibleTravel)
        )
    });
    assert!(reported);
}

#[test]
fn test_unsupported_region_is_generation_error() {
    let h = Harness::new(config());
    let err = h.acquire("s1", PROXY, Some("ZZ")).unwrap_err();
    assert!(matches!(err, EngineError::Generation { .. }));
    assert!(h.pool.ids(None).is_empty());
    assert!(h.pool.binding("s1", PROXY).is_none());
}

#[test]
fn test_unservable_region_is_exhaustion() {
    let h = Harness::new(config());
    let err = h.acquire("s1", PROXY, Some("JP")).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Exhaustion {
            kind: ResourceKind::Proxy,
            ..
        }
    ));
    assert!(h.pool.binding("s1", PROXY).is_none());
}

#[test]
fn test_quarantined_binding_is_replaced() {
    let h = Harness::new(config());
    let first = h.acquire("s1", PROXY, Some("US")).unwrap();
    for _ in 0..5 {
        h.pool.mark_failed(&first.resource_id).unwrap();
    }
    let second = h.acquire("s1", PROXY, Some("US")).unwrap();
    assert_ne!(second.resource_id, first.resource_id);
    assert_eq!(second.reason, BindingReason::New);
}

#[test]
fn test_terminal_resources_are_never_selected() {
    let h = Harness::new(config());
    let burned = h.pool.create(PROXY, &ResourceHints::region("US")).unwrap();
    h.pool
        .dispose(
            &burned.id,
            ResourceStatus::Compromised,
            RotationTrigger::DetectionPattern,
        )
        .unwrap();
    for i in 0..5 {
        let binding = h.acquire(&format!("s{i}"), PROXY, Some("US")).unwrap();
        assert_ne!(binding.resource_id, burned.id);
    }
}

#[test]
fn test_session_region_is_inferred_for_new_resources() {
    let h = Harness::new(config());
    h.acquire("s1", PROXY, Some("DE")).unwrap();
    let device = h.acquire("s1", DEVICE, None).unwrap();
    assert_eq!(h.region_of(&device.resource_id), "DE");
}

#[test]
fn test_session_identity_links_bound_device() {
    let h = Harness::new(config());
    let device = h.acquire("s1", DEVICE, Some("DE")).unwrap();
    let identity = h.acquire("s1", IDENTITY, None).unwrap();

    let resource = h.pool.get(&identity.resource_id).unwrap();
    let ResourceProfile::SessionIdentity(profile) = &resource.profile else {
        panic!("expected a session identity");
    };
    assert_eq!(profile.device_id.as_ref(), Some(&device.resource_id));
    assert_eq!(resource.region(), Some("DE"));
}

#[test]
fn test_identity_linked_to_other_device_is_skipped() {
    let h = Harness::new(config());
    h.acquire("s1", DEVICE, Some("DE")).unwrap();
    let first = h.acquire("s1", IDENTITY, None).unwrap();

    let device = h.acquire("s2", DEVICE, Some("GB")).unwrap();
    let second = h.acquire("s2", IDENTITY, None).unwrap();
    assert_ne!(second.resource_id, first.resource_id);

    let resource = h.pool.get(&second.resource_id).unwrap();
    let ResourceProfile::SessionIdentity(profile) = &resource.profile else {
        panic!("expected a session identity");
    };
    assert_eq!(profile.device_id.as_ref(), Some(&device.resource_id));
}

#[test]
fn test_strict_mode_rejects_impossible_travel() {
    let h = Harness::new(EngineConfig {
        consistency_level: ConsistencyLevel::Strict,
        ..config()
    });
    h.acquire("s1", PROXY, Some("US")).unwrap();

    let err = h.acquire("s1", DEVICE, Some("DE")).unwrap_err();
    match err {
        EngineError::ConsistencyViolation { violations } => {
            assert!(violations.contains(&ViolationKind::ImpossibleTravel));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.pool.binding("s1", DEVICE).is_none());

    h.clock.advance(Duration::hours(12));
    let device = h.acquire("s1", DEVICE, Some("DE")).unwrap();
    assert_eq!(h.region_of(&device.resource_id), "DE");
}

#[test]
fn test_strict_rejection_leaves_no_created_resource() {
    let h = Harness::new(EngineConfig {
        consistency_level: ConsistencyLevel::Strict,
        ..config()
    });
    h.acquire("s1", PROXY, Some("US")).unwrap();
    let before = h.pool.stats();
    let dirty = h.pool.dirty().len();
    let created = |h: &Harness| {
        h.events
            .events()
            .iter()
            .filter(|e| matches!(e, EngineEvent::ResourceCreated { .. }))
            .count()
    };
    let announced = created(&h);

    for _ in 0..3 {
        let err = h.acquire("s1", DEVICE, Some("DE")).unwrap_err();
        assert!(matches!(err, EngineError::ConsistencyViolation { .. }));
    }
    assert_eq!(h.pool.stats(), before);
    assert!(h.pool.ids(Some(DEVICE)).is_empty());
    assert_eq!(h.pool.dirty().len(), dirty);
    assert_eq!(created(&h), announced);
}

#[test]
fn test_concurrent_acquire_same_session_binds_once() {
    let h = Harness::new(config());
    let results: Vec<Binding> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..100)
            .map(|_| scope.spawn(|| h.acquire("survey-1", PROXY, Some("US")).unwrap()))
            .collect();
        handles.into_iter().map(|t| t.join().unwrap()).collect()
    });

    assert_eq!(results.len(), 100);
    let winner = &results[0].resource_id;
    assert!(results.iter().all(|b| b.resource_id == *winner));
    assert_eq!(
        results
            .iter()
            .filter(|b| b.reason == BindingReason::New)
            .count(),
        1
    );
    assert_eq!(h.pool.ids(Some(PROXY)).len(), 1);
    assert_eq!(h.pool.live_bindings().len(), 1);
    assert_eq!(h.ledger.session_history("survey-1").len(), 1);
}
