use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tempfile::tempdir;

use idrs_core::{
    DeviceProfile, Geolocation, ProxyProfile, ProxyProtocol, Resource, ResourceId,
    ResourceProfile, ResourceStatus, RotationStrategy, ScreenProfile,
};
use idrs_store::{AesGcmCipher, Cipher, Envelope, PersistOutcome, SnapshotStore};

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-10-19T08:30:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn device_resource() -> Resource {
    let mut r = Resource::new(
        ResourceId::generate(),
        ResourceProfile::Device(DeviceProfile {
            platform: "MacIntel".into(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)".into(),
            browser_version: "127.0".into(),
            screen: ScreenProfile {
                width: 1440,
                height: 900,
                pixel_ratio: 2.0,
            },
            hardware_concurrency: 10,
            device_memory_gb: 16,
            timezone: "Europe/London".into(),
            locale: "en-GB".into(),
            languages: vec!["en-GB".into(), "en".into()],
            webgl_vendor: "Apple Inc.".into(),
            webgl_renderer: "Apple M2".into(),
            fingerprint_seed: 7,
        }),
        Some(Geolocation {
            latitude: 51.5,
            longitude: -0.12,
            region: "GB".into(),
        }),
        RotationStrategy::Adaptive,
        t0(),
    );
    r.usage.record_session(t0(), true);
    r.usage.record_session(t0() + Duration::days(1), false);
    r.health.score = 0.75;
    r.health.consecutive_failures = 2;
    r.record_detection(t0() + Duration::hours(3));
    r.status = ResourceStatus::Quarantined;
    r.quarantined_at = Some(t0() + Duration::hours(3));
    r.quarantine_until = Some(t0() + Duration::hours(3) + Duration::minutes(10));
    r.rotation.generation = 2;
    r.rotation.predecessor = Some(ResourceId::from("01PREDECESSOR0000000000000"));
    r
}

fn proxy_resource() -> Resource {
    Resource::new(
        ResourceId::generate(),
        ResourceProfile::Proxy(ProxyProfile {
            host: "gw.example.net".into(),
            port: 7000,
            username: Some("customer-session-abc123".into()),
            password: Some("pw".into()),
            country: "US".into(),
            protocol: ProxyProtocol::Http,
        }),
        None,
        RotationStrategy::UsageBased,
        t0(),
    )
}

#[test]
fn roundtrip_plaintext() {
    let dir = tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().to_path_buf(), None);
    let resource = device_resource();

    assert_eq!(store.persist(&resource).unwrap(), PersistOutcome::Written);
    let raw = std::fs::read_to_string(store.path_for(&resource.id)).unwrap();
    assert!(raw.contains("\"daily_counts\""));
    assert!(raw.contains("Apple M2"));

    let loaded = store.load(&resource.id).unwrap().unwrap();
    assert_eq!(loaded, resource);
}

#[test]
fn roundtrip_encrypted() {
    let dir = tempdir().unwrap();
    let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::from_secret("s3cret"));
    let store = SnapshotStore::new(dir.path().to_path_buf(), Some(cipher));
    let resource = device_resource();

    store.persist(&resource).unwrap();
    let raw = std::fs::read(store.path_for(&resource.id)).unwrap();
    let envelope: Envelope = serde_json::from_slice(&raw).unwrap();
    assert_eq!(envelope.algorithm, "aes-256-gcm");
    assert!(!String::from_utf8_lossy(&raw).contains("Apple M2"));

    let loaded = store.load(&resource.id).unwrap().unwrap();
    assert_eq!(loaded, resource);
}

#[test]
fn missing_snapshot_is_none() {
    let dir = tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().to_path_buf(), None);
    assert!(store.load(&ResourceId::from("absent")).unwrap().is_none());
}

#[test]
fn corrupt_snapshot_is_none_not_error() {
    let dir = tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().to_path_buf(), None);
    let id = ResourceId::from("broken");
    std::fs::write(store.path_for(&id), b"{not json").unwrap();
    assert!(store.load(&id).unwrap().is_none());
}

#[test]
fn wrong_key_is_none_not_error() {
    let dir = tempdir().unwrap();
    let writer = SnapshotStore::new(
        dir.path().to_path_buf(),
        Some(Arc::new(AesGcmCipher::from_secret("key-a"))),
    );
    let resource = proxy_resource();
    writer.persist(&resource).unwrap();

    let reader = SnapshotStore::new(
        dir.path().to_path_buf(),
        Some(Arc::new(AesGcmCipher::from_secret("key-b"))),
    );
    assert!(reader.load(&resource.id).unwrap().is_none());
}

#[test]
fn plaintext_snapshot_readable_with_encryption_enabled() {
    let dir = tempdir().unwrap();
    let resource = proxy_resource();
    SnapshotStore::new(dir.path().to_path_buf(), None)
        .persist(&resource)
        .unwrap();

    let encrypted = SnapshotStore::new(
        dir.path().to_path_buf(),
        Some(Arc::new(AesGcmCipher::from_secret("k"))),
    );
    assert_eq!(encrypted.load(&resource.id).unwrap().unwrap(), resource);
}

#[test]
fn concurrent_persist_skips_when_locked() {
    let dir = tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().to_path_buf(), None);
    let resource = proxy_resource();

    let _held = idrs_lock::try_acquire(dir.path(), resource.id.as_str())
        .unwrap()
        .unwrap();
    assert_eq!(store.persist(&resource).unwrap(), PersistOutcome::Skipped);
    assert!(store.load(&resource.id).unwrap().is_none());
}

#[test]
fn load_all_skips_temp_and_corrupt_files() {
    let dir = tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().to_path_buf(), None);
    let a = proxy_resource();
    let b = device_resource();
    store.persist(&a).unwrap();
    store.persist(&b).unwrap();
    std::fs::write(dir.path().join("garbage.json"), b"[]").unwrap();
    std::fs::write(dir.path().join("partial.json.tmp"), b"{").unwrap();

    let loaded = store.load_all().unwrap();
    assert_eq!(loaded.len(), 2);
    assert!(loaded.iter().any(|r| r.id == a.id));
    assert!(loaded.iter().any(|r| r.id == b.id));
}

#[test]
fn load_all_on_missing_directory_is_empty() {
    let dir = tempdir().unwrap();
    let store = SnapshotStore::new(dir.path().join("nope"), None);
    assert!(store.load_all().unwrap().is_empty());
}
