mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use rsmsl::classify::{CapabilitySet, ResolutionTier};
use rsmsl::client::{Clock, ManifestClient};
use rsmsl::config::{ClientConfig, RetryPolicy};
use rsmsl::device::DeviceIdentity;
use rsmsl::error::Error;
use rsmsl::keystore::SessionKeyStore;

use common::{cookies, title_manifest, FakeService};

const ESN: &str = "NFCDIE-02-INTEGRATION";

fn config() -> ClientConfig {
    ClientConfig {
        esn: ESN.to_string(),
        retry: RetryPolicy::none(),
        compress_requests: true,
        ..ClientConfig::default()
    }
}

fn device() -> DeviceIdentity {
    DeviceIdentity::generate(ESN, 1024).unwrap()
}

fn client(service: &Arc<FakeService>, store: SessionKeyStore, config: ClientConfig) -> ManifestClient {
    ManifestClient::new(device(), service.clone(), Arc::new(store), config)
}

struct ManualClock(AtomicU64);

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[test]
fn lookup_reports_title_formats() {
    let service = Arc::new(FakeService::new(title_manifest()));
    let client = client(&service, SessionKeyStore::in_memory(), config());

    let lookup = client.lookup("81215567", &cookies(), None).unwrap();
    let caps = &lookup.capabilities;
    assert_eq!(caps.resolution, ResolutionTier::Uhd);
    assert!(caps.dolby_vision);
    assert_eq!(caps.dolby_vision_profile, Some(5));
    assert!(caps.hdr10);
    assert!(caps.dolby_atmos);
    assert!(caps.dolby_digital);
    assert!(!caps.sdr);
    assert_eq!(lookup.representations.len(), 5);
    assert!(lookup.warnings.is_empty(), "{:?}", lookup.warnings);
    assert_eq!(lookup.title.as_deref(), Some("Arcane"));
    let sdh: Vec<bool> = lookup.text_tracks.iter().map(|t| t.sdh).collect();
    assert_eq!(sdh, vec![false, true]);

    assert_eq!(service.handshakes(), 1);
    assert!(service.saw_user_auth());
}

#[test]
fn second_lookup_reuses_session() {
    let service = Arc::new(FakeService::new(title_manifest()));
    let client = client(&service, SessionKeyStore::in_memory(), config());

    client.lookup("81215567", &cookies(), None).unwrap();
    client.lookup("80100172", &cookies(), None).unwrap();
    assert_eq!(service.handshakes(), 1);
    assert_eq!(service.manifests(), 2);
}

#[test]
fn corrupt_cache_file_triggers_fresh_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("msl_keys.json");
    std::fs::write(&path, b"{\"version\":1,\"entries\":{\"trunc").unwrap();

    let service = Arc::new(FakeService::new(title_manifest()));
    let client = client(&service, SessionKeyStore::open(&path), config());
    let lookup = client.lookup("81215567", &cookies(), None).unwrap();
    assert!(lookup.capabilities.dolby_vision);
    assert_eq!(service.handshakes(), 1);

    assert_eq!(SessionKeyStore::open(&path).entries().len(), 1);
}

#[test]
fn cached_keys_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("msl_keys.json");
    let service = Arc::new(FakeService::new(title_manifest()));

    client(&service, SessionKeyStore::open(&path), config())
        .lookup("81215567", &cookies(), None)
        .unwrap();
    client(&service, SessionKeyStore::open(&path), config())
        .lookup("81215567", &cookies(), None)
        .unwrap();

    assert_eq!(service.handshakes(), 1);
    assert_eq!(service.manifests(), 2);
}

#[test]
fn deleted_cache_file_forces_renegotiation_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("msl_keys.json");
    let service = Arc::new(FakeService::new(title_manifest()));

    client(&service, SessionKeyStore::open(&path), config())
        .lookup("81215567", &cookies(), None)
        .unwrap();
    std::fs::remove_file(&path).unwrap();
    client(&service, SessionKeyStore::open(&path), config())
        .lookup("81215567", &cookies(), None)
        .unwrap();

    assert_eq!(service.handshakes(), 2);
}

#[test]
fn concurrent_lookups_share_one_handshake() {
    let service = Arc::new(FakeService::new(title_manifest()).with_handshake_delay(Duration::from_millis(200)));
    let client = client(&service, SessionKeyStore::in_memory(), config());

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| client.lookup("81215567", &cookies(), None)))
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
    });

    assert_eq!(service.handshakes(), 1);
    assert_eq!(service.manifests(), 4);
}

#[test]
fn lookups_share_a_session_concurrently() {
    let delay = Duration::from_millis(300);
    let service = Arc::new(FakeService::new(title_manifest()).with_manifest_delay(delay));
    let client = client(&service, SessionKeyStore::in_memory(), config());
    client.lookup("81215567", &cookies(), None).unwrap();

    let started = Instant::now();
    std::thread::scope(|scope| {
        let handles: Vec<_> = ["80100172", "80057281", "81091393", "70143836"]
            .into_iter()
            .map(|asset| {
                let client = &client;
                scope.spawn(move || client.lookup(asset, &cookies(), None))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
    });

    assert!(started.elapsed() < delay * 3, "took {:?}", started.elapsed());
    assert_eq!(service.handshakes(), 1);
    assert_eq!(service.manifests(), 5);
}

#[test]
fn header_only_response_yields_default_capabilities() {
    let service = Arc::new(FakeService::new(title_manifest()));
    let client = client(&service, SessionKeyStore::in_memory(), config());
    service.header_only_next(1);

    let lookup = client.lookup("81215567", &cookies(), None).unwrap();
    assert_eq!(lookup.capabilities, CapabilitySet::default());
    assert!(lookup.representations.is_empty());
    assert!(!lookup.warnings.is_empty());
    assert_eq!(service.handshakes(), 1);
}

#[test]
fn replayed_response_renegotiates_once() {
    let service = Arc::new(FakeService::new(title_manifest()));
    let client = client(&service, SessionKeyStore::in_memory(), config());
    client.lookup("81215567", &cookies(), None).unwrap();

    service.replay_next(1);
    let lookup = client.lookup("80100172", &cookies(), None).unwrap();
    assert!(lookup.capabilities.dolby_vision);
    assert_eq!(service.handshakes(), 2);
    assert_eq!(service.manifests(), 3);
}

#[test]
fn persistent_replay_surfaces_replay_error() {
    let service = Arc::new(FakeService::new(title_manifest()));
    let client = client(&service, SessionKeyStore::in_memory(), config());
    service.replay_next(10);

    let err = client.lookup("81215567", &cookies(), None).unwrap_err();
    assert!(matches!(err, Error::Replay { .. }), "{:?}", err);
    assert_eq!(service.handshakes(), 2);
    assert!(client.store().entries().is_empty());
}

#[test]
fn revoked_master_token_renegotiates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("msl_keys.json");
    let first = Arc::new(FakeService::new(title_manifest()));
    client(&first, SessionKeyStore::open(&path), config())
        .lookup("81215567", &cookies(), None)
        .unwrap();

    // A service that never issued the cached token rejects it.
    let second = Arc::new(FakeService::new(title_manifest()));
    let lookup = client(&second, SessionKeyStore::open(&path), config())
        .lookup("81215567", &cookies(), None)
        .unwrap();
    assert!(lookup.capabilities.hdr10);
    assert_eq!(second.handshakes(), 1);
    assert_eq!(second.manifests(), 2);
}

#[test]
fn tampered_response_renegotiates_once() {
    let service = Arc::new(FakeService::new(title_manifest()));
    let client = client(&service, SessionKeyStore::in_memory(), config());
    service.tamper_next(1);

    let lookup = client.lookup("81215567", &cookies(), None).unwrap();
    assert!(lookup.capabilities.hdr10);
    assert_eq!(service.handshakes(), 2);
    assert_eq!(service.manifests(), 2);
}

#[test]
fn persistent_tampering_surfaces_integrity_error() {
    let service = Arc::new(FakeService::new(title_manifest()));
    let store = SessionKeyStore::in_memory();
    let client = client(&service, store, config());
    service.tamper_next(10);

    let err = client.lookup("81215567", &cookies(), None).unwrap_err();
    assert!(matches!(err, Error::Integrity(_)), "{:?}", err);
    assert_eq!(service.handshakes(), 2);
    assert_eq!(service.manifests(), 2);
    assert!(client.store().entries().is_empty());
}

#[test]
fn keys_expire_after_ttl() {
    let t = 1_700_000_000;
    let ttl = 3600;
    let clock = Arc::new(ManualClock(AtomicU64::new(t)));
    let service = Arc::new(FakeService::new(title_manifest()));
    let client = client(
        &service,
        SessionKeyStore::in_memory(),
        ClientConfig {
            key_ttl_secs: ttl,
            ..config()
        },
    )
    .with_clock(clock.clone());

    client.lookup("81215567", &cookies(), None).unwrap();
    assert_eq!(service.handshakes(), 1);

    clock.0.store(t + ttl - 1, Ordering::SeqCst);
    client.lookup("81215567", &cookies(), None).unwrap();
    assert_eq!(service.handshakes(), 1);

    clock.0.store(t + ttl + 1, Ordering::SeqCst);
    client.lookup("81215567", &cookies(), None).unwrap();
    assert_eq!(service.handshakes(), 2);
}

#[test]
fn rejected_handshake_is_retried() {
    let service = Arc::new(FakeService::new(title_manifest()));
    service.reject_next_handshakes(1);
    let client = client(
        &service,
        SessionKeyStore::in_memory(),
        ClientConfig {
            retry: RetryPolicy {
                attempts: 2,
                backoff_ms: 1,
            },
            ..config()
        },
    );

    client.lookup("81215567", &cookies(), None).unwrap();
    assert_eq!(service.handshakes(), 2);
}

#[test]
fn rejected_handshake_without_retries_fails() {
    let service = Arc::new(FakeService::new(title_manifest()));
    service.reject_next_handshakes(1);
    let client = client(&service, SessionKeyStore::in_memory(), config());

    let err = client.lookup("81215567", &cookies(), None).unwrap_err();
    assert!(matches!(err, Error::Handshake(_)));
    assert!(client.store().entries().is_empty());
}

#[test]
fn clear_session_forces_handshake() {
    let service = Arc::new(FakeService::new(title_manifest()));
    let client = client(&service, SessionKeyStore::in_memory(), config());

    client.lookup("81215567", &cookies(), None).unwrap();
    client.clear_session(&cookies()).unwrap();
    assert!(client.store().entries().is_empty());
    client.lookup("81215567", &cookies(), None).unwrap();
    assert_eq!(service.handshakes(), 2);
}

#[test]
fn unrecognized_manifest_is_not_an_error() {
    let service = Arc::new(FakeService::new(json!({ "links": {} })));
    let client = client(&service, SessionKeyStore::in_memory(), config());

    let lookup = client.lookup("81215567", &cookies(), None).unwrap();
    assert_eq!(lookup.capabilities, CapabilitySet::default());
    assert!(lookup.representations.is_empty());
    assert!(!lookup.warnings.is_empty());
}

#[test]
fn explicit_profiles_reach_the_service() {
    let service = Arc::new(FakeService::new(title_manifest()));
    let client = client(&service, SessionKeyStore::in_memory(), config());
    let profiles = vec!["hevc-dv5-main10-L51-dash-cenc".to_string(), "ddplus-atmos-dash".to_string()];

    client.lookup("81215567", &cookies(), Some(&profiles)).unwrap();
    assert_eq!(service.last_profiles(), json!(profiles));

    client.lookup("81215567", &cookies(), None).unwrap();
    assert_eq!(service.last_profiles(), json!(client.config().profiles));
}
