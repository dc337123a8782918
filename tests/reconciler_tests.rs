//! Integration tests for the reconciliation loop
//!
//! Drives full cycles against a mocked orchestrator and secret store,
//! verifying that stored records converge on what is actually running.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use chal_control::flag::{FlagResolver, HttpSecretClient};
use chal_control::orchestrator::OrchestratorClient;
use chal_control::reconciler::{Reconciler, ReconcilerConfig};
use chal_control::status::ChallengeStatus;
use chal_control::store::{ChallengeInstance, InstanceStore, MemoryInstanceStore};

// ============================================================================
// TEST HELPERS
// ============================================================================

fn reconciler(
    server: &MockServer,
    store: Arc<MemoryInstanceStore>,
) -> Reconciler<MemoryInstanceStore, HttpSecretClient> {
    let orchestrator =
        OrchestratorClient::new(&server.base_url(), Duration::from_secs(2)).unwrap();
    let secrets =
        HttpSecretClient::new(&server.base_url(), None, Duration::from_secs(2)).unwrap();
    Reconciler::new(
        store,
        orchestrator,
        FlagResolver::new(secrets),
        ReconcilerConfig::default(),
    )
}

fn record(id: &str, challenge_id: &str, status: ChallengeStatus) -> ChallengeInstance {
    ChallengeInstance {
        id: id.to_string(),
        challenge_id: challenge_id.to_string(),
        user_id: "user-1".to_string(),
        challenge_image: "registry.local/img:1".to_string(),
        challenge_url: "https://chal.example.org".to_string(),
        status,
        flag_secret_name: "null".to_string(),
        flag: "null".to_string(),
    }
}

fn mock_phase(server: &MockServer, id: &str, phase: &str) {
    let body = json!({ "status": phase }).to_string();
    server.mock(|when, then| {
        when.method(GET).path(format!("/instances/{id}/status"));
        then.status(200)
            .header("content-type", "application/json")
            .body(body.clone());
    });
}

fn mock_secret(server: &MockServer, name: &str, status: u16, value: &str) {
    let body = json!({ "value": value }).to_string();
    server.mock(|when, then| {
        when.method(GET).path(format!("/secrets/{name}"));
        then.status(status)
            .header("content-type", "application/json")
            .body(body.clone());
    });
}

// ============================================================================
// CONVERGENCE TESTS
// ============================================================================

#[tokio::test]
async fn test_cycle_converges_live_and_stored_sets() {
    let server = MockServer::start();
    let store = Arc::new(MemoryInstanceStore::new());

    // Live: A (new) and B (tracked). Stored: B and C (vanished).
    let listing = json!([
        {
            "id": "ctfchal-pwn-aaaa1111",
            "userId": "user-7",
            "image": "registry.local/pwn:3",
            "url": "https://pwn.chal.example.org",
            "flagSecretName": "pwn-secret",
            "phase": "pending"
        },
        {
            "id": "ctfchal-web-bbbb2222",
            "userId": "user-2",
            "image": "registry.local/web:1",
            "url": "https://web.chal.example.org",
            "flagSecretName": "web-secret",
            "flag": "flag{embedded-b}",
            "phase": "running"
        }
    ])
    .to_string();
    server.mock(|when, then| {
        when.method(GET).path("/instances");
        then.status(200)
            .header("content-type", "application/json")
            .body(listing.clone());
    });
    mock_phase(&server, "ctfchal-pwn-aaaa1111", "pending");
    mock_phase(&server, "ctfchal-web-bbbb2222", "active");
    mock_secret(&server, "pwn-secret", 200, "flag{pwn}");

    // B's stored record already matches what the cycle will compute.
    store.seed(ChallengeInstance {
        id: "ctfchal-web-bbbb2222".to_string(),
        challenge_id: "web".to_string(),
        user_id: "user-2".to_string(),
        challenge_image: "registry.local/web:1".to_string(),
        challenge_url: "https://web.chal.example.org".to_string(),
        status: ChallengeStatus::Active,
        flag_secret_name: "web-secret".to_string(),
        flag: "flag{embedded-b}".to_string(),
    });
    store.seed(record(
        "ctfchal-old-cccc3333",
        "old",
        ChallengeStatus::Active,
    ));

    let engine = reconciler(&server, store.clone());
    let stats = engine.run_cycle().await.unwrap();

    assert_eq!(stats.live, 2);
    assert_eq!(stats.stored, 2);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.updated, 0);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.failed, 0);

    // A was admitted with the pending phase and its looked-up flag.
    let admitted = store
        .get_instance("ctfchal-pwn-aaaa1111")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(admitted.challenge_id, "pwn");
    assert_eq!(admitted.user_id, "user-7");
    assert_eq!(admitted.status, ChallengeStatus::Creating);
    assert_eq!(admitted.flag, "flag{pwn}");
    assert_eq!(admitted.flag_secret_name, "pwn-secret");

    // C is gone, B untouched.
    assert!(store
        .get_instance("ctfchal-old-cccc3333")
        .await
        .unwrap()
        .is_none());
    assert_eq!(store.list_instances().await.unwrap().len(), 2);

    // A second pass over the same world writes nothing.
    let stats = engine.run_cycle().await.unwrap();
    assert!(stats.wrote_nothing(), "second cycle wrote: {stats:?}");
}

#[tokio::test]
async fn test_error_signal_moves_tracked_instance_to_error() {
    let server = MockServer::start();
    let store = Arc::new(MemoryInstanceStore::new());

    let listing = json!([
        {
            "id": "ctfchal-web-dddd4444",
            "userId": "user-1",
            "image": "registry.local/img:1",
            "url": "https://chal.example.org",
            "flag": "flag{d}",
            "phase": "failed"
        }
    ])
    .to_string();
    server.mock(|when, then| {
        when.method(GET).path("/instances");
        then.status(200)
            .header("content-type", "application/json")
            .body(listing.clone());
    });
    mock_phase(&server, "ctfchal-web-dddd4444", "failed");

    let mut stored = record("ctfchal-web-dddd4444", "web", ChallengeStatus::Active);
    stored.flag = "flag{d}".to_string();
    store.seed(stored);

    let engine = reconciler(&server, store.clone());
    let stats = engine.run_cycle().await.unwrap();

    assert_eq!(stats.updated, 1);
    let updated = store
        .get_instance("ctfchal-web-dddd4444")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.status, ChallengeStatus::Error);
}

#[tokio::test]
async fn test_terminated_instance_first_sighting_settles_at_error() {
    let server = MockServer::start();
    let store = Arc::new(MemoryInstanceStore::new());

    // The workload finished before the engine ever saw it.
    let listing = json!([
        {
            "id": "ctfchal-pwn-jjjj0000",
            "userId": "user-6",
            "image": "registry.local/pwn:1",
            "url": "https://j.chal.example.org",
            "flag": "flag{j}",
            "phase": "terminated"
        }
    ])
    .to_string();
    server.mock(|when, then| {
        when.method(GET).path("/instances");
        then.status(200)
            .header("content-type", "application/json")
            .body(listing.clone());
    });
    mock_phase(&server, "ctfchal-pwn-jjjj0000", "terminated");

    let engine = reconciler(&server, store.clone());
    let stats = engine.run_cycle().await.unwrap();

    assert_eq!(stats.created, 1);
    let admitted = store
        .get_instance("ctfchal-pwn-jjjj0000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(admitted.status, ChallengeStatus::Error);

    // Still dead, still listed: the record must not be rewritten.
    let stats = engine.run_cycle().await.unwrap();
    assert!(stats.wrote_nothing(), "second cycle wrote: {stats:?}");
    let settled = store
        .get_instance("ctfchal-pwn-jjjj0000")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.status, ChallengeStatus::Error);
}

#[tokio::test]
async fn test_running_listing_phase_overrides_error_signal() {
    let server = MockServer::start();
    let store = Arc::new(MemoryInstanceStore::new());

    // The status query claims failure but the listing still says running:
    // the instance is treated as alive.
    let listing = json!([
        {
            "id": "ctfchal-web-eeee5555",
            "userId": "user-1",
            "image": "registry.local/img:1",
            "url": "https://chal.example.org",
            "flag": "flag{e}",
            "phase": "running"
        }
    ])
    .to_string();
    server.mock(|when, then| {
        when.method(GET).path("/instances");
        then.status(200)
            .header("content-type", "application/json")
            .body(listing.clone());
    });
    mock_phase(&server, "ctfchal-web-eeee5555", "failed");

    let mut stored = record("ctfchal-web-eeee5555", "web", ChallengeStatus::Creating);
    stored.flag = "flag{e}".to_string();
    store.seed(stored);

    let engine = reconciler(&server, store.clone());
    let stats = engine.run_cycle().await.unwrap();

    assert_eq!(stats.updated, 1);
    let updated = store
        .get_instance("ctfchal-web-eeee5555")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.status, ChallengeStatus::Active);
}

#[tokio::test]
async fn test_failed_status_query_degrades_to_listing_phase() {
    let server = MockServer::start();
    let store = Arc::new(MemoryInstanceStore::new());

    let listing = json!([
        {
            "id": "ctfchal-web-ffff6666",
            "userId": "user-3",
            "image": "registry.local/img:2",
            "url": "https://f.chal.example.org",
            "flag": "flag{f}",
            "phase": "running"
        }
    ])
    .to_string();
    server.mock(|when, then| {
        when.method(GET).path("/instances");
        then.status(200)
            .header("content-type", "application/json")
            .body(listing.clone());
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/instances/ctfchal-web-ffff6666/status");
        then.status(500);
    });

    let engine = reconciler(&server, store.clone());
    let stats = engine.run_cycle().await.unwrap();

    assert_eq!(stats.created, 1);
    let admitted = store
        .get_instance("ctfchal-web-ffff6666")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(admitted.status, ChallengeStatus::Active);
}

#[tokio::test]
async fn test_listing_failure_counts_as_empty_live_set() {
    let server = MockServer::start();
    let store = Arc::new(MemoryInstanceStore::new());

    server.mock(|when, then| {
        when.method(GET).path("/instances");
        then.status(503);
    });

    store.seed(record("ctfchal-web-gggg7777", "web", ChallengeStatus::Active));

    let engine = reconciler(&server, store.clone());
    let stats = engine.run_cycle().await.unwrap();

    assert_eq!(stats.live, 0);
    assert_eq!(stats.deleted, 1);
    assert!(store.list_instances().await.unwrap().is_empty());
}

// ============================================================================
// FLAG RESOLUTION OVER HTTP
// ============================================================================

#[tokio::test]
async fn test_admission_retries_secret_under_derived_name() {
    let server = MockServer::start();
    let store = Arc::new(MemoryInstanceStore::new());

    let listing = json!([
        {
            "id": "ctfchal-sql-hhhh8888",
            "userId": "user-4",
            "image": "registry.local/sql:1",
            "url": "https://sql.chal.example.org",
            "flagSecretName": "stale-name",
            "phase": "running"
        }
    ])
    .to_string();
    server.mock(|when, then| {
        when.method(GET).path("/instances");
        then.status(200)
            .header("content-type", "application/json")
            .body(listing.clone());
    });
    mock_phase(&server, "ctfchal-sql-hhhh8888", "active");
    // The recorded name is gone; the store answers with its sentinel body.
    mock_secret(&server, "stale-name", 404, "null");
    mock_secret(&server, "ctfchal-sql-hhhh8888-flag", 200, "flag{recovered}");

    let engine = reconciler(&server, store.clone());
    let stats = engine.run_cycle().await.unwrap();

    assert_eq!(stats.created, 1);
    let admitted = store
        .get_instance("ctfchal-sql-hhhh8888")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(admitted.flag, "flag{recovered}");
    assert_eq!(admitted.flag_secret_name, "ctfchal-sql-hhhh8888-flag");
}

#[tokio::test]
async fn test_secret_store_outage_degrades_flag_to_sentinel() {
    let server = MockServer::start();
    let store = Arc::new(MemoryInstanceStore::new());

    let listing = json!([
        {
            "id": "ctfchal-web-iiii9999",
            "userId": "user-5",
            "image": "registry.local/web:2",
            "url": "https://i.chal.example.org",
            "flagSecretName": "web-secret",
            "phase": "running"
        }
    ])
    .to_string();
    server.mock(|when, then| {
        when.method(GET).path("/instances");
        then.status(200)
            .header("content-type", "application/json")
            .body(listing.clone());
    });
    mock_phase(&server, "ctfchal-web-iiii9999", "active");
    // Both lookups fail without a parseable body.
    for name in ["web-secret", "ctfchal-web-iiii9999-flag"] {
        server.mock(|when, then| {
            when.method(GET).path(format!("/secrets/{name}"));
            then.status(502).body("bad gateway");
        });
    }

    let engine = reconciler(&server, store.clone());
    let stats = engine.run_cycle().await.unwrap();

    // The instance is still admitted; only the flag degrades.
    assert_eq!(stats.created, 1);
    assert_eq!(stats.failed, 0);
    let admitted = store
        .get_instance("ctfchal-web-iiii9999")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(admitted.status, ChallengeStatus::Active);
    assert_eq!(admitted.flag, "null");
}
