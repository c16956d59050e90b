//! End-to-end enrollment flows over real loopback sockets: an in-process
//! controller with the in-memory control store, and workers driving both the
//! controller-led and worker-led state machines.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::prelude::*;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use gatehouse_auth::{ActivationToken, PrivateKey};
use gatehouse_core::config::validation::ListenerPurpose;
use gatehouse_core::config::{RejectionPolicy, WorkerConfig};
use gatehouse_core::kms::aead::AeadWrapper;
use gatehouse_core::kms::Wrapper;
use gatehouse_server::controller::store::MemoryControlStore;
use gatehouse_server::controller::{ControlPlane, Controller};
use gatehouse_server::listener::{BoundListener, Listeners, ReloadRegistry};
use gatehouse_server::process::RuntimeParams;
use gatehouse_server::worker::enrollment::EnrollmentState;
use gatehouse_server::worker::Worker;

fn root_wrapper() -> Arc<dyn Wrapper> {
    Arc::new(AeadWrapper::new(&BASE64_STANDARD.encode([11u8; 32])).unwrap())
}

async fn bind_one(purpose: ListenerPurpose) -> BoundListener {
    let reloads = ReloadRegistry::new();
    let mut listeners = Listeners::bind(&[(purpose, "127.0.0.1:0".to_string())], &reloads)
        .await
        .unwrap();
    listeners.take(purpose).unwrap()
}

/// Controller with both planes up on ephemeral loopback ports; returns the
/// cluster address workers should dial.
async fn start_controller(store: Arc<MemoryControlStore>) -> (Controller, String, Arc<ControlPlane>) {
    let plane = ControlPlane::open("c1", store, root_wrapper())
        .await
        .unwrap();
    let mut controller = Controller::new(plane.clone(), Arc::new(RuntimeParams::default()));

    let api = bind_one(ListenerPurpose::Api).await;
    let cluster = bind_one(ListenerPurpose::Cluster).await;
    let cluster_addr = cluster.local_addr().unwrap().to_string();

    controller.start(api, cluster).await.unwrap();
    (controller, cluster_addr, plane)
}

fn worker_config(storage: &Path, token: Option<String>) -> WorkerConfig {
    WorkerConfig {
        name: "w1".to_string(),
        public_addr: Some("127.0.0.1:9202".to_string()),
        initial_upstreams: Vec::new(),
        auth_storage_path: Some(storage.display().to_string()),
        controller_generated_activation_token: token,
        tags: BTreeMap::from([("type".to_string(), vec!["test".to_string()])]),
        on_activation_rejected: RejectionPolicy::Fallback,
        drain_grace_secs: Some(1),
    }
}

async fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn noop_fatal() -> Box<dyn FnOnce(String) + Send> {
    Box::new(|reason| panic!("unexpected fatal enrollment failure: {reason}"))
}

#[tokio::test]
async fn controller_led_enrollment_and_restart() {
    let store = Arc::new(MemoryControlStore::new());
    let (mut controller, cluster_addr, plane) = start_controller(store).await;
    let token = plane.mint_activation_token(300).to_base64();

    let storage = tempfile::tempdir().unwrap();
    let root = CancellationToken::new();

    let config = worker_config(storage.path(), Some(token));
    let mut worker = Worker::new(&config, vec![cluster_addr.clone()], None, &root).unwrap();
    let proxy = bind_one(ListenerPurpose::Proxy).await;
    worker.start(vec![proxy], noop_fatal()).await.unwrap();

    // NeedsCredentials -> HasActivationToken -> Authorized, then attached.
    wait_until("worker authorization", Duration::from_secs(10), || {
        worker.status().enrollment == EnrollmentState::Authorized
    })
    .await;
    wait_until("upstream attachment", Duration::from_secs(10), || {
        worker.status().upstreams.iter().all(|u| u.attached)
    })
    .await;

    // Credentials were persisted; no request token was ever published.
    assert!(storage.path().join("credentials").exists());
    assert!(!storage.path().join("auth_request_token").exists());

    worker.shutdown(true).await.unwrap();

    // A restarted worker with no activation token starts straight in
    // Authorized from the persisted bundle.
    let root = CancellationToken::new();
    let config = worker_config(storage.path(), None);
    let mut restarted = Worker::new(&config, vec![cluster_addr], None, &root).unwrap();
    let proxy = bind_one(ListenerPurpose::Proxy).await;
    restarted.start(vec![proxy], noop_fatal()).await.unwrap();

    wait_until("restart authorization", Duration::from_secs(10), || {
        restarted.status().enrollment == EnrollmentState::Authorized
    })
    .await;

    restarted.shutdown(false).await.unwrap();
    controller.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn worker_led_enrollment_via_operator_approval() {
    let store = Arc::new(MemoryControlStore::new());
    let (mut controller, cluster_addr, plane) = start_controller(store).await;

    let storage = tempfile::tempdir().unwrap();
    let root = CancellationToken::new();

    let config = worker_config(storage.path(), None);
    let mut worker = Worker::new(&config, vec![cluster_addr], None, &root).unwrap();
    let proxy = bind_one(ListenerPurpose::Proxy).await;
    worker.start(vec![proxy], noop_fatal()).await.unwrap();

    // The worker publishes its request token and waits for an operator.
    let token_path = storage.path().join("auth_request_token");
    wait_until("request token publication", Duration::from_secs(10), || {
        token_path.exists() && worker.status().enrollment == EnrollmentState::AwaitingOperator
    })
    .await;

    // Operator carries the token to the controller, which countersigns.
    let published = std::fs::read_to_string(&token_path).unwrap();
    plane.approve_auth_request(published.trim()).await.unwrap();

    wait_until("worker authorization", Duration::from_secs(20), || {
        worker.status().enrollment == EnrollmentState::Authorized
    })
    .await;
    assert!(storage.path().join("credentials").exists());
    // The published token is withdrawn once it has served its purpose.
    wait_until("request token removal", Duration::from_secs(5), || {
        !token_path.exists()
    })
    .await;

    worker.shutdown(true).await.unwrap();
    controller.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn foreign_activation_token_falls_through_to_operator_flow() {
    let store = Arc::new(MemoryControlStore::new());
    let (mut controller, cluster_addr, _plane) = start_controller(store).await;

    // Minted by a key no controller knows: permanently rejected.
    let foreign = ActivationToken::generate(&PrivateKey::generate(), 300).to_base64();

    let storage = tempfile::tempdir().unwrap();
    let root = CancellationToken::new();
    let config = worker_config(storage.path(), Some(foreign));
    let mut worker = Worker::new(&config, vec![cluster_addr], None, &root).unwrap();
    let proxy = bind_one(ListenerPurpose::Proxy).await;
    worker.start(vec![proxy], noop_fatal()).await.unwrap();

    wait_until("fallback to operator flow", Duration::from_secs(10), || {
        worker.status().enrollment == EnrollmentState::AwaitingOperator
    })
    .await;
    assert!(storage.path().join("auth_request_token").exists());

    worker.shutdown(false).await.unwrap();
    controller.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn exit_policy_makes_permanent_rejection_fatal() {
    let store = Arc::new(MemoryControlStore::new());
    let (mut controller, cluster_addr, _plane) = start_controller(store).await;

    let foreign = ActivationToken::generate(&PrivateKey::generate(), 300).to_base64();

    let storage = tempfile::tempdir().unwrap();
    let root = CancellationToken::new();
    let mut config = worker_config(storage.path(), Some(foreign));
    config.on_activation_rejected = RejectionPolicy::Exit;

    let mut worker = Worker::new(&config, vec![cluster_addr], None, &root).unwrap();
    let proxy = bind_one(ListenerPurpose::Proxy).await;

    let fatal: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let fatal_hook = {
        let fatal = fatal.clone();
        Box::new(move |reason: String| {
            *fatal.lock().unwrap() = Some(reason);
        })
    };
    worker.start(vec![proxy], fatal_hook).await.unwrap();

    wait_until("fatal enrollment failure", Duration::from_secs(10), || {
        fatal.lock().unwrap().is_some()
    })
    .await;
    let reason = fatal.lock().unwrap().clone().unwrap();
    assert!(reason.contains("permanently rejected"), "{reason}");

    worker.shutdown(false).await.unwrap();
    controller.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn worker_drains_sessions_within_grace_window() {
    let store = Arc::new(MemoryControlStore::new());
    let (mut controller, cluster_addr, plane) = start_controller(store).await;
    let token = plane.mint_activation_token(300).to_base64();

    let storage = tempfile::tempdir().unwrap();
    let root = CancellationToken::new();
    let config = worker_config(storage.path(), Some(token));
    let mut worker = Worker::new(&config, vec![cluster_addr], None, &root).unwrap();

    let proxy = bind_one(ListenerPurpose::Proxy).await;
    let proxy_addr = proxy.local_addr().unwrap();
    worker.start(vec![proxy], noop_fatal()).await.unwrap();

    wait_until("worker authorization", Duration::from_secs(10), || {
        worker.status().enrollment == EnrollmentState::Authorized
    })
    .await;

    // A client session that never closes on its own.
    let _session = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
    wait_until("session accounting", Duration::from_secs(5), || {
        worker.status().active_sessions == 1
    })
    .await;

    // Drain waits out the (1s) grace window, then force-closes.
    let begun = Instant::now();
    worker.shutdown(true).await.unwrap();
    let elapsed = begun.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "drain returned too early");
    assert!(elapsed < Duration::from_secs(8), "force close took too long");
    assert_eq!(worker.status().active_sessions, 0);

    controller.shutdown(true).await.unwrap();
}
