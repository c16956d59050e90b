//! Controller subsystem.
//!
//! The controller owns two planes: the api plane (axum; health and operator
//! endpoints) and the cluster plane (framed TCP; worker enrollment and
//! attachment). Its signing identity, the issuing keypair, persists in the
//! control store sealed under the root KMS wrapper, so every controller
//! sharing a database issues interchangeable certificates.

pub mod api;
pub mod store;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use gatehouse_auth::{ActivationToken, AuthRequestToken, PrivateKey, PublicKey, WorkerCertificate};
use gatehouse_core::kms::Wrapper;

use crate::cluster::{self, ControllerResponse, WorkerRequest};
use crate::listener::BoundListener;
use crate::process::RuntimeParams;
use store::ControlStore;

/// Validity of certificates issued to workers.
pub const WORKER_CERT_VALIDITY_SECS: i64 = 30 * 24 * 60 * 60;

/// How long `shutdown(wait_for_worker)` waits for cluster connections to
/// drain before closing the plane anyway.
const WORKER_DRAIN_WAIT: Duration = Duration::from_secs(5);

const ISSUER_AAD: &[u8] = b"gatehouse-issuer-key-v1";

/// The controller's long-lived state, shared by both planes.
pub struct ControlPlane {
    pub name: String,
    store: Arc<dyn ControlStore>,
    issuer: PrivateKey,
}

impl ControlPlane {
    /// Load (or create and persist) the issuing keypair and assemble the
    /// plane.
    ///
    /// The keypair is stored sealed under the root wrapper. Creation is
    /// first-writer-wins across controllers sharing a database: after a
    /// conflicting store, the persisted copy is re-loaded and used.
    ///
    /// # Errors
    ///
    /// Store and unseal failures; both mean the controller cannot issue
    /// credentials and must not start.
    pub async fn open(
        name: &str,
        store: Arc<dyn ControlStore>,
        root_wrapper: Arc<dyn Wrapper>,
    ) -> anyhow::Result<Arc<Self>> {
        let sealed = match store
            .load_issuer()
            .await
            .context("error loading issuing key")?
        {
            Some(sealed) => sealed,
            None => {
                let fresh = PrivateKey::generate();
                let sealed = root_wrapper
                    .encrypt(&fresh.to_bytes(), ISSUER_AAD)
                    .context("error sealing issuing key")?;
                store
                    .store_issuer(&sealed)
                    .await
                    .context("error persisting issuing key")?;
                store
                    .load_issuer()
                    .await
                    .context("error re-loading issuing key")?
                    .context("issuing key missing after store")?
            }
        };

        let key_bytes = root_wrapper
            .decrypt(&sealed, ISSUER_AAD)
            .context("error unsealing issuing key")?;
        let issuer =
            PrivateKey::from_bytes(&key_bytes).context("persisted issuing key is malformed")?;

        tracing::info!(
            controller = %name,
            issuer = %issuer.public_key().fingerprint(),
            "issuing key loaded"
        );

        Ok(Arc::new(Self {
            name: name.to_string(),
            store,
            issuer,
        }))
    }

    /// Public half of the issuing keypair.
    #[must_use]
    pub fn issuer_public_key(&self) -> PublicKey {
        self.issuer.public_key()
    }

    /// Mint an activation token for the controller-led flow.
    #[must_use]
    pub fn mint_activation_token(&self, validity_secs: i64) -> ActivationToken {
        ActivationToken::generate(&self.issuer, validity_secs)
    }

    /// Operator countersign of a worker-led auth request token.
    ///
    /// # Errors
    ///
    /// Malformed tokens, failed possession proofs, and store failures.
    pub async fn approve_auth_request(&self, token: &str) -> anyhow::Result<()> {
        let request = AuthRequestToken::from_base64(token)
            .context("auth request token is malformed")?;
        request
            .verify()
            .context("auth request token failed its possession proof")?;
        self.store
            .approve_request(request.hash())
            .await
            .context("error recording approval")?;
        tracing::info!(
            request = %hex::encode(request.hash()),
            "worker auth request approved"
        );
        Ok(())
    }

    /// Dispatch one cluster-plane request.
    pub async fn handle_request(&self, request: WorkerRequest) -> ControllerResponse {
        match request {
            WorkerRequest::Activate {
                worker_name,
                token,
                request,
            } => self.handle_activate(&worker_name, &token, &request).await,
            WorkerRequest::Complete {
                worker_name,
                request,
            } => self.handle_complete(&worker_name, &request).await,
            WorkerRequest::Attach(hello) => self.handle_attach(&hello),
        }
    }

    async fn handle_activate(
        &self,
        worker_name: &str,
        token: &str,
        request: &str,
    ) -> ControllerResponse {
        let Ok(subject) = AuthRequestToken::from_base64(request).and_then(|r| r.verify()) else {
            tracing::warn!(worker = %worker_name, "activation carried an invalid auth request");
            return ControllerResponse::Rejected {
                reason: "invalid auth request".to_string(),
                permanent: true,
            };
        };

        // One generic message for parse, signature, and expiry failures so a
        // probing client cannot tell whether a token was ever legitimate.
        let rejected = || ControllerResponse::Rejected {
            reason: "activation token validation failed".to_string(),
            permanent: true,
        };
        let Ok(activation) = ActivationToken::from_base64(token) else {
            tracing::warn!(worker = %worker_name, "activation token parse failed");
            return rejected();
        };
        if let Err(e) = activation.validate(&self.issuer.public_key(), gatehouse_auth::unix_now()) {
            tracing::warn!(worker = %worker_name, error = %e, "activation token rejected");
            return rejected();
        }

        match self
            .store
            .consume_activation(activation.hash(), worker_name)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(worker = %worker_name, "activation token already consumed");
                return ControllerResponse::Rejected {
                    reason: "activation token already consumed".to_string(),
                    permanent: true,
                };
            }
            Err(e) => {
                tracing::error!(worker = %worker_name, error = %e, "control store unavailable");
                return ControllerResponse::Rejected {
                    reason: "control store unavailable".to_string(),
                    permanent: false,
                };
            }
        }

        let certificate = WorkerCertificate::issue(
            &self.issuer,
            worker_name,
            &subject,
            WORKER_CERT_VALIDITY_SECS,
        );
        tracing::info!(
            worker = %worker_name,
            subject = %subject.fingerprint(),
            "worker enrolled via activation token"
        );
        ControllerResponse::Issued {
            certificate,
            issuer_public_key: self.issuer.public_key().to_bytes().to_vec(),
        }
    }

    async fn handle_complete(&self, worker_name: &str, request: &str) -> ControllerResponse {
        let parsed = match AuthRequestToken::from_base64(request) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(worker = %worker_name, error = %e, "completion poll with malformed request");
                return ControllerResponse::Rejected {
                    reason: "invalid auth request".to_string(),
                    permanent: true,
                };
            }
        };
        let Ok(subject) = parsed.verify() else {
            return ControllerResponse::Rejected {
                reason: "invalid auth request".to_string(),
                permanent: true,
            };
        };

        match self.store.is_request_approved(parsed.hash()).await {
            Ok(true) => {
                let certificate = WorkerCertificate::issue(
                    &self.issuer,
                    worker_name,
                    &subject,
                    WORKER_CERT_VALIDITY_SECS,
                );
                tracing::info!(
                    worker = %worker_name,
                    subject = %subject.fingerprint(),
                    "worker enrolled via operator approval"
                );
                ControllerResponse::Issued {
                    certificate,
                    issuer_public_key: self.issuer.public_key().to_bytes().to_vec(),
                }
            }
            Ok(false) => ControllerResponse::Pending,
            Err(e) => {
                tracing::error!(worker = %worker_name, error = %e, "control store unavailable");
                ControllerResponse::Rejected {
                    reason: "control store unavailable".to_string(),
                    permanent: false,
                }
            }
        }
    }

    fn handle_attach(&self, hello: &cluster::WorkerHello) -> ControllerResponse {
        let now = gatehouse_auth::unix_now();
        let verified = hello
            .certificate
            .verify(&self.issuer.public_key(), now)
            .is_ok()
            && hello.certificate.worker_name == hello.name;
        if !verified {
            tracing::warn!(worker = %hello.name, "attach with unverifiable certificate");
            return ControllerResponse::Rejected {
                reason: "certificate verification failed".to_string(),
                permanent: true,
            };
        }
        tracing::info!(
            worker = %hello.name,
            public_addr = ?hello.public_addr,
            tags = ?hello.tags,
            "worker attached"
        );
        ControllerResponse::Attached
    }
}

/// Long-lived controller instance.
pub struct Controller {
    plane: Arc<ControlPlane>,
    params: Arc<RuntimeParams>,
    api_cancel: CancellationToken,
    cluster_cancel: CancellationToken,
    api_task: Option<JoinHandle<()>>,
    cluster_task: Option<JoinHandle<()>>,
    active_cluster_conns: Arc<AtomicUsize>,
}

impl Controller {
    #[must_use]
    pub fn new(plane: Arc<ControlPlane>, params: Arc<RuntimeParams>) -> Self {
        Self {
            plane,
            params,
            api_cancel: CancellationToken::new(),
            cluster_cancel: CancellationToken::new(),
            api_task: None,
            cluster_task: None,
            active_cluster_conns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared state, for in-process callers (operator tooling, tests).
    #[must_use]
    pub fn plane(&self) -> Arc<ControlPlane> {
        self.plane.clone()
    }

    /// Wire both planes onto their listeners and publish health.
    ///
    /// # Errors
    ///
    /// Listener address inspection failures only; the serve loops report
    /// their own errors through logging and shutdown.
    pub async fn start(
        &mut self,
        api: BoundListener,
        cluster: BoundListener,
    ) -> anyhow::Result<()> {
        let api_addr = api.local_addr().context("api listener address")?;
        let cluster_addr = cluster.local_addr().context("cluster listener address")?;

        let router = api::router(self.plane.clone());
        let api_cancel = self.api_cancel.clone();
        self.api_task = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(api.listener, router)
                .with_graceful_shutdown(api_cancel.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "api plane terminated with error");
            }
        }));

        let plane = self.plane.clone();
        let cluster_cancel = self.cluster_cancel.clone();
        let active = self.active_cluster_conns.clone();
        let request_deadline = self.params.default_max_request_duration;
        self.cluster_task = Some(tokio::spawn(cluster_accept_loop(
            plane,
            cluster.listener,
            cluster_cancel,
            active,
            request_deadline,
        )));

        tracing::info!(
            controller = %self.plane.name,
            api = %api_addr,
            cluster = %cluster_addr,
            "controller started"
        );
        Ok(())
    }

    /// Ordered teardown: api plane first, then the cluster plane, optionally
    /// waiting for the local worker to drain its cluster connections.
    ///
    /// # Errors
    ///
    /// Join failures from the plane tasks.
    pub async fn shutdown(&mut self, wait_for_worker: bool) -> anyhow::Result<()> {
        self.api_cancel.cancel();
        if let Some(task) = self.api_task.take() {
            task.await.context("api plane task panicked")?;
        }

        if wait_for_worker {
            let deadline = tokio::time::Instant::now() + WORKER_DRAIN_WAIT;
            while self.active_cluster_conns.load(Ordering::SeqCst) > 0 {
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(
                        remaining = self.active_cluster_conns.load(Ordering::SeqCst),
                        "closing cluster plane with worker connections still open"
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        self.cluster_cancel.cancel();
        if let Some(task) = self.cluster_task.take() {
            task.await.context("cluster plane task panicked")?;
        }

        tracing::info!(controller = %self.plane.name, "controller stopped");
        Ok(())
    }
}

async fn cluster_accept_loop(
    plane: Arc<ControlPlane>,
    listener: tokio::net::TcpListener,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
    request_deadline: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "cluster connection accepted");
                    let plane = plane.clone();
                    let cancel = cancel.clone();
                    let active = active.clone();
                    tokio::spawn(async move {
                        active.fetch_add(1, Ordering::SeqCst);
                        handle_cluster_conn(plane, stream, cancel, request_deadline).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cluster accept failed");
                }
            }
        }
    }
}

async fn handle_cluster_conn(
    plane: Arc<ControlPlane>,
    stream: TcpStream,
    cancel: CancellationToken,
    request_deadline: Duration,
) {
    let (mut reader, mut writer) = stream.into_split();
    // The initial request must arrive within the process-wide deadline; an
    // established attachment afterwards may idle indefinitely.
    let mut next: Option<WorkerRequest> = tokio::select! {
        _ = cancel.cancelled() => return,
        first_read = tokio::time::timeout(request_deadline, cluster::read_message(&mut reader)) => {
            match first_read {
                Ok(Ok(request)) => Some(request),
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "cluster connection closed");
                    return;
                }
                Err(_) => {
                    tracing::warn!("cluster connection sent no request within the deadline");
                    return;
                }
            }
        }
    };

    loop {
        let request: WorkerRequest = match next.take() {
            Some(request) => request,
            None => tokio::select! {
                _ = cancel.cancelled() => return,
                read = cluster::read_message(&mut reader) => match read {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::debug!(error = %e, "cluster connection closed");
                        return;
                    }
                }
            },
        };

        let holds_open = matches!(&request, WorkerRequest::Attach(_));
        let response = plane.handle_request(request).await;
        let accepted = matches!(&response, ControllerResponse::Attached);
        if let Err(e) = cluster::write_message(&mut writer, &response).await {
            tracing::debug!(error = %e, "cluster response write failed");
            return;
        }
        // Enrollment exchanges are one-shot; an accepted attach holds the
        // connection open as the attachment itself.
        if !(holds_open && accepted) {
            return;
        }
    }
}
