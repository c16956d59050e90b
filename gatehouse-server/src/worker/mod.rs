//! Worker subsystem.
//!
//! A worker terminates client connections on its proxy listeners and
//! registers with upstream controllers over the cluster plane. Before it can
//! attach anywhere it must hold a usable credential; the enrollment state
//! machine in [`enrollment`] produces one, after which an attach loop per
//! upstream keeps the registration alive with reconnect backoff.

pub mod enrollment;
pub mod storage;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use gatehouse_core::config::WorkerConfig;
use gatehouse_core::kms::Wrapper;

use crate::cluster::{self, ControllerResponse, WorkerHello, WorkerRequest};
use crate::listener::BoundListener;
use enrollment::{backoff, EnrollmentState, Enroller};
use storage::CredentialStorage;

/// How long a single upstream dial may take during attach.
const ATTACH_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for cancelled session handlers to unwind.
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Per-upstream attachment health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamStatus {
    pub address: String,
    pub attached: bool,
}

/// Snapshot surfaced in the supervisor's status output.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub enrollment: EnrollmentState,
    pub upstreams: Vec<UpstreamStatus>,
    pub active_sessions: usize,
}

/// Long-lived worker instance.
pub struct Worker {
    name: String,
    public_addr: Option<String>,
    tags: BTreeMap<String, Vec<String>>,
    upstreams: Vec<String>,
    drain_grace: Duration,

    cancel: CancellationToken,
    session_cancel: CancellationToken,
    sessions: TaskTracker,
    active_sessions: Arc<AtomicUsize>,
    attachments: Arc<Mutex<BTreeMap<String, bool>>>,
    state_rx: watch::Receiver<EnrollmentState>,

    enroller: Option<Enroller>,
    tasks: Vec<JoinHandle<()>>,
}

impl Worker {
    /// Assemble a worker from configuration and the validated upstream list.
    ///
    /// # Errors
    ///
    /// A missing `auth_storage_path` or an unusable storage directory.
    pub fn new(
        config: &WorkerConfig,
        upstreams: Vec<String>,
        storage_wrapper: Option<Arc<dyn Wrapper>>,
        root: &CancellationToken,
    ) -> anyhow::Result<Self> {
        let storage_path = config
            .auth_storage_path
            .as_deref()
            .context("worker requires \"auth_storage_path\" to persist credentials")?;
        let storage = CredentialStorage::open(storage_path, storage_wrapper)?;

        let (enroller, state_rx) = Enroller::new(
            config.name.clone(),
            upstreams.clone(),
            storage,
            config.controller_generated_activation_token.clone(),
            config.on_activation_rejected,
        );

        let attachments = Arc::new(Mutex::new(
            upstreams.iter().map(|u| (u.clone(), false)).collect(),
        ));

        Ok(Self {
            name: config.name.clone(),
            public_addr: config.public_addr.clone(),
            tags: config.tags.clone(),
            upstreams,
            drain_grace: config.drain_grace(),
            cancel: root.child_token(),
            session_cancel: CancellationToken::new(),
            sessions: TaskTracker::new(),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            attachments,
            state_rx,
            enroller: Some(enroller),
            tasks: Vec::new(),
        })
    }

    /// Start proxy accept loops and the authorization driver.
    ///
    /// Enrollment continues in the background; in the worker-led flow this
    /// process may sit in `AwaitingOperator` indefinitely. `on_fatal` runs
    /// when enrollment fails terminally (permanent rejection under the
    /// `exit` policy, or a storage failure).
    ///
    /// # Errors
    ///
    /// Start is in-memory wiring only and currently cannot fail after
    /// construction; the signature leaves room for the data plane.
    pub async fn start(
        &mut self,
        proxies: Vec<BoundListener>,
        on_fatal: Box<dyn FnOnce(String) + Send>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.enroller.is_some(),
            "worker has already been started once"
        );

        for proxy in proxies {
            let addr = proxy.local_addr().context("proxy listener address")?;
            tracing::info!(worker = %self.name, proxy = %addr, "proxy listener ready");
            self.tasks.push(tokio::spawn(accept_loop(
                proxy.listener,
                self.cancel.clone(),
                self.session_cancel.clone(),
                self.sessions.clone(),
                self.active_sessions.clone(),
            )));
        }

        let enroller = self.enroller.take().expect("checked above");
        let cancel = self.cancel.clone();
        let attachments = self.attachments.clone();
        let hello_name = self.name.clone();
        let hello_addr = self.public_addr.clone();
        let hello_tags = self.tags.clone();
        let upstreams = self.upstreams.clone();

        self.tasks.push(tokio::spawn(async move {
            let bundle = match enroller.resolve(&cancel).await {
                Ok(Some(bundle)) => bundle,
                Ok(None) => return, // cancelled during enrollment
                Err(e) => {
                    tracing::error!(error = %e, "worker enrollment failed");
                    on_fatal(format!("worker enrollment failed: {e:#}"));
                    return;
                }
            };

            let hello = WorkerHello {
                name: hello_name,
                public_addr: hello_addr,
                tags: hello_tags,
                certificate: bundle.certificate().clone(),
            };

            let mut attach_tasks = JoinSet::new();
            for upstream in upstreams {
                attach_tasks.spawn(attach_loop(
                    upstream,
                    hello.clone(),
                    cancel.clone(),
                    attachments.clone(),
                ));
            }
            while attach_tasks.join_next().await.is_some() {}
        }));

        tracing::info!(worker = %self.name, "worker started");
        Ok(())
    }

    /// Attachment and session health for the status output.
    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        let attachments = self.attachments.lock().expect("attachment lock poisoned");
        WorkerStatus {
            enrollment: *self.state_rx.borrow(),
            upstreams: self
                .upstreams
                .iter()
                .map(|u| UpstreamStatus {
                    address: u.clone(),
                    attached: attachments.get(u).copied().unwrap_or(false),
                })
                .collect(),
            active_sessions: self.active_sessions.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting sessions; optionally wait for active ones to drain
    /// within the grace window before force-closing.
    ///
    /// # Errors
    ///
    /// Panicked subsystem tasks.
    pub async fn shutdown(&mut self, drain: bool) -> anyhow::Result<()> {
        tracing::info!(worker = %self.name, drain, "worker shutting down");
        self.cancel.cancel();
        self.sessions.close();

        let active = self.active_sessions.load(Ordering::SeqCst);
        if drain && active > 0 {
            tracing::info!(
                active,
                grace_secs = self.drain_grace.as_secs(),
                "waiting for proxied sessions to drain"
            );
            if tokio::time::timeout(self.drain_grace, self.sessions.wait())
                .await
                .is_err()
            {
                tracing::warn!(
                    remaining = self.active_sessions.load(Ordering::SeqCst),
                    "drain window expired, force closing sessions"
                );
            }
        }

        self.session_cancel.cancel();
        let _ = tokio::time::timeout(FORCE_CLOSE_WAIT, self.sessions.wait()).await;

        for task in self.tasks.drain(..) {
            task.await.context("worker task panicked")?;
        }
        tracing::info!(worker = %self.name, "worker stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    cancel: CancellationToken,
    session_cancel: CancellationToken,
    sessions: TaskTracker,
    active: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if sessions.is_closed() {
                        continue;
                    }
                    tracing::debug!(peer = %peer, "proxied session accepted");
                    sessions.spawn(handle_session(
                        stream,
                        session_cancel.clone(),
                        active.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "proxy accept failed");
                }
            }
        }
    }
}

/// Hold one proxied session until the peer closes or shutdown forces it.
///
/// Session authorization and the target-side dial belong to the proxying
/// data plane, which plugs in here; the lifecycle core only accounts for the
/// connection so drain has something real to wait on.
async fn handle_session(
    mut stream: TcpStream,
    session_cancel: CancellationToken,
    active: Arc<AtomicUsize>,
) {
    active.fetch_add(1, Ordering::SeqCst);
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            _ = session_cancel.cancelled() => break,
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
    active.fetch_sub(1, Ordering::SeqCst);
}

async fn attach_loop(
    upstream: String,
    hello: WorkerHello,
    cancel: CancellationToken,
    attachments: Arc<Mutex<BTreeMap<String, bool>>>,
) {
    let set_attached = |value: bool| {
        attachments
            .lock()
            .expect("attachment lock poisoned")
            .insert(upstream.clone(), value);
    };

    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match attach_once(&upstream, &hello, &cancel, &set_attached).await {
            Ok(()) => {
                // The attachment ended (controller closed or shutdown);
                // reconnect promptly unless we are stopping.
                attempt = 0;
            }
            Err(e) => {
                tracing::debug!(upstream = %upstream, error = %e, "attach attempt failed");
            }
        }
        set_attached(false);

        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(backoff(attempt)) => {}
            _ = cancel.cancelled() => break,
        }
    }
    set_attached(false);
}

async fn attach_once(
    upstream: &str,
    hello: &WorkerHello,
    cancel: &CancellationToken,
    set_attached: &impl Fn(bool),
) -> anyhow::Result<()> {
    let mut stream = tokio::time::timeout(ATTACH_DIAL_TIMEOUT, TcpStream::connect(upstream))
        .await
        .context("upstream dial timed out")??;

    cluster::write_message(&mut stream, &WorkerRequest::Attach(hello.clone())).await?;
    let response: ControllerResponse = cluster::read_message(&mut stream).await?;
    match response {
        ControllerResponse::Attached => {}
        ControllerResponse::Rejected { reason, permanent } => {
            anyhow::bail!("attach rejected (permanent={permanent}): {reason}");
        }
        other => anyhow::bail!("unexpected attach response: {other:?}"),
    }

    tracing::info!(upstream = %upstream, worker = %hello.name, "attached to upstream");
    set_attached(true);

    // Hold the attachment open; EOF or a read error means the upstream went
    // away and the caller will reconnect with backoff.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = cluster::read_frame(&mut stream) => {
                if let Err(e) = frame {
                    tracing::warn!(upstream = %upstream, error = %e, "upstream connection lost");
                    return Ok(());
                }
            }
        }
    }
}
