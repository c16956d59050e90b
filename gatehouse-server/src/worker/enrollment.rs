//! The worker authorization state machine.
//!
//! Two flows end in `Authorized`:
//! - controller-led: `NeedsCredentials → HasActivationToken → Authorized`,
//!   driven by a one-time activation token from configuration
//! - worker-led: `NeedsCredentials → AwaitingOperator → Authorized`, driven
//!   by a published auth request token that an operator countersigns at a
//!   controller
//!
//! The machine runs sequentially in the worker's start path, which is what
//! keeps concurrent writes to the on-disk credentials impossible.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use gatehouse_auth::{AuthRequestToken, CredentialBundle, PrivateKey, PublicKey};
use gatehouse_core::config::RejectionPolicy;

use crate::cluster::{self, ClusterError, ControllerResponse, WorkerRequest};
use super::storage::CredentialStorage;

/// How long a single upstream dial may take.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Ceiling for the exponential retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Where the worker stands in obtaining a usable credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentState {
    NeedsCredentials,
    HasActivationToken,
    AwaitingOperator,
    Authorized,
}

impl EnrollmentState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentState::NeedsCredentials => "needs-credentials",
            EnrollmentState::HasActivationToken => "has-activation-token",
            EnrollmentState::AwaitingOperator => "awaiting-operator",
            EnrollmentState::Authorized => "authorized",
        }
    }
}

impl std::fmt::Display for EnrollmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum ActivationOutcome {
    Issued(CredentialBundle),
    FellThrough,
    Cancelled,
}

pub(crate) struct Enroller {
    worker_name: String,
    upstreams: Vec<String>,
    storage: CredentialStorage,
    /// Taken (and thereby retired from live configuration) when the
    /// controller-led flow begins.
    activation_token: Option<String>,
    policy: RejectionPolicy,
    state_tx: watch::Sender<EnrollmentState>,
}

impl Enroller {
    pub fn new(
        worker_name: String,
        upstreams: Vec<String>,
        storage: CredentialStorage,
        activation_token: Option<String>,
        policy: RejectionPolicy,
    ) -> (Self, watch::Receiver<EnrollmentState>) {
        let (state_tx, state_rx) = watch::channel(EnrollmentState::NeedsCredentials);
        (
            Self {
                worker_name,
                upstreams,
                storage,
                activation_token,
                policy,
                state_tx,
            },
            state_rx,
        )
    }

    fn transition(&self, state: EnrollmentState) {
        tracing::info!(worker = %self.worker_name, state = %state, "enrollment state");
        let _ = self.state_tx.send(state);
    }

    /// Drive the machine to `Authorized`.
    ///
    /// Returns `Ok(None)` when cancelled mid-flow; that is a clean shutdown,
    /// not a failure.
    ///
    /// # Errors
    ///
    /// Storage failures, and a permanent activation rejection under the
    /// `exit` policy.
    pub async fn resolve(
        mut self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<CredentialBundle>> {
        // Step 1: a valid persisted credential wins outright; the activation
        // token is not even looked at.
        if let Some(bundle) = self.storage.load()? {
            match bundle.verify(gatehouse_auth::unix_now()) {
                Ok(()) => {
                    self.storage.remove_request_token();
                    self.transition(EnrollmentState::Authorized);
                    return Ok(Some(bundle));
                }
                Err(e) => {
                    tracing::warn!(
                        worker = %self.worker_name,
                        error = %e,
                        "persisted credentials are no longer valid, re-enrolling"
                    );
                }
            }
        }

        // Steps 2–3: controller-led, when a token was configured.
        if let Some(token) = self.activation_token.take() {
            self.transition(EnrollmentState::HasActivationToken);
            match self.run_activation(&token, cancel).await? {
                ActivationOutcome::Issued(bundle) => return Ok(Some(bundle)),
                ActivationOutcome::Cancelled => return Ok(None),
                ActivationOutcome::FellThrough => {}
            }
        }

        // Step 4: worker-led.
        self.run_operator_flow(cancel).await
    }

    async fn run_activation(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ActivationOutcome> {
        let worker_key = PrivateKey::generate();
        let request = AuthRequestToken::generate(&worker_key).to_base64();

        let mut attempt: u32 = 0;
        loop {
            for upstream in &self.upstreams {
                if cancel.is_cancelled() {
                    return Ok(ActivationOutcome::Cancelled);
                }
                let message = WorkerRequest::Activate {
                    worker_name: self.worker_name.clone(),
                    token: token.to_string(),
                    request: request.clone(),
                };
                match exchange(upstream, &message).await {
                    Ok(ControllerResponse::Issued {
                        certificate,
                        issuer_public_key,
                    }) => {
                        match self.accept_issuance(&worker_key, certificate, &issuer_public_key) {
                            Ok(bundle) => {
                                self.transition(EnrollmentState::Authorized);
                                return Ok(ActivationOutcome::Issued(bundle));
                            }
                            Err(e) => {
                                tracing::error!(
                                    upstream = %upstream,
                                    error = %e,
                                    "upstream issued an unusable credential"
                                );
                            }
                        }
                    }
                    Ok(ControllerResponse::Rejected {
                        reason,
                        permanent: true,
                    }) => {
                        tracing::warn!(
                            upstream = %upstream,
                            reason = %reason,
                            "activation token permanently rejected"
                        );
                        return match self.policy {
                            RejectionPolicy::Fallback => Ok(ActivationOutcome::FellThrough),
                            RejectionPolicy::Exit => Err(anyhow::anyhow!(
                                "activation token permanently rejected by {upstream}: {reason}"
                            )),
                        };
                    }
                    Ok(ControllerResponse::Rejected { reason, .. }) => {
                        tracing::warn!(
                            upstream = %upstream,
                            reason = %reason,
                            "activation attempt failed, will retry"
                        );
                    }
                    Ok(other) => {
                        tracing::warn!(upstream = %upstream, response = ?other, "unexpected response");
                    }
                    Err(e) => {
                        tracing::debug!(upstream = %upstream, error = %e, "upstream dial failed");
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(backoff(attempt)) => {}
                _ = cancel.cancelled() => return Ok(ActivationOutcome::Cancelled),
            }
        }
    }

    async fn run_operator_flow(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<CredentialBundle>> {
        let worker_key = PrivateKey::generate();
        let request = AuthRequestToken::generate(&worker_key);
        self.storage.write_request_token(&request)?;

        // The token goes to stdout so an operator can pick it up from the
        // console as well as from the published file.
        println!("Worker Auth Request Token:\n  {request}");
        println!(
            "  (also written to {})",
            self.storage.request_token_path().display()
        );

        self.transition(EnrollmentState::AwaitingOperator);
        let encoded = request.to_base64();

        let mut attempt: u32 = 0;
        loop {
            for upstream in &self.upstreams {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                let message = WorkerRequest::Complete {
                    worker_name: self.worker_name.clone(),
                    request: encoded.clone(),
                };
                match exchange(upstream, &message).await {
                    Ok(ControllerResponse::Issued {
                        certificate,
                        issuer_public_key,
                    }) => match self.accept_issuance(&worker_key, certificate, &issuer_public_key) {
                        Ok(bundle) => {
                            self.storage.remove_request_token();
                            self.transition(EnrollmentState::Authorized);
                            return Ok(Some(bundle));
                        }
                        Err(e) => {
                            tracing::error!(
                                upstream = %upstream,
                                error = %e,
                                "upstream issued an unusable credential"
                            );
                        }
                    },
                    Ok(ControllerResponse::Pending) => {
                        tracing::debug!(upstream = %upstream, "auth request not yet approved");
                    }
                    Ok(ControllerResponse::Rejected { reason, permanent }) => {
                        tracing::warn!(
                            upstream = %upstream,
                            reason = %reason,
                            permanent,
                            "completion poll rejected"
                        );
                    }
                    Ok(other) => {
                        tracing::warn!(upstream = %upstream, response = ?other, "unexpected response");
                    }
                    Err(e) => {
                        tracing::debug!(upstream = %upstream, error = %e, "upstream dial failed");
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(backoff(attempt)) => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }

    /// Validate and persist an issued credential. Persistence is atomic with
    /// token retirement: the bundle is committed by rename, and the caller
    /// only ever presents the activation token again if this failed.
    fn accept_issuance(
        &self,
        worker_key: &PrivateKey,
        certificate: gatehouse_auth::WorkerCertificate,
        issuer_public_key: &[u8],
    ) -> anyhow::Result<CredentialBundle> {
        let issuer = PublicKey::from_bytes(issuer_public_key)
            .map_err(|e| anyhow::anyhow!("invalid issuer key in response: {e}"))?;
        let bundle = CredentialBundle::new(worker_key, certificate, &issuer);
        bundle
            .verify(gatehouse_auth::unix_now())
            .map_err(|e| anyhow::anyhow!("issued certificate does not verify: {e}"))?;
        self.storage.store(&bundle)?;
        Ok(bundle)
    }
}

/// One request/response exchange with an upstream.
pub(crate) async fn exchange(
    upstream: &str,
    request: &WorkerRequest,
) -> Result<ControllerResponse, ClusterError> {
    let mut stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(upstream))
        .await
        .map_err(|_| {
            ClusterError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "upstream dial timed out",
            ))
        })??;
    cluster::write_message(&mut stream, request).await?;
    cluster::read_message(&mut stream).await
}

/// Exponential backoff, capped.
pub(crate) fn backoff(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(5);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}
