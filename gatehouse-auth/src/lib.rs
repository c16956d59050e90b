//! Pure credential library for gatehouse worker authorization.
//!
//! This crate is intentionally IO-free:
//! - No filesystem operations
//! - No network calls
//! - No database interactions
//! - No logging
//!
//! It defines the three credential artifacts that flow through worker
//! enrollment, all built on Ed25519:
//! - [`ActivationToken`]: minted by a controller, handed to a worker
//!   out-of-band, presented once on first dial (controller-led flow)
//! - [`AuthRequestToken`]: self-generated by a worker and published for an
//!   operator to countersign (worker-led flow)
//! - [`WorkerCertificate`]: the controller's countersignature binding a
//!   worker name to its public key, carried in a [`CredentialBundle`]
//!
//! Storage, transport, and consumption tracking belong to the caller.

pub mod activation;
pub mod credential;
pub mod error;
pub mod identity;
pub mod request;

pub use activation::ActivationToken;
pub use credential::{CredentialBundle, WorkerCertificate};
pub use error::TokenError;
pub use identity::{Fingerprint, KeyError, PrivateKey, PublicKey, Signature};
pub use request::AuthRequestToken;

/// Current Unix timestamp in seconds.
///
/// # Panics
///
/// Panics if the system clock is set to before the Unix epoch, which
/// indicates a severely misconfigured host and is not recoverable.
#[must_use]
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_secs() as i64
}
