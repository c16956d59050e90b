//! Token and certificate error types.

/// Errors produced while parsing or validating credential artifacts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TokenError {
    /// The encoded artifact could not be decoded into its wire shape.
    #[error("malformed token")]
    Malformed,

    /// The artifact's validity window has passed.
    #[error("token expired")]
    Expired,

    /// The signature did not verify against the expected key.
    #[error("invalid signature")]
    BadSignature,

    /// The artifact names a different issuer than the verifying key.
    #[error("issuer mismatch")]
    IssuerMismatch,

    /// The certificate does not cover the presented public key.
    #[error("subject key mismatch")]
    KeyMismatch,
}
