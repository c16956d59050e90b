//! Worker certificates and the persisted credential bundle.
//!
//! A [`WorkerCertificate`] is the controller's countersignature over a
//! worker's name and public key. It is what turns a keypair into a usable
//! credential: upstreams verify it on every attach. The certificate plus the
//! worker's secret key and the issuer's public key form the
//! [`CredentialBundle`] that the worker persists under its auth storage path.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::TokenError;
use crate::identity::{Fingerprint, PrivateKey, PublicKey, Signature};

const CERT_VERSION: u8 = 1;

const DOMAIN_PREFIX: &[u8] = b"GATEHOUSE-WORKER-CERT-v1:";

/// A signed binding of a worker name to its public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCertificate {
    version: u8,
    /// The worker name the certificate was issued to.
    pub worker_name: String,
    public_key: [u8; 32],
    /// Issuance timestamp (Unix seconds).
    pub issued_at: i64,
    /// Expiration timestamp (Unix seconds).
    pub expires_at: i64,
    issuer: [u8; 32],
    signature: Signature,
}

impl WorkerCertificate {
    /// Issue a certificate for `subject`, signed by the controller's key.
    #[must_use]
    pub fn issue(
        issuer_key: &PrivateKey,
        worker_name: &str,
        subject: &PublicKey,
        validity_secs: i64,
    ) -> Self {
        let issued_at = crate::unix_now();
        let expires_at = issued_at + validity_secs.max(60);
        let public_key = subject.to_bytes();
        let issuer = issuer_key.public_key().fingerprint().hash_bytes();

        let message = signing_message(
            CERT_VERSION,
            worker_name,
            &public_key,
            issued_at,
            expires_at,
            &issuer,
        );
        let signature = issuer_key.sign(&message);

        Self {
            version: CERT_VERSION,
            worker_name: worker_name.to_string(),
            public_key,
            issued_at,
            expires_at,
            issuer,
            signature,
        }
    }

    /// Verify the certificate against the issuing controller's public key.
    ///
    /// # Errors
    ///
    /// `Malformed`, `IssuerMismatch`, `BadSignature`, or `Expired`.
    pub fn verify(&self, issuer: &PublicKey, now: i64) -> Result<(), TokenError> {
        if self.version != CERT_VERSION {
            return Err(TokenError::Malformed);
        }
        if self.issuer != issuer.fingerprint().hash_bytes() {
            return Err(TokenError::IssuerMismatch);
        }
        let message = signing_message(
            self.version,
            &self.worker_name,
            &self.public_key,
            self.issued_at,
            self.expires_at,
            &self.issuer,
        );
        if !issuer.verify(&message, &self.signature) {
            return Err(TokenError::BadSignature);
        }
        if now > self.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(())
    }

    /// The public key this certificate covers.
    ///
    /// # Errors
    ///
    /// `Malformed` when the stored bytes are not a valid curve point.
    pub fn subject_key(&self) -> Result<PublicKey, TokenError> {
        PublicKey::from_bytes(&self.public_key).map_err(|_| TokenError::Malformed)
    }

    /// Fingerprint of the issuing key.
    #[must_use]
    pub fn issuer_fingerprint(&self) -> Fingerprint {
        Fingerprint::from_hash_bytes(self.issuer)
    }
}

fn signing_message(
    version: u8,
    worker_name: &str,
    public_key: &[u8; 32],
    issued_at: i64,
    expires_at: i64,
    issuer: &[u8; 32],
) -> Vec<u8> {
    // The name is length-prefixed so field boundaries cannot be shifted.
    let name = worker_name.as_bytes();
    let mut message =
        Vec::with_capacity(DOMAIN_PREFIX.len() + 1 + 2 + name.len() + 32 + 8 + 8 + 32);
    message.extend_from_slice(DOMAIN_PREFIX);
    message.push(version);
    message.extend_from_slice(&(name.len() as u16).to_be_bytes());
    message.extend_from_slice(name);
    message.extend_from_slice(public_key);
    message.extend_from_slice(&issued_at.to_be_bytes());
    message.extend_from_slice(&expires_at.to_be_bytes());
    message.extend_from_slice(issuer);
    message
}

/// The on-disk credential record for an authorized worker.
///
/// The secret key is zeroized when the bundle is dropped. Serialization is
/// plain serde; encryption at rest (when a `worker-auth-storage` wrapper is
/// configured) and file permissions are the storage layer's responsibility.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CredentialBundle {
    secret_key: [u8; 32],
    #[zeroize(skip)]
    certificate: WorkerCertificate,
    #[zeroize(skip)]
    issuer_public_key: [u8; 32],
}

impl CredentialBundle {
    /// Assemble a bundle from its parts.
    #[must_use]
    pub fn new(
        worker_key: &PrivateKey,
        certificate: WorkerCertificate,
        issuer: &PublicKey,
    ) -> Self {
        Self {
            secret_key: worker_key.to_bytes(),
            certificate,
            issuer_public_key: issuer.to_bytes(),
        }
    }

    /// Reconstruct the worker's private key.
    #[must_use]
    pub fn private_key(&self) -> PrivateKey {
        // 32 bytes is always a valid Ed25519 seed.
        PrivateKey::from_bytes(&self.secret_key).expect("stored secret key has fixed length")
    }

    /// The certificate held by this bundle.
    #[must_use]
    pub fn certificate(&self) -> &WorkerCertificate {
        &self.certificate
    }

    /// The issuing controller's public key.
    ///
    /// # Errors
    ///
    /// `Malformed` when the stored bytes are not a valid curve point.
    pub fn issuer_public_key(&self) -> Result<PublicKey, TokenError> {
        PublicKey::from_bytes(&self.issuer_public_key).map_err(|_| TokenError::Malformed)
    }

    /// Full self-check: certificate chain, validity window, and that the
    /// certificate actually covers the stored secret key.
    ///
    /// # Errors
    ///
    /// Any [`TokenError`] from certificate verification, plus `KeyMismatch`
    /// when certificate and secret key disagree.
    pub fn verify(&self, now: i64) -> Result<(), TokenError> {
        let issuer = self.issuer_public_key()?;
        self.certificate.verify(&issuer, now)?;
        let subject = self.certificate.subject_key()?;
        if subject.to_bytes() != self.private_key().public_key().to_bytes() {
            return Err(TokenError::KeyMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issued_bundle(validity: i64) -> (PrivateKey, CredentialBundle) {
        let issuer = PrivateKey::generate();
        let worker = PrivateKey::generate();
        let cert = WorkerCertificate::issue(&issuer, "w1", &worker.public_key(), validity);
        let bundle = CredentialBundle::new(&worker, cert, &issuer.public_key());
        (issuer, bundle)
    }

    #[test]
    fn issue_and_verify() {
        let (_issuer, bundle) = issued_bundle(3600);
        assert!(bundle.verify(crate::unix_now()).is_ok());
    }

    #[test]
    fn expired_certificate_rejected() {
        let (_issuer, bundle) = issued_bundle(60);
        assert_eq!(
            bundle.verify(crate::unix_now() + 86_400),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn wrong_issuer_rejected() {
        let issuer = PrivateKey::generate();
        let worker = PrivateKey::generate();
        let cert = WorkerCertificate::issue(&issuer, "w1", &worker.public_key(), 3600);
        let other = PrivateKey::generate();
        assert_eq!(
            cert.verify(&other.public_key(), crate::unix_now()),
            Err(TokenError::IssuerMismatch)
        );
    }

    #[test]
    fn renamed_certificate_fails_signature() {
        let issuer = PrivateKey::generate();
        let worker = PrivateKey::generate();
        let mut cert = WorkerCertificate::issue(&issuer, "w1", &worker.public_key(), 3600);
        cert.worker_name = "w2".to_string();
        assert_eq!(
            cert.verify(&issuer.public_key(), crate::unix_now()),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn bundle_detects_foreign_secret_key() {
        let issuer = PrivateKey::generate();
        let worker = PrivateKey::generate();
        let cert = WorkerCertificate::issue(&issuer, "w1", &worker.public_key(), 3600);
        // Bundle a different key under the same certificate.
        let imposter = PrivateKey::generate();
        let bundle = CredentialBundle::new(&imposter, cert, &issuer.public_key());
        assert_eq!(
            bundle.verify(crate::unix_now()),
            Err(TokenError::KeyMismatch)
        );
    }

    #[test]
    fn bundle_serde_roundtrip() {
        let (_issuer, bundle) = issued_bundle(3600);
        let json = serde_json::to_string(&bundle).unwrap();
        let restored: CredentialBundle = serde_json::from_str(&json).unwrap();
        assert!(restored.verify(crate::unix_now()).is_ok());
        assert_eq!(restored.certificate().worker_name, "w1");
    }
}
