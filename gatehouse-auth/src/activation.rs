//! Controller-generated activation tokens.
//!
//! An activation token is the credential for the controller-led enrollment
//! flow: an operator mints one against a controller, places it in the
//! worker's configuration (literally or via `env://` / `file://`
//! indirection), and the worker presents it to an upstream exactly once on
//! first dial. Consumption tracking is the controller's job; this type only
//! covers the cryptographic shape.
//!
//! Wire format (v1, 137 bytes, base64 for transport):
//! - 1 byte: version
//! - 32 bytes: random nonce (entropy for one-time-use identification)
//! - 32 bytes: issuer fingerprint hash (SHA-256 of the issuing public key)
//! - 8 bytes: expiration (Unix seconds, big-endian i64)
//! - 64 bytes: Ed25519 signature over the domain-prefixed fields

use base64::prelude::*;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::TokenError;
use crate::identity::{Fingerprint, PrivateKey, PublicKey, Signature};

const TOKEN_VERSION: u8 = 1;
const WIRE_LEN: usize = 1 + 32 + 32 + 8 + 64;

/// Domain separation prefix; keeps activation signatures out of every other
/// signing context.
const DOMAIN_PREFIX: &[u8] = b"GATEHOUSE-ACTIVATION-v1:";

/// Shortest and longest validity an issuer will honor.
const MIN_VALIDITY_SECS: i64 = 60;
const MAX_VALIDITY_SECS: i64 = 14 * 24 * 60 * 60;

/// A one-time-use worker activation token signed by a controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationToken {
    version: u8,
    nonce: [u8; 32],
    issuer: [u8; 32],
    expires_at: i64,
    signature: Signature,
}

impl ActivationToken {
    /// Mint a new activation token.
    ///
    /// `validity_secs` is clamped to one minute through fourteen days. The
    /// issuer fingerprint is derived from the signing key and embedded so a
    /// worker can tell which controller the token belongs to.
    #[must_use]
    pub fn generate(issuer_key: &PrivateKey, validity_secs: i64) -> Self {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);

        let issuer = issuer_key.public_key().fingerprint().hash_bytes();
        let expires_at =
            crate::unix_now() + validity_secs.clamp(MIN_VALIDITY_SECS, MAX_VALIDITY_SECS);

        let message = signing_message(TOKEN_VERSION, &nonce, &issuer, expires_at);
        let signature = issuer_key.sign(&message);

        Self {
            version: TOKEN_VERSION,
            nonce,
            issuer,
            expires_at,
            signature,
        }
    }

    /// Validate the token against the issuing controller's public key.
    ///
    /// The signature is checked before the expiration so that probing with
    /// expired tokens does not reveal whether they were ever legitimate.
    ///
    /// # Errors
    ///
    /// `Malformed` for an unsupported version, `IssuerMismatch` when the
    /// embedded fingerprint names a different key, `BadSignature` or
    /// `Expired` otherwise.
    pub fn validate(&self, issuer: &PublicKey, now: i64) -> Result<(), TokenError> {
        if self.version != TOKEN_VERSION {
            return Err(TokenError::Malformed);
        }
        if self.issuer != issuer.fingerprint().hash_bytes() {
            return Err(TokenError::IssuerMismatch);
        }
        let message = signing_message(self.version, &self.nonce, &self.issuer, self.expires_at);
        if !issuer.verify(&message, &self.signature) {
            return Err(TokenError::BadSignature);
        }
        if now > self.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(())
    }

    /// Hash for consumption tracking. Only the nonce is hashed.
    #[must_use]
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(self.nonce).into()
    }

    /// Expiration timestamp (Unix seconds).
    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// The embedded issuer fingerprint.
    #[must_use]
    pub fn issuer_fingerprint(&self) -> Fingerprint {
        Fingerprint::from_hash_bytes(self.issuer)
    }

    /// Encode for transport.
    #[must_use]
    pub fn to_base64(&self) -> String {
        let mut bytes = Vec::with_capacity(WIRE_LEN);
        bytes.push(self.version);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.issuer);
        bytes.extend_from_slice(&self.expires_at.to_be_bytes());
        bytes.extend_from_slice(&self.signature.to_bytes());
        BASE64_STANDARD.encode(&bytes)
    }

    /// Decode from transport form.
    ///
    /// Accepts the dash-chunked `Display` form as well as plain base64.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Malformed` for any decoding problem.
    pub fn from_base64(encoded: &str) -> Result<Self, TokenError> {
        let clean: String = encoded.chars().filter(|c| *c != '-').collect();
        let bytes = BASE64_STANDARD
            .decode(clean.trim())
            .map_err(|_| TokenError::Malformed)?;
        if bytes.len() != WIRE_LEN {
            return Err(TokenError::Malformed);
        }
        if bytes[0] != TOKEN_VERSION {
            return Err(TokenError::Malformed);
        }
        let nonce: [u8; 32] = bytes[1..33].try_into().map_err(|_| TokenError::Malformed)?;
        let issuer: [u8; 32] = bytes[33..65].try_into().map_err(|_| TokenError::Malformed)?;
        let expires_at = i64::from_be_bytes(
            bytes[65..73].try_into().map_err(|_| TokenError::Malformed)?,
        );
        let signature =
            Signature::from_bytes(&bytes[73..WIRE_LEN]).map_err(|_| TokenError::Malformed)?;
        Ok(Self {
            version: bytes[0],
            nonce,
            issuer,
            expires_at,
            signature,
        })
    }
}

impl std::fmt::Display for ActivationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Chunked base64 so operators can read it back over the phone.
        let b64 = self.to_base64();
        let chunks: Vec<&str> = b64
            .as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).unwrap_or("????"))
            .collect();
        write!(f, "{}", chunks.join("-"))
    }
}

fn signing_message(version: u8, nonce: &[u8; 32], issuer: &[u8; 32], expires_at: i64) -> Vec<u8> {
    let mut message = Vec::with_capacity(DOMAIN_PREFIX.len() + 1 + 32 + 32 + 8);
    message.extend_from_slice(DOMAIN_PREFIX);
    message.push(version);
    message.extend_from_slice(nonce);
    message.extend_from_slice(issuer);
    message.extend_from_slice(&expires_at.to_be_bytes());
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_validate() {
        let key = PrivateKey::generate();
        let token = ActivationToken::generate(&key, 300);
        assert!(token.validate(&key.public_key(), crate::unix_now()).is_ok());
    }

    #[test]
    fn expired_token_rejected() {
        let key = PrivateKey::generate();
        let token = ActivationToken::generate(&key, 60);
        let far_future = crate::unix_now() + 86_400;
        assert_eq!(
            token.validate(&key.public_key(), far_future),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn wrong_issuer_rejected() {
        let a = PrivateKey::generate();
        let b = PrivateKey::generate();
        let token = ActivationToken::generate(&a, 300);
        assert_eq!(
            token.validate(&b.public_key(), crate::unix_now()),
            Err(TokenError::IssuerMismatch)
        );
    }

    #[test]
    fn base64_roundtrip_including_display_form() {
        let key = PrivateKey::generate();
        let token = ActivationToken::generate(&key, 300);

        let plain = ActivationToken::from_base64(&token.to_base64()).unwrap();
        assert_eq!(plain.hash(), token.hash());
        assert_eq!(plain.expires_at(), token.expires_at());

        let display = format!("{}", token);
        assert!(display.contains('-'));
        let chunked = ActivationToken::from_base64(&display).unwrap();
        assert_eq!(chunked.hash(), token.hash());
    }

    #[test]
    fn malformed_input_rejected() {
        assert_eq!(
            ActivationToken::from_base64("not base64!!"),
            Err(TokenError::Malformed)
        );
        // Valid base64, wrong length.
        assert_eq!(
            ActivationToken::from_base64("YWJjZA=="),
            Err(TokenError::Malformed)
        );
    }

    #[test]
    fn tampered_signature_rejected() {
        let key = PrivateKey::generate();
        let token = ActivationToken::generate(&key, 300);
        let mut raw = BASE64_STANDARD.decode(token.to_base64()).unwrap();
        raw[80] ^= 0xff;
        let tampered = ActivationToken::from_base64(&BASE64_STANDARD.encode(&raw)).unwrap();
        assert_eq!(
            tampered.validate(&key.public_key(), crate::unix_now()),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn hashes_are_unique_per_token() {
        let key = PrivateKey::generate();
        let a = ActivationToken::generate(&key, 300);
        let b = ActivationToken::generate(&key, 300);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn validity_clamped() {
        let key = PrivateKey::generate();
        let now = crate::unix_now();
        let short = ActivationToken::generate(&key, 1);
        assert!(short.expires_at() >= now + MIN_VALIDITY_SECS);
        let long = ActivationToken::generate(&key, i64::MAX);
        assert!(long.expires_at() <= now + MAX_VALIDITY_SECS + 1);
    }
}
