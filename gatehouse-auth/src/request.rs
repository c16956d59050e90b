//! Worker-generated auth request tokens.
//!
//! When a worker has no credentials and no activation token it publishes one
//! of these: a self-signed binding of its freshly generated public key and a
//! random nonce. An operator carries the token to a controller, the
//! controller records its hash as approved, and the worker's next completion
//! poll is answered with a signed certificate.
//!
//! The self-signature is proof of possession; it stops an operator from being
//! tricked into approving a key the requesting process never held.
//!
//! Wire format (v1, 137 bytes, base64 for transport):
//! - 1 byte: version
//! - 32 bytes: worker public key
//! - 32 bytes: random nonce
//! - 8 bytes: creation timestamp (Unix seconds, big-endian i64)
//! - 64 bytes: Ed25519 self-signature over the domain-prefixed fields

use base64::prelude::*;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::TokenError;
use crate::identity::{PrivateKey, PublicKey, Signature};

const TOKEN_VERSION: u8 = 1;
const WIRE_LEN: usize = 1 + 32 + 32 + 8 + 64;

const DOMAIN_PREFIX: &[u8] = b"GATEHOUSE-AUTH-REQUEST-v1:";

/// A self-signed enrollment request published by a worker.
#[derive(Clone)]
pub struct AuthRequestToken {
    version: u8,
    public_key: [u8; 32],
    nonce: [u8; 32],
    created_at: i64,
    signature: Signature,
}

impl AuthRequestToken {
    /// Build a request token for the given worker key.
    #[must_use]
    pub fn generate(worker_key: &PrivateKey) -> Self {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);

        let public_key = worker_key.public_key().to_bytes();
        let created_at = crate::unix_now();
        let message = signing_message(TOKEN_VERSION, &public_key, &nonce, created_at);
        let signature = worker_key.sign(&message);

        Self {
            version: TOKEN_VERSION,
            public_key,
            nonce,
            created_at,
            signature,
        }
    }

    /// Check the self-signature and return the embedded public key.
    ///
    /// # Errors
    ///
    /// `Malformed` for an unsupported version or an invalid curve point,
    /// `BadSignature` when proof of possession fails.
    pub fn verify(&self) -> Result<PublicKey, TokenError> {
        if self.version != TOKEN_VERSION {
            return Err(TokenError::Malformed);
        }
        let key = PublicKey::from_bytes(&self.public_key).map_err(|_| TokenError::Malformed)?;
        let message = signing_message(self.version, &self.public_key, &self.nonce, self.created_at);
        if !key.verify(&message, &self.signature) {
            return Err(TokenError::BadSignature);
        }
        Ok(key)
    }

    /// Hash used by controllers to track operator approvals.
    ///
    /// Covers the key and the nonce, so a restarted worker (fresh nonce)
    /// always publishes a distinct hash.
    #[must_use]
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.public_key);
        hasher.update(self.nonce);
        hasher.finalize().into()
    }

    /// Creation timestamp (Unix seconds).
    #[must_use]
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Encode for transport and for the published token file.
    #[must_use]
    pub fn to_base64(&self) -> String {
        let mut bytes = Vec::with_capacity(WIRE_LEN);
        bytes.push(self.version);
        bytes.extend_from_slice(&self.public_key);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.created_at.to_be_bytes());
        bytes.extend_from_slice(&self.signature.to_bytes());
        BASE64_STANDARD.encode(&bytes)
    }

    /// Decode from transport form (plain or dash-chunked).
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Malformed` for any decoding problem.
    pub fn from_base64(encoded: &str) -> Result<Self, TokenError> {
        let clean: String = encoded.chars().filter(|c| *c != '-').collect();
        let bytes = BASE64_STANDARD
            .decode(clean.trim())
            .map_err(|_| TokenError::Malformed)?;
        if bytes.len() != WIRE_LEN || bytes[0] != TOKEN_VERSION {
            return Err(TokenError::Malformed);
        }
        let public_key: [u8; 32] = bytes[1..33].try_into().map_err(|_| TokenError::Malformed)?;
        let nonce: [u8; 32] = bytes[33..65].try_into().map_err(|_| TokenError::Malformed)?;
        let created_at = i64::from_be_bytes(
            bytes[65..73].try_into().map_err(|_| TokenError::Malformed)?,
        );
        let signature =
            Signature::from_bytes(&bytes[73..WIRE_LEN]).map_err(|_| TokenError::Malformed)?;
        Ok(Self {
            version: bytes[0],
            public_key,
            nonce,
            created_at,
            signature,
        })
    }
}

impl std::fmt::Display for AuthRequestToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b64 = self.to_base64();
        let chunks: Vec<&str> = b64
            .as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).unwrap_or("????"))
            .collect();
        write!(f, "{}", chunks.join("-"))
    }
}

fn signing_message(
    version: u8,
    public_key: &[u8; 32],
    nonce: &[u8; 32],
    created_at: i64,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(DOMAIN_PREFIX.len() + 1 + 32 + 32 + 8);
    message.extend_from_slice(DOMAIN_PREFIX);
    message.push(version);
    message.extend_from_slice(public_key);
    message.extend_from_slice(nonce);
    message.extend_from_slice(&created_at.to_be_bytes());
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_verify_roundtrip() {
        let key = PrivateKey::generate();
        let token = AuthRequestToken::generate(&key);

        let verified = token.verify().unwrap();
        assert_eq!(verified.to_bytes(), key.public_key().to_bytes());

        let decoded = AuthRequestToken::from_base64(&token.to_base64()).unwrap();
        assert_eq!(decoded.hash(), token.hash());
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn display_form_decodes() {
        let token = AuthRequestToken::generate(&PrivateKey::generate());
        let decoded = AuthRequestToken::from_base64(&format!("{}", token)).unwrap();
        assert_eq!(decoded.hash(), token.hash());
    }

    #[test]
    fn fresh_nonce_changes_hash() {
        let key = PrivateKey::generate();
        let a = AuthRequestToken::generate(&key);
        let b = AuthRequestToken::generate(&key);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn tampered_key_fails_possession_proof() {
        let token = AuthRequestToken::generate(&PrivateKey::generate());
        let mut raw = BASE64_STANDARD.decode(token.to_base64()).unwrap();
        // Swap in a different (valid) public key without re-signing.
        let other = PrivateKey::generate().public_key().to_bytes();
        raw[1..33].copy_from_slice(&other);
        let forged = AuthRequestToken::from_base64(&BASE64_STANDARD.encode(&raw)).unwrap();
        assert!(forged.verify().is_err());
    }

    #[test]
    fn malformed_rejected() {
        assert!(AuthRequestToken::from_base64("???").is_err());
        assert!(AuthRequestToken::from_base64("YWJjZA==").is_err());
    }
}
