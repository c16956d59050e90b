//! Static-key AEAD wrapper.
//!
//! The `aead` block type holds its key material directly in configuration
//! (usually behind `env://` or `file://` indirection). Blob layout is
//! `nonce (12 bytes) || ciphertext`, with the caller's AAD bound into the
//! authentication tag.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use base64::prelude::*;

use super::{KmsError, Wrapper};

const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 wrapper over a 32-byte static key.
pub struct AeadWrapper {
    cipher: ChaCha20Poly1305,
}

impl AeadWrapper {
    /// Build a wrapper from base64-encoded 32-byte key material.
    ///
    /// # Errors
    ///
    /// `KmsError::InvalidKey` when the encoding or length is wrong.
    pub fn new(key_base64: &str) -> Result<Self, KmsError> {
        let key = BASE64_STANDARD
            .decode(key_base64.trim())
            .map_err(|_| KmsError::InvalidKey("key is not valid base64".to_string()))?;
        if key.len() != 32 {
            return Err(KmsError::InvalidKey(format!(
                "key must be 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }
}

impl Wrapper for AeadWrapper {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KmsError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| KmsError::Encrypt(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt(&self, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>, KmsError> {
        if blob.len() < NONCE_LEN {
            return Err(KmsError::Decrypt("blob shorter than nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|e| KmsError::Decrypt(e.to_string()))
    }
}
