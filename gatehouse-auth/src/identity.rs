//! Ed25519 identity primitives.
//!
//! Private keys are zeroized on drop (by `ed25519-dalek`) and carry no
//! `Debug`/`Display` implementation. Fingerprints are SSH-style
//! `SHA256:{url_safe_base64_no_padding}` strings and compare in constant
//! time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Errors that can occur during key operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The provided bytes have an invalid length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The provided bytes do not represent a valid key.
    #[error("invalid key format")]
    InvalidFormat,

    /// The fingerprint string has an invalid format.
    #[error("invalid fingerprint format")]
    InvalidFingerprint,
}

/// A private Ed25519 signing key.
///
/// No `Debug` implementation; the inner key zeroizes on drop.
pub struct PrivateKey(ed25519_dalek::SigningKey);

impl PrivateKey {
    /// Generate a new random private key from the OS entropy source.
    #[must_use]
    pub fn generate() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Load a private key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(ed25519_dalek::SigningKey::from_bytes(&bytes)))
    }

    /// Export the raw private key bytes. Handle with care.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Sign a message with this key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message))
    }

    /// Derive the public half.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }
}

/// A public Ed25519 verification key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    /// Load a public key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` for a wrong-sized slice and
    /// `KeyError::InvalidFormat` when the bytes are not a valid curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        let key =
            ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidFormat)?;
        Ok(Self(key))
    }

    /// Export the raw public key bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Verify a signature over a message.
    ///
    /// Uses `verify_strict` to reject weak and small-order keys.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify_strict(message, &signature.0).is_ok()
    }

    /// Fingerprint of this key.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_public_key(self)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

/// An Ed25519 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// Load a signature from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidLength` if the slice is not exactly 64 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: 64,
            actual: bytes.len(),
        })?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&bytes)))
    }

    /// Export the raw signature bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0.to_bytes();
        write!(f, "Signature({:02x}{:02x}{:02x}{:02x}...)", b[0], b[1], b[2], b[3])
    }
}

/// A SHA-256 fingerprint of a public key.
///
/// Format: `SHA256:{url_safe_base64_no_padding}`. Equality is constant-time;
/// the hash value itself is not secret, so the derived `Hash` is fine.
#[derive(Clone, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::derived_hash_with_manual_eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The prefix used for fingerprint strings.
    pub const PREFIX: &'static str = "SHA256:";

    /// Compute the fingerprint of a public key.
    #[must_use]
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let hash = Sha256::digest(public_key.to_bytes());
        Self(format!("{}{}", Self::PREFIX, URL_SAFE_NO_PAD.encode(hash)))
    }

    /// Parse a fingerprint from its string form.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidFingerprint` when the prefix, encoding, or
    /// decoded length is wrong.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let encoded = s
            .strip_prefix(Self::PREFIX)
            .ok_or(KeyError::InvalidFingerprint)?;
        let decoded = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| KeyError::InvalidFingerprint)?;
        if decoded.len() != 32 {
            return Err(KeyError::InvalidFingerprint);
        }
        Ok(Self(s.to_string()))
    }

    /// Reconstruct a fingerprint from raw hash bytes.
    #[must_use]
    pub fn from_hash_bytes(hash: [u8; 32]) -> Self {
        Self(format!("{}{}", Self::PREFIX, URL_SAFE_NO_PAD.encode(hash)))
    }

    /// The raw 32-byte hash, without the prefix.
    ///
    /// # Panics
    ///
    /// Cannot panic for values built through the constructors above; the
    /// internal format is validated on the way in.
    #[must_use]
    pub fn hash_bytes(&self) -> [u8; 32] {
        let encoded = self
            .0
            .strip_prefix(Self::PREFIX)
            .expect("fingerprint missing prefix");
        URL_SAFE_NO_PAD
            .decode(encoded)
            .expect("fingerprint invalid base64")
            .try_into()
            .expect("fingerprint wrong length")
    }

    /// The fingerprint as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let key = PrivateKey::generate();
        let sig = key.sign(b"attach request");
        assert!(key.public_key().verify(b"attach request", &sig));
        assert!(!key.public_key().verify(b"something else", &sig));
    }

    #[test]
    fn private_key_roundtrip() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(
            key.public_key().to_bytes(),
            restored.public_key().to_bytes()
        );
    }

    #[test]
    fn wrong_key_rejected() {
        let a = PrivateKey::generate();
        let b = PrivateKey::generate();
        let sig = a.sign(b"msg");
        assert!(!b.public_key().verify(b"msg", &sig));
    }

    #[test]
    fn fingerprint_format_and_parse() {
        let fp = PrivateKey::generate().public_key().fingerprint();
        assert!(fp.as_str().starts_with("SHA256:"));
        // 7 prefix chars + 43 chars of unpadded base64 for 32 bytes
        assert_eq!(fp.as_str().len(), 50);
        assert_eq!(Fingerprint::parse(fp.as_str()).unwrap(), fp);
    }

    #[test]
    fn fingerprint_parse_rejects_garbage() {
        assert!(Fingerprint::parse("abc").is_err());
        assert!(Fingerprint::parse("SHA256:!!!").is_err());
        assert!(Fingerprint::parse("SHA256:YWJj").is_err()); // 3 bytes, not 32
    }

    #[test]
    fn fingerprint_hash_bytes_roundtrip() {
        let fp = PrivateKey::generate().public_key().fingerprint();
        assert_eq!(Fingerprint::from_hash_bytes(fp.hash_bytes()), fp);
    }

    #[test]
    fn invalid_lengths() {
        assert!(PrivateKey::from_bytes(&[0u8; 16]).is_err());
        assert!(PublicKey::from_bytes(&[0u8; 31]).is_err());
        assert!(Signature::from_bytes(&[0u8; 32]).is_err());
    }
}
