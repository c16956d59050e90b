//! `env://`, `file://`, and `enc://` value indirection.
//!
//! Configuration values that carry secrets are normalized at load time so
//! that consumers only ever see literal payloads:
//! - `env://NAME` reads the named environment variable
//! - `file://PATH` reads the file, trimming a trailing newline
//! - `enc://BASE64` decrypts the blob through the `config`-purpose wrapper

use base64::prelude::*;

use crate::kms::{KmsError, Wrapper};

/// Errors from resolving an indirected value.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IndirectionError {
    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("could not read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("value is encrypted but no config kms block was found")]
    NoConfigWrapper,

    #[error("encrypted value is not valid base64")]
    BadCiphertext,

    #[error("encrypted value is not valid UTF-8")]
    BadPlaintext,

    #[error(transparent)]
    Kms(#[from] KmsError),
}

/// Additional authenticated data bound to `enc://` config values.
pub const CONFIG_AAD: &[u8] = b"gatehouse-config-v1";

/// Resolve a possibly-indirected value into its literal payload.
///
/// Values without a recognized scheme pass through unchanged.
///
/// # Errors
///
/// See [`IndirectionError`] for the per-scheme failure modes.
pub fn resolve(value: &str, config_wrapper: Option<&dyn Wrapper>) -> Result<String, IndirectionError> {
    if let Some(name) = value.strip_prefix("env://") {
        return std::env::var(name).map_err(|_| IndirectionError::MissingEnv(name.to_string()));
    }
    if let Some(path) = value.strip_prefix("file://") {
        let contents = std::fs::read_to_string(path).map_err(|source| IndirectionError::File {
            path: path.to_string(),
            source,
        })?;
        return Ok(contents.trim_end_matches(['\r', '\n']).to_string());
    }
    if let Some(encoded) = value.strip_prefix("enc://") {
        let wrapper = config_wrapper.ok_or(IndirectionError::NoConfigWrapper)?;
        let blob = BASE64_STANDARD
            .decode(encoded)
            .map_err(|_| IndirectionError::BadCiphertext)?;
        let plaintext = wrapper.decrypt(&blob, CONFIG_AAD)?;
        return String::from_utf8(plaintext).map_err(|_| IndirectionError::BadPlaintext);
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::aead::AeadWrapper;
    use std::io::Write;

    #[test]
    fn literal_passes_through() {
        assert_eq!(resolve("plain", None).unwrap(), "plain");
    }

    #[test]
    fn env_resolution() {
        std::env::set_var("GATEHOUSE_TEST_INDIRECTION", "from-env");
        assert_eq!(
            resolve("env://GATEHOUSE_TEST_INDIRECTION", None).unwrap(),
            "from-env"
        );
        assert!(matches!(
            resolve("env://GATEHOUSE_TEST_INDIRECTION_MISSING", None),
            Err(IndirectionError::MissingEnv(_))
        ));
    }

    #[test]
    fn file_resolution_trims_trailing_newline() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "from-file").unwrap();
        let value = format!("file://{}", f.path().display());
        assert_eq!(resolve(&value, None).unwrap(), "from-file");
    }

    #[test]
    fn enc_requires_wrapper() {
        assert!(matches!(
            resolve("enc://AAAA", None),
            Err(IndirectionError::NoConfigWrapper)
        ));
    }

    #[test]
    fn enc_roundtrip() {
        let key = BASE64_STANDARD.encode([7u8; 32]);
        let wrapper = AeadWrapper::new(&key).unwrap();
        let blob = wrapper.encrypt(b"postgres://secret", CONFIG_AAD).unwrap();
        let value = format!("enc://{}", BASE64_STANDARD.encode(blob));
        assert_eq!(
            resolve(&value, Some(&wrapper)).unwrap(),
            "postgres://secret"
        );
    }
}
