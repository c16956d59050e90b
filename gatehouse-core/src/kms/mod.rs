//! Key-management wrappers resolved by purpose.
//!
//! A configuration declares zero or more `[[kms]]` blocks, each tagged with a
//! purpose from a closed set. The registry constructs one wrapper per block,
//! indexes it by purpose, and owns the wrappers until supervisor shutdown
//! finalizes them.

pub mod aead;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::KmsBlock;
use crate::indirection;

/// The closed set of wrapper purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KmsPurpose {
    /// Controller root-of-trust; wraps keys persisted in the database.
    Root,
    /// Worker authorization flows; required by both roles.
    WorkerAuth,
    /// Encryption of worker credentials at rest.
    WorkerAuthStorage,
    /// Recovery operations.
    Recovery,
    /// Decryption of `enc://` values in the configuration file itself.
    Config,
}

impl KmsPurpose {
    /// Every recognized purpose, in documentation order.
    pub const ALL: [KmsPurpose; 5] = [
        KmsPurpose::Root,
        KmsPurpose::WorkerAuth,
        KmsPurpose::WorkerAuthStorage,
        KmsPurpose::Recovery,
        KmsPurpose::Config,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            KmsPurpose::Root => "root",
            KmsPurpose::WorkerAuth => "worker-auth",
            KmsPurpose::WorkerAuthStorage => "worker-auth-storage",
            KmsPurpose::Recovery => "recovery",
            KmsPurpose::Config => "config",
        }
    }
}

impl fmt::Display for KmsPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KmsPurpose {
    type Err = KmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KmsPurpose::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| KmsError::UnknownPurpose(s.to_string()))
    }
}

/// Errors from wrapper construction and use.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KmsError {
    #[error("could not read kms configuration {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing kms configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown kms purpose {0:?}")]
    UnknownPurpose(String),

    #[error("unknown kms type {0:?}")]
    UnknownType(String),

    #[error("kms block for purpose {0} declared more than once")]
    DuplicatePurpose(KmsPurpose),

    #[error("invalid kms key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("wrapper finalize failed: {0}")]
    Finalize(String),
}

/// An opaque cryptographic handle keyed by purpose.
///
/// Implementations must be cheap to share; the registry hands out `Arc`s and
/// callers hold them across the whole process lifetime.
pub trait Wrapper: Send + Sync {
    /// Seal `plaintext`, binding `aad` into the authentication tag.
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Open a blob produced by [`Wrapper::encrypt`] with matching `aad`.
    fn decrypt(&self, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Release any held resources. Called once at supervisor shutdown.
    fn finalize(&self) -> Result<(), KmsError> {
        Ok(())
    }
}

/// Construct the wrapper described by a single block.
///
/// # Errors
///
/// `UnknownType` for an unrecognized `type`, `InvalidKey` when the key
/// material (after indirection) is unusable.
pub fn build_wrapper(block: &KmsBlock) -> Result<Arc<dyn Wrapper>, KmsError> {
    match block.kind.as_str() {
        "aead" => {
            let key = block
                .key
                .as_deref()
                .ok_or_else(|| KmsError::InvalidKey("aead block requires a key".to_string()))?;
            let key = indirection::resolve(key, None)
                .map_err(|e| KmsError::InvalidKey(e.to_string()))?;
            Ok(Arc::new(aead::AeadWrapper::new(&key)?))
        }
        other => Err(KmsError::UnknownType(other.to_string())),
    }
}

/// Construct the `config`-purpose wrapper declared in a file, if any.
///
/// Used before the main configuration is loaded: the wrapper may live in a
/// sibling file passed via `--config-kms`, or in the main file itself. Only
/// the `[[kms]]` blocks are read; everything else in the file is ignored at
/// this stage.
///
/// # Errors
///
/// IO and parse failures, plus wrapper-construction failures for a present
/// `config` block.
pub fn config_wrapper_from_path(
    path: impl AsRef<std::path::Path>,
) -> Result<Option<Arc<dyn Wrapper>>, KmsError> {
    #[derive(serde::Deserialize)]
    struct KmsOnly {
        #[serde(default, rename = "kms")]
        kms: Vec<KmsBlock>,
    }

    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| KmsError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let parsed: KmsOnly = toml::from_str(&raw)?;
    match parsed
        .kms
        .iter()
        .find(|b| b.purpose == KmsPurpose::Config.as_str())
    {
        Some(block) => Ok(Some(build_wrapper(block)?)),
        None => Ok(None),
    }
}

/// Purpose-indexed collection of constructed wrappers.
pub struct KmsRegistry {
    wrappers: HashMap<KmsPurpose, Arc<dyn Wrapper>>,
}

impl std::fmt::Debug for KmsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsRegistry")
            .field("purposes", &self.wrappers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl KmsRegistry {
    /// Build every declared wrapper and index it by purpose.
    ///
    /// # Errors
    ///
    /// Unknown purposes, unknown types, duplicate purposes, and bad key
    /// material are all fatal here; wrappers are initialized before any
    /// subsystem that needs them.
    pub fn from_blocks(blocks: &[KmsBlock]) -> Result<Self, KmsError> {
        let mut wrappers: HashMap<KmsPurpose, Arc<dyn Wrapper>> = HashMap::new();
        for block in blocks {
            let purpose: KmsPurpose = block.purpose.parse()?;
            if wrappers.contains_key(&purpose) {
                return Err(KmsError::DuplicatePurpose(purpose));
            }
            wrappers.insert(purpose, build_wrapper(block)?);
        }
        Ok(Self { wrappers })
    }

    /// Look up the wrapper for a purpose.
    #[must_use]
    pub fn resolve(&self, purpose: KmsPurpose) -> Option<Arc<dyn Wrapper>> {
        self.wrappers.get(&purpose).cloned()
    }

    /// Finalize every wrapper, collecting failures instead of aborting.
    ///
    /// Runs during shutdown, after all subsystems have stopped; errors are
    /// reported to the caller for logging and are never fatal.
    pub fn finalize_all(&self) -> Vec<(KmsPurpose, KmsError)> {
        let mut failures = Vec::new();
        for (purpose, wrapper) in &self.wrappers {
            if let Err(e) = wrapper.finalize() {
                failures.push((*purpose, e));
            }
        }
        failures
    }
}
