//! On-disk credential storage for a worker.
//!
//! Layout under `auth_storage_path`:
//! - `credentials`: the serialized [`CredentialBundle`], optionally sealed
//!   under the `worker-auth-storage` wrapper, owner-only permissions
//! - `auth_request_token`: present only while awaiting an operator
//!
//! Credential writes are write-then-rename so a crash mid-write never
//! corrupts an existing bundle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use gatehouse_auth::{AuthRequestToken, CredentialBundle};
use gatehouse_core::kms::Wrapper;

const CREDENTIALS_FILE: &str = "credentials";
const CREDENTIALS_TMP_FILE: &str = ".credentials.tmp";
const REQUEST_TOKEN_FILE: &str = "auth_request_token";

const STORAGE_AAD: &[u8] = b"gatehouse-worker-credentials-v1";

pub struct CredentialStorage {
    dir: PathBuf,
    wrapper: Option<Arc<dyn Wrapper>>,
}

impl CredentialStorage {
    /// Open (creating if needed) the storage directory.
    ///
    /// # Errors
    ///
    /// Directory creation failures.
    pub fn open(dir: impl Into<PathBuf>, wrapper: Option<Arc<dyn Wrapper>>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("error creating auth storage at {}", dir.display()))?;
        restrict_permissions(&dir, 0o700)?;
        Ok(Self { dir, wrapper })
    }

    #[must_use]
    pub fn credentials_path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    #[must_use]
    pub fn request_token_path(&self) -> PathBuf {
        self.dir.join(REQUEST_TOKEN_FILE)
    }

    /// Read the persisted bundle, if any.
    ///
    /// A bundle that cannot be opened or parsed is treated as absent (with a
    /// warning) so the worker re-enrolls instead of refusing to start.
    ///
    /// # Errors
    ///
    /// IO failures other than the file being absent.
    pub fn load(&self) -> anyhow::Result<Option<CredentialBundle>> {
        let path = self.credentials_path();
        let blob = match std::fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("error reading {}", path.display()))
            }
        };

        let plaintext = match &self.wrapper {
            Some(wrapper) => match wrapper.decrypt(&blob, STORAGE_AAD) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "stored credentials could not be unsealed, re-enrolling"
                    );
                    return Ok(None);
                }
            },
            None => blob,
        };

        match serde_json::from_slice(&plaintext) {
            Ok(bundle) => Ok(Some(bundle)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "stored credentials are malformed, re-enrolling"
                );
                Ok(None)
            }
        }
    }

    /// Persist a bundle atomically.
    ///
    /// # Errors
    ///
    /// Serialization, sealing, and IO failures.
    pub fn store(&self, bundle: &CredentialBundle) -> anyhow::Result<()> {
        let plaintext = serde_json::to_vec(bundle).context("error serializing credentials")?;
        let blob = match &self.wrapper {
            Some(wrapper) => wrapper
                .encrypt(&plaintext, STORAGE_AAD)
                .context("error sealing credentials")?,
            None => plaintext,
        };

        let tmp = self.dir.join(CREDENTIALS_TMP_FILE);
        std::fs::write(&tmp, &blob)
            .with_context(|| format!("error writing {}", tmp.display()))?;
        restrict_permissions(&tmp, 0o600)?;
        std::fs::rename(&tmp, self.credentials_path())
            .context("error committing credentials")?;
        Ok(())
    }

    /// Publish the auth request token, replacing any previous one.
    ///
    /// # Errors
    ///
    /// IO failures.
    pub fn write_request_token(&self, token: &AuthRequestToken) -> anyhow::Result<()> {
        let path = self.request_token_path();
        std::fs::write(&path, format!("{token}\n"))
            .with_context(|| format!("error writing {}", path.display()))?;
        restrict_permissions(&path, 0o600)?;
        Ok(())
    }

    /// Remove the published request token once it is no longer needed.
    pub fn remove_request_token(&self) {
        let path = self.request_token_path();
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "could not remove request token");
            }
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("error restricting permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> anyhow::Result<()> {
    Ok(())
}
