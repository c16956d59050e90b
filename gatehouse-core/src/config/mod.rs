//! The declarative configuration tree.
//!
//! One TOML file describes a node: which roles it runs (`[controller]`,
//! `[worker]`, or both), its `[[listener]]` endpoints tagged by purpose, its
//! `[[kms]]` blocks, and process-wide settings. The tree is immutable after
//! load; a SIGHUP reload produces a fresh instance rather than mutating the
//! one subsystems hold.

pub mod validation;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::indirection::{self, IndirectionError};
use crate::kms::Wrapper;

/// Errors surfaced while loading a configuration file.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("could not read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error(transparent)]
    Indirection(#[from] IndirectionError),
}

/// Which subsystems this node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ControllerOnly,
    WorkerOnly,
    Combined,
}

/// Root of the configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_format: Option<String>,

    #[serde(default)]
    pub disable_mlock: bool,

    pub pid_file: Option<String>,

    /// Process-wide ceiling applied to inbound request handling.
    pub default_max_request_duration_secs: Option<u64>,

    pub controller: Option<ControllerConfig>,
    pub worker: Option<WorkerConfig>,

    #[serde(default, rename = "listener")]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default, rename = "kms")]
    pub kms: Vec<KmsBlock>,

    pub telemetry: Option<TelemetryConfig>,
}

/// The `[controller]` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Unique name of this controller instance.
    pub name: String,
    pub database: DatabaseConfig,
    /// Address advertised to workers when the cluster listener binds an
    /// unspecified address.
    pub public_cluster_addr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL; may use `env://`, `file://`, or `enc://` indirection.
    pub url: String,
    pub max_open_connections: Option<u32>,
}

/// The `[worker]` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique name of this worker instance.
    pub name: String,
    /// Address advertised to controllers for proxied sessions.
    pub public_addr: Option<String>,

    /// Upstream controllers dialed in declaration order.
    #[serde(default)]
    pub initial_upstreams: Vec<String>,

    /// Directory holding persisted credentials and the published auth
    /// request token.
    pub auth_storage_path: Option<String>,

    /// One-time activation token for the controller-led flow; literal or
    /// `env://` / `file://` indirection.
    pub controller_generated_activation_token: Option<String>,

    #[serde(default)]
    pub tags: BTreeMap<String, Vec<String>>,

    /// What to do when an upstream permanently rejects the activation token.
    #[serde(default)]
    pub on_activation_rejected: RejectionPolicy,

    /// Grace window for draining proxied sessions at shutdown.
    pub drain_grace_secs: Option<u64>,
}

impl WorkerConfig {
    pub const DEFAULT_DRAIN_GRACE_SECS: u64 = 10;

    #[must_use]
    pub fn drain_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.drain_grace_secs
                .unwrap_or(Self::DEFAULT_DRAIN_GRACE_SECS),
        )
    }
}

/// Policy for a permanent activation-token rejection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectionPolicy {
    /// Fall through to the worker-led request-token flow.
    #[default]
    Fallback,
    /// Treat the rejection as fatal.
    Exit,
}

/// One `[[listener]]` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default)]
    pub address: String,

    /// Must contain exactly one purpose; validated by topology checks so the
    /// operator gets a directional message rather than a serde error.
    #[serde(default)]
    pub purpose: Vec<String>,

    #[serde(default)]
    pub tls_disable: bool,
}

/// One `[[kms]]` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KmsBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub purpose: String,
    /// Key material for static-key types; may use indirection.
    pub key: Option<String>,
    pub key_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub statsd_address: Option<String>,
    #[serde(default)]
    pub disable_hostname: bool,
}

impl Config {
    /// The role this configuration activates.
    ///
    /// # Panics
    ///
    /// Never panics for configs produced by [`load_file`], which rejects
    /// trees with neither block.
    #[must_use]
    pub fn role(&self) -> Role {
        match (&self.controller, &self.worker) {
            (Some(_), Some(_)) => Role::Combined,
            (Some(_), None) => Role::ControllerOnly,
            (None, Some(_)) => Role::WorkerOnly,
            (None, None) => unreachable!("validated at load: no role configured"),
        }
    }
}

/// Load, resolve, and validate a configuration file.
///
/// `config_wrapper` is the `config`-purpose KMS wrapper used to open
/// `enc://` values; it is constructed by the caller before this runs (from
/// the `--config-kms` sibling file or the main file itself).
///
/// # Errors
///
/// `ConfigError::Parse` for syntactic problems, `ConfigError::Validation`
/// for structural and topology violations, `ConfigError::Indirection` when a
/// referenced value cannot be resolved.
pub fn load_file(
    path: impl AsRef<Path>,
    config_wrapper: Option<&dyn Wrapper>,
) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut config: Config = toml::from_str(&raw)?;

    resolve_indirected_fields(&mut config, config_wrapper)?;
    validate_structure(&config)?;
    validation::validate_topology(&config)?;

    Ok(config)
}

/// Normalize every secret-bearing field to its literal payload.
fn resolve_indirected_fields(
    config: &mut Config,
    wrapper: Option<&dyn Wrapper>,
) -> Result<(), ConfigError> {
    if let Some(controller) = config.controller.as_mut() {
        controller.database.url = indirection::resolve(&controller.database.url, wrapper)?;
    }
    if let Some(worker) = config.worker.as_mut() {
        if let Some(token) = worker.controller_generated_activation_token.as_mut() {
            *token = indirection::resolve(token, wrapper)?;
        }
    }
    for block in config.kms.iter_mut() {
        if let Some(key) = block.key.as_mut() {
            *key = indirection::resolve(key, wrapper)?;
        }
    }
    Ok(())
}

/// Structural checks that do not depend on listener topology.
fn validate_structure(config: &Config) -> Result<(), ConfigError> {
    if config.controller.is_none() && config.worker.is_none() {
        return Err(ConfigError::Validation(
            "neither worker nor controller specified in configuration file".to_string(),
        ));
    }
    if let Some(controller) = &config.controller {
        if controller.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "controller has no name set; it must be the unique name of this instance"
                    .to_string(),
            ));
        }
        if controller.database.url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "\"url\" not specified in \"controller.database\" block".to_string(),
            ));
        }
        if !config.kms.iter().any(|b| b.purpose == "root") {
            return Err(ConfigError::Validation(
                "config activates controller but no kms block with \"root\" purpose found"
                    .to_string(),
            ));
        }
    }
    if let Some(worker) = &config.worker {
        if worker.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "worker has no name set; it must be the unique name of this instance".to_string(),
            ));
        }
    }
    if !config.kms.iter().any(|b| b.purpose == "worker-auth") {
        return Err(ConfigError::Validation(
            "no kms block with \"worker-auth\" purpose found".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    const COMBINED: &str = r#"
        log_level = "info"

        [controller]
        name = "c1"
        [controller.database]
        url = "postgres://localhost/gatehouse"

        [worker]
        name = "w1"
        initial_upstreams = ["127.0.0.1:9201"]
        [worker.tags]
        type = ["prod"]

        [[listener]]
        address = "127.0.0.1:9200"
        purpose = ["api"]

        [[listener]]
        address = "127.0.0.1:9201"
        purpose = ["cluster"]

        [[listener]]
        address = "127.0.0.1:9202"
        purpose = ["proxy"]

        [[kms]]
        type = "aead"
        purpose = "root"
        key = "uduP2BBHzFLHB1ZKh/mrLkf9BcHT8I/5f1x1uqhK/Kw="

        [[kms]]
        type = "aead"
        purpose = "worker-auth"
        key = "MfpOWfLGdQzOHXYRpAKZLRnOUfLGMpCjlqCZuJyfwcY="
    "#;

    #[test]
    fn combined_config_loads() {
        let f = write_config(COMBINED);
        let config = load_file(f.path(), None).unwrap();
        assert_eq!(config.role(), Role::Combined);
        assert_eq!(config.worker.as_ref().unwrap().tags["type"], vec!["prod"]);
        assert_eq!(
            config.worker.as_ref().unwrap().on_activation_rejected,
            RejectionPolicy::Fallback
        );
    }

    #[test]
    fn roundtrip_yields_equal_config() {
        let f = write_config(COMBINED);
        let config = load_file(f.path(), None).unwrap();

        let serialized = toml::to_string(&config).unwrap();
        let f2 = write_config(&serialized);
        let reloaded = load_file(f2.path(), None).unwrap();
        assert_eq!(config, reloaded);
    }

    #[test]
    fn no_role_rejected() {
        let f = write_config(
            r#"
            [[kms]]
            type = "aead"
            purpose = "worker-auth"
            key = "MfpOWfLGdQzOHXYRpAKZLRnOUfLGMpCjlqCZuJyfwcY="
            "#,
        );
        let err = load_file(f.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)), "{err}");
    }

    #[test]
    fn controller_without_root_kms_rejected() {
        let body = COMBINED.replace("purpose = \"root\"", "purpose = \"recovery\"");
        let f = write_config(&body);
        let err = load_file(f.path(), None).unwrap_err();
        assert!(err.to_string().contains("root"), "{err}");
    }

    #[test]
    fn missing_worker_auth_kms_rejected() {
        let body = COMBINED.replace("purpose = \"worker-auth\"", "purpose = \"recovery\"");
        let f = write_config(&body);
        let err = load_file(f.path(), None).unwrap_err();
        assert!(err.to_string().contains("worker-auth"), "{err}");
    }

    #[test]
    fn empty_controller_name_rejected() {
        let body = COMBINED.replace("name = \"c1\"", "name = \"\"");
        let f = write_config(&body);
        assert!(load_file(f.path(), None).is_err());
    }

    #[test]
    fn syntax_error_is_parse_error() {
        let f = write_config("this is not = [ toml");
        let err = load_file(f.path(), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn database_url_env_indirection() {
        std::env::set_var("GATEHOUSE_TEST_DB_URL", "postgres://resolved/db");
        let body = COMBINED.replace(
            "url = \"postgres://localhost/gatehouse\"",
            "url = \"env://GATEHOUSE_TEST_DB_URL\"",
        );
        let f = write_config(&body);
        let config = load_file(f.path(), None).unwrap();
        assert_eq!(
            config.controller.unwrap().database.url,
            "postgres://resolved/db"
        );
    }

    #[test]
    fn activation_token_file_indirection() {
        let mut token_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(token_file, "tok-abc123").unwrap();
        let body = COMBINED.replace(
            "initial_upstreams = [\"127.0.0.1:9201\"]",
            &format!(
                "initial_upstreams = [\"127.0.0.1:9201\"]\n        controller_generated_activation_token = \"file://{}\"",
                token_file.path().display()
            ),
        );
        let f = write_config(&body);
        let config = load_file(f.path(), None).unwrap();
        assert_eq!(
            config
                .worker
                .unwrap()
                .controller_generated_activation_token
                .as_deref(),
            Some("tok-abc123")
        );
    }
}
