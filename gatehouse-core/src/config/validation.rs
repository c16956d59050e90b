//! Listener-purpose topology and upstream cross-validation.
//!
//! These checks run after structural validation, both at load time and again
//! by the supervisor before binding anything. They answer two questions: is
//! every listener tagged with exactly one recognized purpose, and, in
//! combined mode, can the worker's upstream list actually reach the local
//! controller.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use super::{Config, ConfigError};

/// Cluster address assumed when the cluster listener leaves `address` empty.
pub const DEFAULT_CLUSTER_ADDR: &str = "127.0.0.1:9201";

/// The role tag carried by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerPurpose {
    /// Public API plane.
    Api,
    /// Worker-facing cluster plane.
    Cluster,
    /// Session ingress on a worker.
    Proxy,
}

impl ListenerPurpose {
    /// Parse a purpose string from configuration.
    ///
    /// # Errors
    ///
    /// `ConfigError::Validation` for anything outside the closed set.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "api" => Ok(ListenerPurpose::Api),
            "cluster" => Ok(ListenerPurpose::Cluster),
            "proxy" => Ok(ListenerPurpose::Proxy),
            other => Err(ConfigError::Validation(format!(
                "unknown listener purpose {other:?}"
            ))),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerPurpose::Api => "api",
            ListenerPurpose::Cluster => "cluster",
            ListenerPurpose::Proxy => "proxy",
        }
    }
}

impl fmt::Display for ListenerPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The validated cross-listener facts the supervisor needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    /// Effective cluster listener address, when a controller is configured.
    pub cluster_addr: Option<String>,
    /// Effective upstream list for the worker, with the combined-mode
    /// default applied.
    pub upstreams: Vec<String>,
}

/// Validate listener purposes and upstream reachability; compute the
/// effective cluster address and upstream list.
///
/// # Errors
///
/// Every violation is a `ConfigError::Validation` carrying a directional
/// operator message.
pub fn validate_topology(config: &Config) -> Result<Topology, ConfigError> {
    let mut cluster_addr: Option<String> = None;
    let mut found_api = false;
    let mut found_proxy = false;

    for listener in &config.listeners {
        let purpose = match listener.purpose.len() {
            0 => {
                return Err(ConfigError::Validation(
                    "listener specified without a purpose".to_string(),
                ))
            }
            1 => ListenerPurpose::parse(&listener.purpose[0])?,
            _ => {
                return Err(ConfigError::Validation(
                    "specifying a listener with more than one purpose is not supported"
                        .to_string(),
                ))
            }
        };
        match purpose {
            ListenerPurpose::Api => found_api = true,
            ListenerPurpose::Proxy => found_proxy = true,
            ListenerPurpose::Cluster => {
                if cluster_addr.is_some() {
                    return Err(ConfigError::Validation(
                        "at most one listener may carry the \"cluster\" purpose".to_string(),
                    ));
                }
                cluster_addr = Some(if listener.address.is_empty() {
                    DEFAULT_CLUSTER_ADDR.to_string()
                } else {
                    listener.address.clone()
                });
            }
        }
    }

    if let Some(controller) = &config.controller {
        if !found_api {
            return Err(ConfigError::Validation(
                "config activates controller but no listener with \"api\" purpose found"
                    .to_string(),
            ));
        }
        let Some(cluster) = cluster_addr.as_deref() else {
            return Err(ConfigError::Validation(
                "config activates controller but no listener with \"cluster\" purpose found"
                    .to_string(),
            ));
        };
        if let Some(ip) = host_ip(cluster) {
            if ip.is_unspecified() && controller.public_cluster_addr.is_none() {
                return Err(ConfigError::Validation(
                    "when the \"cluster\" listener has an unspecified address, \
                     \"public_cluster_addr\" must be set"
                        .to_string(),
                ));
            }
        }
    }

    let mut upstreams = Vec::new();
    if let Some(worker) = &config.worker {
        if !found_proxy {
            return Err(ConfigError::Validation(
                "config activates worker but no listener with \"proxy\" purpose found".to_string(),
            ));
        }

        upstreams = worker.initial_upstreams.clone();
        if let Some(controller) = &config.controller {
            let public = controller.public_cluster_addr.as_deref();
            // Unwrap is fine: the controller checks above guarantee a cluster
            // address by this point.
            let cluster = cluster_addr.as_deref().expect("cluster addr computed");

            if upstreams.is_empty() {
                upstreams.push(public.unwrap_or(cluster).to_string());
            } else {
                for upstream in &upstreams {
                    let matches_local =
                        upstream.as_str() == cluster || public.is_some_and(|p| upstream == p);
                    if matches_local {
                        continue;
                    }
                    // A DNS name is taken at its word; an IP that is neither
                    // the cluster address nor the public address cannot reach
                    // the local controller.
                    if host_ip(upstream).is_some() {
                        return Err(ConfigError::Validation(format!(
                            "when running a combined controller and worker, upstream {upstream:?} \
                             must match the controller cluster address or \
                             \"public_cluster_addr\" when using IPs rather than DNS names"
                        )));
                    }
                }
            }
        } else if upstreams.is_empty() {
            return Err(ConfigError::Validation(
                "config activates worker but \"initial_upstreams\" is empty".to_string(),
            ));
        }

        for upstream in &upstreams {
            if let Some(ip) = host_ip(upstream) {
                let reason = if ip.is_unspecified() {
                    Some("an unspecified")
                } else if ip.is_multicast() {
                    Some("a multicast")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    return Err(ConfigError::Validation(format!(
                        "upstream address {upstream:?} is invalid: cannot be {reason} address"
                    )));
                }
            }
        }
    }

    Ok(Topology {
        cluster_addr,
        upstreams,
    })
}

/// Best-effort extraction of the IP part of `host[:port]`.
///
/// Returns `None` when the host does not parse as an IP, in which case it is
/// assumed to be a DNS name.
#[must_use]
pub fn host_ip(addr: &str) -> Option<IpAddr> {
    if let Ok(sockaddr) = addr.parse::<SocketAddr>() {
        return Some(sockaddr.ip());
    }
    addr.parse::<IpAddr>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, DatabaseConfig, ListenerConfig, WorkerConfig};

    fn listener(address: &str, purposes: &[&str]) -> ListenerConfig {
        ListenerConfig {
            address: address.to_string(),
            purpose: purposes.iter().map(|p| p.to_string()).collect(),
            tls_disable: false,
        }
    }

    fn controller(public_cluster_addr: Option<&str>) -> ControllerConfig {
        ControllerConfig {
            name: "c1".to_string(),
            database: DatabaseConfig {
                url: "postgres://localhost/gatehouse".to_string(),
                max_open_connections: None,
            },
            public_cluster_addr: public_cluster_addr.map(|s| s.to_string()),
        }
    }

    fn worker(upstreams: &[&str]) -> WorkerConfig {
        WorkerConfig {
            name: "w1".to_string(),
            public_addr: None,
            initial_upstreams: upstreams.iter().map(|s| s.to_string()).collect(),
            auth_storage_path: None,
            controller_generated_activation_token: None,
            tags: Default::default(),
            on_activation_rejected: Default::default(),
            drain_grace_secs: None,
        }
    }

    fn base_config() -> Config {
        Config {
            controller: None,
            worker: None,
            listeners: Vec::new(),
            kms: Vec::new(),
            telemetry: None,
            log_level: None,
            log_format: None,
            disable_mlock: false,
            pid_file: None,
            default_max_request_duration_secs: None,
        }
    }

    fn combined(
        cluster_listener: &str,
        public_cluster_addr: Option<&str>,
        upstreams: &[&str],
    ) -> Config {
        let mut config = base_config();
        config.controller = Some(controller(public_cluster_addr));
        config.worker = Some(worker(upstreams));
        config.listeners = vec![
            listener("127.0.0.1:9200", &["api"]),
            listener(cluster_listener, &["cluster"]),
            listener("127.0.0.1:9202", &["proxy"]),
        ];
        config
    }

    #[test]
    fn combined_happy_path() {
        let topo =
            validate_topology(&combined("127.0.0.1:9201", None, &["127.0.0.1:9201"])).unwrap();
        assert_eq!(topo.cluster_addr.as_deref(), Some("127.0.0.1:9201"));
        assert_eq!(topo.upstreams, vec!["127.0.0.1:9201"]);
    }

    #[test]
    fn listener_without_purpose_rejected() {
        let mut config = combined("127.0.0.1:9201", None, &[]);
        config.listeners.push(listener("127.0.0.1:9203", &[]));
        assert!(validate_topology(&config).is_err());
    }

    #[test]
    fn listener_with_two_purposes_rejected() {
        let mut config = combined("127.0.0.1:9201", None, &[]);
        config
            .listeners
            .push(listener("127.0.0.1:9203", &["api", "proxy"]));
        assert!(validate_topology(&config).is_err());
    }

    #[test]
    fn unknown_purpose_rejected() {
        let mut config = combined("127.0.0.1:9201", None, &[]);
        config
            .listeners
            .push(listener("127.0.0.1:9203", &["metrics"]));
        let err = validate_topology(&config).unwrap_err();
        assert!(err.to_string().contains("unknown listener purpose"));
    }

    #[test]
    fn controller_requires_api_listener() {
        let mut config = combined("127.0.0.1:9201", None, &[]);
        config.listeners.retain(|l| l.purpose != vec!["api"]);
        let err = validate_topology(&config).unwrap_err();
        assert!(err.to_string().contains("\"api\""));
    }

    #[test]
    fn controller_requires_cluster_listener() {
        let mut config = combined("127.0.0.1:9201", None, &[]);
        config.listeners.retain(|l| l.purpose != vec!["cluster"]);
        let err = validate_topology(&config).unwrap_err();
        assert!(err.to_string().contains("\"cluster\""));
    }

    #[test]
    fn worker_requires_proxy_listener() {
        let mut config = combined("127.0.0.1:9201", None, &[]);
        config.listeners.retain(|l| l.purpose != vec!["proxy"]);
        let err = validate_topology(&config).unwrap_err();
        assert!(err.to_string().contains("\"proxy\""));
    }

    #[test]
    fn duplicate_cluster_listener_rejected() {
        let mut config = combined("127.0.0.1:9201", None, &[]);
        config
            .listeners
            .push(listener("127.0.0.1:9301", &["cluster"]));
        assert!(validate_topology(&config).is_err());
    }

    #[test]
    fn empty_cluster_address_defaults() {
        let topo = validate_topology(&combined("", None, &[])).unwrap();
        assert_eq!(topo.cluster_addr.as_deref(), Some(DEFAULT_CLUSTER_ADDR));
        // Combined mode with no upstreams dials the local cluster address.
        assert_eq!(topo.upstreams, vec![DEFAULT_CLUSTER_ADDR]);
    }

    #[test]
    fn mismatched_upstream_ip_rejected() {
        // Cluster at 10.0.0.1, upstream names 10.0.0.2: both IPs, no match.
        let config = combined("10.0.0.1:9201", None, &["10.0.0.2:9201"]);
        let err = validate_topology(&config).unwrap_err();
        assert!(err.to_string().contains("combined"), "{err}");
    }

    #[test]
    fn upstream_matching_public_cluster_addr_accepted() {
        let config = combined("10.0.0.1:9201", Some("203.0.113.7:9201"), &["203.0.113.7:9201"]);
        validate_topology(&config).unwrap();
    }

    #[test]
    fn dns_upstream_accepted_in_combined_mode() {
        let config = combined("10.0.0.1:9201", None, &["controller.internal:9201"]);
        let topo = validate_topology(&config).unwrap();
        assert_eq!(topo.upstreams, vec!["controller.internal:9201"]);
    }

    #[test]
    fn unspecified_cluster_bind_requires_public_addr() {
        let config = combined("0.0.0.0:9201", None, &[]);
        let err = validate_topology(&config).unwrap_err();
        assert!(err.to_string().contains("public_cluster_addr"));

        let config = combined("0.0.0.0:9201", Some("203.0.113.7:9201"), &[]);
        validate_topology(&config).unwrap();
    }

    #[test]
    fn unspecified_and_multicast_upstreams_rejected() {
        let mut config = base_config();
        config.worker = Some(worker(&["0.0.0.0:9201"]));
        config.listeners = vec![listener("127.0.0.1:9202", &["proxy"])];
        assert!(validate_topology(&config).is_err());

        config.worker = Some(worker(&["224.0.0.1:9201"]));
        assert!(validate_topology(&config).is_err());
    }

    #[test]
    fn worker_only_requires_upstreams() {
        let mut config = base_config();
        config.worker = Some(worker(&[]));
        config.listeners = vec![listener("127.0.0.1:9202", &["proxy"])];
        let err = validate_topology(&config).unwrap_err();
        assert!(err.to_string().contains("initial_upstreams"));
    }

    #[test]
    fn host_ip_extraction() {
        assert!(host_ip("0.0.0.0:9201").unwrap().is_unspecified());
        assert!(host_ip("10.0.0.1").is_some());
        assert!(host_ip("[::1]:9201").is_some());
        assert!(host_ip("controller.internal:9201").is_none());
        assert!(host_ip("controller.internal").is_none());
    }
}
