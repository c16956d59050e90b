//! Listener binding and the keyed reload registry.
//!
//! Every configured listener is bound up front (a bind failure is fatal at
//! startup) and handed to its owning subsystem by purpose. Each binding
//! registers a reload hook under `listener|<address>`; SIGHUP dispatches
//! every hook with that prefix and aggregates failures without terminating
//! the process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use anyhow::Context;
use tokio::net::TcpListener;

use gatehouse_core::config::validation::ListenerPurpose;

/// Key prefix for listener reload hooks.
pub const LISTENER_RELOAD_PREFIX: &str = "listener|";

/// A reload hook. Expected to be non-disruptive (certificate refresh and the
/// like); must never tear the listener down.
pub type ReloadFn = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Readers–writer-locked mapping from key to reload callbacks, dispatched by
/// prefix.
#[derive(Default)]
pub struct ReloadRegistry {
    funcs: RwLock<HashMap<String, Vec<ReloadFn>>>,
}

impl ReloadRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback under a key.
    pub fn register(&self, key: impl Into<String>, f: ReloadFn) {
        self.funcs
            .write()
            .expect("reload registry lock poisoned")
            .entry(key.into())
            .or_default()
            .push(f);
    }

    /// Invoke every callback whose key starts with `prefix`.
    ///
    /// Failures are collected, never propagated; a broken hook must not stop
    /// the others from running.
    pub fn dispatch_prefix(&self, prefix: &str) -> Vec<(String, anyhow::Error)> {
        let funcs = self.funcs.read().expect("reload registry lock poisoned");
        let mut failures = Vec::new();
        for (key, callbacks) in funcs.iter() {
            if !key.starts_with(prefix) {
                continue;
            }
            for callback in callbacks {
                if let Err(e) = callback() {
                    failures.push((key.clone(), e));
                }
            }
        }
        failures
    }
}

/// A bound network endpoint tagged with its purpose.
#[derive(Debug)]
pub struct BoundListener {
    pub purpose: ListenerPurpose,
    /// The address as configured (may be `host:0` in tests).
    pub configured_address: String,
    pub listener: TcpListener,
}

impl BoundListener {
    /// The address actually bound.
    ///
    /// # Errors
    ///
    /// Propagates the socket error, which practically cannot occur for a
    /// freshly bound listener.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// All bound listeners, waiting to be claimed by subsystems.
#[derive(Debug)]
pub struct Listeners {
    bound: Vec<BoundListener>,
}

impl Listeners {
    /// Bind every (purpose, address) pair and register its reload hook.
    ///
    /// # Errors
    ///
    /// Any bind failure, with the offending address in context.
    pub async fn bind(
        specs: &[(ListenerPurpose, String)],
        reloads: &ReloadRegistry,
    ) -> anyhow::Result<Self> {
        let mut bound = Vec::with_capacity(specs.len());
        for (purpose, address) in specs {
            let listener = TcpListener::bind(address.as_str())
                .await
                .with_context(|| format!("error binding {purpose} listener to {address}"))?;

            let key = format!("{LISTENER_RELOAD_PREFIX}{address}");
            let reload_address = address.clone();
            let reload_purpose = *purpose;
            reloads.register(
                key,
                Box::new(move || {
                    // TLS material re-read would happen here; plaintext
                    // listeners have nothing to refresh.
                    tracing::debug!(
                        address = %reload_address,
                        purpose = %reload_purpose,
                        "listener reloaded"
                    );
                    Ok(())
                }),
            );

            bound.push(BoundListener {
                purpose: *purpose,
                configured_address: address.clone(),
                listener,
            });
        }
        Ok(Self { bound })
    }

    /// Claim the first listener with the given purpose.
    pub fn take(&mut self, purpose: ListenerPurpose) -> Option<BoundListener> {
        let idx = self.bound.iter().position(|l| l.purpose == purpose)?;
        Some(self.bound.remove(idx))
    }

    /// Claim every listener with the given purpose.
    pub fn take_all(&mut self, purpose: ListenerPurpose) -> Vec<BoundListener> {
        let mut taken = Vec::new();
        let mut i = 0;
        while i < self.bound.len() {
            if self.bound[i].purpose == purpose {
                taken.push(self.bound.remove(i));
            } else {
                i += 1;
            }
        }
        taken
    }

    /// (purpose, bound address) pairs for startup info output.
    #[must_use]
    pub fn summary(&self) -> Vec<(ListenerPurpose, String)> {
        self.bound
            .iter()
            .map(|l| {
                let addr = l
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| l.configured_address.clone());
                (l.purpose, addr)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn specs(list: &[(ListenerPurpose, &str)]) -> Vec<(ListenerPurpose, String)> {
        list.iter().map(|(p, a)| (*p, a.to_string())).collect()
    }

    #[tokio::test]
    async fn bind_and_take_by_purpose() {
        let reloads = ReloadRegistry::new();
        let mut listeners = Listeners::bind(
            &specs(&[
                (ListenerPurpose::Api, "127.0.0.1:0"),
                (ListenerPurpose::Cluster, "127.0.0.1:0"),
                (ListenerPurpose::Proxy, "127.0.0.1:0"),
                (ListenerPurpose::Proxy, "127.0.0.1:0"),
            ]),
            &reloads,
        )
        .await
        .unwrap();

        assert!(listeners.take(ListenerPurpose::Api).is_some());
        assert!(listeners.take(ListenerPurpose::Api).is_none());
        assert_eq!(listeners.take_all(ListenerPurpose::Proxy).len(), 2);
        assert!(listeners.take(ListenerPurpose::Cluster).is_some());
    }

    #[tokio::test]
    async fn bind_failure_is_fatal_with_context() {
        let reloads = ReloadRegistry::new();
        // Port 1 on a non-loopback-privileged test run, or an outright bad
        // address; either way the bind must fail.
        let err = Listeners::bind(
            &specs(&[(ListenerPurpose::Api, "999.999.999.999:1")]),
            &reloads,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("error binding"));
    }

    #[tokio::test]
    async fn reload_hooks_registered_per_listener() {
        let reloads = ReloadRegistry::new();
        let _listeners = Listeners::bind(
            &specs(&[
                (ListenerPurpose::Api, "127.0.0.1:0"),
                (ListenerPurpose::Proxy, "127.0.0.1:0"),
            ]),
            &reloads,
        )
        .await
        .unwrap();

        let failures = reloads.dispatch_prefix(LISTENER_RELOAD_PREFIX);
        assert!(failures.is_empty());
    }

    #[test]
    fn dispatch_aggregates_failures_and_continues() {
        let registry = ReloadRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_ok = fired.clone();
        registry.register(
            "listener|a",
            Box::new(move || {
                fired_ok.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        registry.register(
            "listener|b",
            Box::new(|| Err(anyhow::anyhow!("certificate unreadable"))),
        );
        let fired_other = fired.clone();
        registry.register(
            "metrics|c",
            Box::new(move || {
                fired_other.fetch_add(100, Ordering::SeqCst);
                Ok(())
            }),
        );

        let failures = registry.dispatch_prefix("listener|");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "listener|b");
        // The prefix filter kept the metrics hook out.
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Dispatching twice fires the surviving hooks twice; nothing else
        // changes.
        let failures = registry.dispatch_prefix("listener|");
        assert_eq!(failures.len(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
