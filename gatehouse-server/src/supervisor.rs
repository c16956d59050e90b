//! Top-level process supervisor.
//!
//! Composition order is load-bearing: config load happens before any KMS
//! init, KMS init before database connect, database verify before controller
//! start, controller start before worker start. Shutdown reverses it:
//! worker drain, controller teardown, registered hooks in LIFO order (KMS
//! registry finalize registered first so it runs last), config wrapper
//! finalize, PID file removal at the very end.
//!
//! Hangup and stack-dump signals arrive over injected channels so the
//! dispatch loop is drivable from tests; production wires the OS signals
//! into those channels.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use gatehouse_core::config::validation::{validate_topology, ListenerPurpose, Topology};
use gatehouse_core::config::{self, Config};
use gatehouse_core::kms::{self, KmsPurpose, KmsRegistry, Wrapper};

use crate::controller::store::{ControlStore, PgControlStore};
use crate::controller::{ControlPlane, Controller};
use crate::listener::{Listeners, ReloadRegistry, LISTENER_RELOAD_PREFIX};
use crate::logging::{self, LogFormat, LogHandle};
use crate::process::{self, RuntimeParams};
use crate::schema::{PgSchemaStore, SchemaGuard, SchemaStore};
use crate::worker::Worker;

/// Options collected from the `server` command line.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub config_path: PathBuf,
    pub config_kms_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    /// Install OS signal handlers. Tests drive the dispatch loop through
    /// [`SupervisorHandles`] instead and leave this off.
    pub handle_signals: bool,
}

impl ServerOptions {
    #[must_use]
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            config_kms_path: None,
            log_level: None,
            log_format: None,
            handle_signals: true,
        }
    }
}

/// Externally drivable control surface of a running supervisor.
pub struct SupervisorHandles {
    /// Cancelling this triggers graceful shutdown, exactly like SIGTERM.
    pub root: CancellationToken,
    /// Equivalent of SIGHUP.
    pub sighup: mpsc::Sender<()>,
    /// Equivalent of SIGUSR2.
    pub sigusr2: mpsc::Sender<()>,
    /// Fires after each completed reload, so tests never guess sleep times.
    pub reloaded: broadcast::Receiver<()>,
}

type ShutdownHook = (
    &'static str,
    Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>,
);

/// The composed process: one controller and/or one worker plus the shared
/// substrate.
pub struct Supervisor {
    options: ServerOptions,
    config: Config,
    topology: Topology,
    config_wrapper: Option<Arc<dyn Wrapper>>,
    root: CancellationToken,
    sighup_tx: mpsc::Sender<()>,
    sighup_rx: mpsc::Receiver<()>,
    sigusr2_tx: mpsc::Sender<()>,
    sigusr2_rx: mpsc::Receiver<()>,
    reloaded_tx: broadcast::Sender<()>,
    fatal: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("options", &self.options)
            .field("config", &self.config)
            .field("topology", &self.topology)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Parse flags and configuration; construct the config-purpose wrapper.
    ///
    /// # Errors
    ///
    /// Config wrapper construction, config load, and topology validation,
    /// all fatal before anything has started.
    pub fn new(options: ServerOptions) -> anyhow::Result<Self> {
        let wrapper_path = options
            .config_kms_path
            .as_deref()
            .unwrap_or(&options.config_path);
        let config_wrapper = kms::config_wrapper_from_path(wrapper_path)
            .context("error constructing config kms wrapper")?;

        let config = config::load_file(&options.config_path, config_wrapper.as_deref())
            .context("error parsing config")?;
        let topology = validate_topology(&config)?;

        let (sighup_tx, sighup_rx) = mpsc::channel(4);
        let (sigusr2_tx, sigusr2_rx) = mpsc::channel(4);
        let (reloaded_tx, _) = broadcast::channel(4);

        Ok(Self {
            options,
            config,
            topology,
            config_wrapper,
            root: CancellationToken::new(),
            sighup_tx,
            sighup_rx,
            sigusr2_tx,
            sigusr2_rx,
            reloaded_tx,
            fatal: Arc::new(Mutex::new(None)),
        })
    }

    /// The loaded configuration (read-only after load).
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Control surface for tests and embedders.
    #[must_use]
    pub fn handles(&self) -> SupervisorHandles {
        SupervisorHandles {
            root: self.root.clone(),
            sighup: self.sighup_tx.clone(),
            sigusr2: self.sigusr2_tx.clone(),
            reloaded: self.reloaded_tx.subscribe(),
        }
    }

    /// Run the whole lifecycle: wire, start, dispatch signals, tear down.
    ///
    /// # Errors
    ///
    /// Startup failures and fatal runtime conditions (schema liveness loss,
    /// terminal enrollment failure); all map to a nonzero process exit.
    pub async fn run(self) -> anyhow::Result<()> {
        let Supervisor {
            options,
            config,
            topology,
            config_wrapper,
            root,
            sighup_tx,
            mut sighup_rx,
            sigusr2_tx,
            mut sigusr2_rx,
            reloaded_tx,
            fatal,
        } = self;

        let finalize_config_wrapper = |wrapper: &Option<Arc<dyn Wrapper>>| {
            if let Some(wrapper) = wrapper {
                if let Err(e) = wrapper.finalize() {
                    tracing::warn!(error = %e, "error finalizing config kms");
                }
            }
        };

        // Logging: flag (which folds in the environment variable) beats
        // config beats the default.
        let level = match logging::resolve_level(
            options.log_level.as_deref(),
            config.log_level.as_deref(),
        ) {
            Ok(level) => level,
            Err(e) => {
                finalize_config_wrapper(&config_wrapper);
                return Err(e);
            }
        };
        let format = match options
            .log_format
            .as_deref()
            .or(config.log_format.as_deref())
        {
            None => LogFormat::Standard,
            Some(s) => match LogFormat::parse(s) {
                Some(format) => format,
                None => {
                    finalize_config_wrapper(&config_wrapper);
                    anyhow::bail!("unknown log format {s:?}");
                }
            },
        };
        let log_handle = logging::init(level, format);

        if options.handle_signals {
            spawn_signal_listeners(root.clone(), sighup_tx.clone(), sigusr2_tx.clone());
        }

        let result = serve(
            &options,
            &config,
            &topology,
            config_wrapper.clone(),
            root.clone(),
            &mut sighup_rx,
            &mut sigusr2_rx,
            &reloaded_tx,
            fatal.clone(),
            log_handle,
        )
        .await;

        // Whatever path got us here, nothing may keep running: a failed
        // startup must not leave background tasks behind.
        root.cancel();

        // The config wrapper outlives every subsystem and hook; the PID file
        // goes last of all.
        finalize_config_wrapper(&config_wrapper);
        if let Some(pid) = &config.pid_file {
            process::remove_pid_file(Path::new(pid));
        }

        if let Some(reason) = fatal.lock().expect("fatal flag lock poisoned").take() {
            anyhow::bail!(reason);
        }
        result
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    options: &ServerOptions,
    config: &Config,
    topology: &Topology,
    config_wrapper: Option<Arc<dyn Wrapper>>,
    root: CancellationToken,
    sighup_rx: &mut mpsc::Receiver<()>,
    sigusr2_rx: &mut mpsc::Receiver<()>,
    reloaded_tx: &broadcast::Sender<()>,
    fatal: Arc<Mutex<Option<String>>>,
    log_handle: LogHandle,
) -> anyhow::Result<()> {
    let started = Instant::now();

    process::lock_memory(config.disable_mlock);
    process::start_telemetry(config.telemetry.as_ref());

    let registry =
        Arc::new(KmsRegistry::from_blocks(&config.kms).context("error setting up kms blocks")?);
    let root_wrapper = if config.controller.is_some() {
        Some(
            registry
                .resolve(KmsPurpose::Root)
                .context("root KMS not found after parsing kms blocks")?,
        )
    } else {
        None
    };
    registry
        .resolve(KmsPurpose::WorkerAuth)
        .context("worker-auth KMS not found after parsing kms blocks")?;

    let params = Arc::new(RuntimeParams::from_config(config));

    let mut shutdown_hooks: Vec<ShutdownHook> = Vec::new();
    // Registered first, runs last: wrappers must outlive every subsystem.
    {
        let registry = registry.clone();
        shutdown_hooks.push((
            "kms finalize",
            Box::pin(async move {
                for (purpose, e) in registry.finalize_all() {
                    tracing::warn!(purpose = %purpose, error = %e, "error finalizing kms wrapper");
                }
                Ok(())
            }),
        ));
    }

    let reloads = Arc::new(ReloadRegistry::new());
    let mut controller: Option<Controller> = None;
    let mut worker: Option<Worker> = None;
    let mut liveness_task = None;

    // Everything from listener bind through worker start shares one error
    // path: registered hooks still run before the failure surfaces.
    let startup: anyhow::Result<()> = async {
        let specs = listener_specs(config, topology);
        let mut listeners = Listeners::bind(&specs, &reloads).await?;
        for (purpose, address) in listeners.summary() {
            tracing::info!(purpose = %purpose, address = %address, "listener bound");
        }

        // Controller substrate: database, schema guard, control store.
        if let Some(controller_config) = &config.controller {
            let pool = PgPoolOptions::new()
                .max_connections(
                    controller_config
                        .database
                        .max_open_connections
                        .unwrap_or(5),
                )
                .connect(&controller_config.database.url)
                .await
                .context("error connecting to database")?;

            let factory_pool = pool.clone();
            let guard = Arc::new(
                SchemaGuard::attach(Box::new(move || {
                    Arc::new(PgSchemaStore::new(factory_pool.clone())) as Arc<dyn SchemaStore>
                }))
                .await?,
            );
            {
                let guard = guard.clone();
                shutdown_hooks.push((
                    "schema manager detach",
                    Box::pin(async move { guard.detach().await.map_err(anyhow::Error::from) }),
                ));
            }
            liveness_task = Some(guard.clone().spawn_liveness(root.clone(), {
                let fatal = fatal.clone();
                let root = root.clone();
                Box::new(move || {
                    *fatal.lock().expect("fatal flag lock poisoned") = Some(
                        "the schema manager lost its connection with the database and cannot \
                         ensure its integrity"
                            .to_string(),
                    );
                    root.cancel();
                })
            }));

            let store: Arc<dyn ControlStore> = Arc::new(PgControlStore::new(pool.clone()));
            if !store
                .has_global_root_key()
                .await
                .context("error verifying kms setup")?
            {
                anyhow::bail!(
                    "can't find a global scope root key: the database is in a bad state, \
                     please revert it to the last known good state"
                );
            }

            let plane = ControlPlane::open(
                &controller_config.name,
                store,
                root_wrapper.expect("resolved above for controller configs"),
            )
            .await?;
            controller = Some(Controller::new(plane, params.clone()));
        }

        // PID file only once startup has gotten this far.
        if let Some(pid) = &config.pid_file {
            process::store_pid_file(Path::new(pid)).context("error storing PID")?;
        }

        // Start controller, then worker. A worker start failure rolls the
        // controller back before surfacing.
        if let Some(controller) = controller.as_mut() {
            let api = listeners
                .take(ListenerPurpose::Api)
                .context("api listener missing after validation")?;
            let cluster = listeners
                .take(ListenerPurpose::Cluster)
                .context("cluster listener missing after validation")?;
            if let Err(e) = controller.start(api, cluster).await {
                if let Err(shutdown_err) = controller.shutdown(false).await {
                    tracing::error!(error = %shutdown_err, "error shutting down controller");
                }
                return Err(e.context("error starting controller"));
            }
        }

        if let Some(worker_config) = &config.worker {
            let storage_wrapper = registry.resolve(KmsPurpose::WorkerAuthStorage);
            let on_fatal: Box<dyn FnOnce(String) + Send> = {
                let fatal = fatal.clone();
                let root = root.clone();
                Box::new(move |reason| {
                    *fatal.lock().expect("fatal flag lock poisoned") = Some(reason);
                    root.cancel();
                })
            };

            let start_result = async {
                let mut w = Worker::new(
                    worker_config,
                    topology.upstreams.clone(),
                    storage_wrapper,
                    &root,
                )?;
                let proxies = listeners.take_all(ListenerPurpose::Proxy);
                w.start(proxies, on_fatal).await?;
                Ok::<Worker, anyhow::Error>(w)
            }
            .await;

            match start_result {
                Ok(w) => worker = Some(w),
                Err(e) => {
                    if let Some(controller) = controller.as_mut() {
                        if let Err(shutdown_err) = controller.shutdown(false).await {
                            tracing::error!(error = %shutdown_err, "error shutting down controller");
                        }
                    }
                    return Err(e.context("error starting worker"));
                }
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = startup {
        run_shutdown_hooks(shutdown_hooks).await;
        return Err(e);
    }

    println!("==> gatehouse server started; log data will stream in below:");

    // Signal dispatch: one select over shutdown, reload, and stack dump.
    loop {
        tokio::select! {
            _ = root.cancelled() => {
                println!("==> gatehouse server shutdown triggered");
                if let Some(worker) = worker.as_mut() {
                    if let Err(e) = worker.shutdown(true).await {
                        tracing::error!(error = %e, "error shutting down worker");
                    }
                }
                if let Some(controller) = controller.as_mut() {
                    let wait_for_worker = config.worker.is_some();
                    if let Err(e) = controller.shutdown(wait_for_worker).await {
                        tracing::error!(error = %e, "error shutting down controller");
                    }
                }
                break;
            }

            Some(()) = sighup_rx.recv() => {
                println!("==> gatehouse server reload triggered");
                match config::load_file(&options.config_path, config_wrapper.as_deref()) {
                    Ok(new_config) => {
                        if let Some(level) = new_config.log_level.as_deref() {
                            match logging::parse_level(level) {
                                Some(level) => {
                                    if let Err(e) = log_handle.set_level(level) {
                                        tracing::error!(error = %e, "error applying log level");
                                    }
                                }
                                None => tracing::error!(
                                    level = %level,
                                    "unknown log level found on reload"
                                ),
                            }
                        }
                    }
                    Err(e) => tracing::error!(
                        path = %options.config_path.display(),
                        error = %e,
                        "could not reload config"
                    ),
                }
                for (key, e) in reloads.dispatch_prefix(LISTENER_RELOAD_PREFIX) {
                    tracing::error!(key = %key, error = %e, "error encountered reloading listener");
                }
                let _ = reloaded_tx.send(());
            }

            Some(()) = sigusr2_rx.recv() => {
                dump_status(started, config, worker.as_ref());
            }
        }
    }

    if let Some(task) = liveness_task {
        // The root token is cancelled by now, so the loop exits on its own.
        let _ = task.await;
    }
    run_shutdown_hooks(shutdown_hooks).await;
    Ok(())
}

/// Run registered hooks in LIFO order, logging failures.
async fn run_shutdown_hooks(mut hooks: Vec<ShutdownHook>) {
    while let Some((name, hook)) = hooks.pop() {
        if let Err(e) = hook.await {
            tracing::error!(hook = name, error = %e, "error running shutdown task");
        }
    }
}

/// Effective (purpose, bind address) pairs, with the cluster default applied.
fn listener_specs(config: &Config, topology: &Topology) -> Vec<(ListenerPurpose, String)> {
    config
        .listeners
        .iter()
        .map(|l| {
            let purpose = ListenerPurpose::parse(&l.purpose[0])
                .expect("listener purposes validated before binding");
            let address = match purpose {
                ListenerPurpose::Cluster => topology
                    .cluster_addr
                    .clone()
                    .unwrap_or_else(|| l.address.clone()),
                _ => l.address.clone(),
            };
            (purpose, address)
        })
        .collect()
}

/// Log a status snapshot and a captured stack. A full all-thread dump is not
/// portably available in-process; subsystem health plus the dispatcher's own
/// backtrace is what operators get.
fn dump_status(started: Instant, config: &Config, worker: Option<&Worker>) {
    tracing::info!(
        uptime_secs = started.elapsed().as_secs(),
        controller = config.controller.as_ref().map(|c| c.name.as_str()),
        worker = config.worker.as_ref().map(|w| w.name.as_str()),
        "status dump requested"
    );
    if let Some(worker) = worker {
        let status = worker.status();
        tracing::info!(
            enrollment = %status.enrollment,
            active_sessions = status.active_sessions,
            upstreams = ?status.upstreams,
            "worker status"
        );
    }
    let backtrace = std::backtrace::Backtrace::force_capture();
    tracing::info!(stack = %backtrace, "supervisor stack trace");
}

#[cfg(unix)]
fn spawn_signal_listeners(
    root: CancellationToken,
    sighup_tx: mpsc::Sender<()>,
    sigusr2_tx: mpsc::Sender<()>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "could not install SIGINT handler");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "could not install SIGTERM handler");
                return;
            }
        };
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "could not install SIGHUP handler");
                return;
            }
        };
        let mut user2 = match signal(SignalKind::user_defined2()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "could not install SIGUSR2 handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    tracing::info!("received SIGINT, initiating shutdown");
                    root.cancel();
                }
                _ = terminate.recv() => {
                    tracing::info!("received SIGTERM, initiating shutdown");
                    root.cancel();
                }
                _ = hangup.recv() => {
                    let _ = sighup_tx.send(()).await;
                }
                _ = user2.recv() => {
                    let _ = sigusr2_tx.send(()).await;
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_listeners(
    root: CancellationToken,
    _sighup_tx: mpsc::Sender<()>,
    _sigusr2_tx: mpsc::Sender<()>,
) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            root.cancel();
        }
    });
}
