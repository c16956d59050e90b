//! Schema manager guard.
//!
//! A controller holds a shared advisory lock on its database for its whole
//! lifetime. Several controllers may share one database (the lock is
//! shared, not exclusive) and its real job is liveness: if this process is
//! silently disconnected (stale pool, network partition), the guard notices
//! and tears the process down rather than letting it keep accepting traffic
//! it cannot persist.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Schema version compiled into this binary.
pub const BINARY_SCHEMA_VERSION: i64 = 7;

/// Base period of the liveness loop; each cycle is jittered ±50%.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(20);

/// Bound on lock release at shutdown. The root token is already cancelled by
/// then, and the lock dies with the database session anyway.
const DETACH_TIMEOUT: Duration = Duration::from_secs(1);

/// Point-in-time view of the database schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaState {
    pub initialization_started: bool,
    pub dirty: bool,
    pub binary_schema_version: i64,
    pub database_schema_version: i64,
}

/// Backend failure while talking to the schema store.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SchemaStoreError(pub String);

impl From<sqlx::Error> for SchemaStoreError {
    fn from(e: sqlx::Error) -> Self {
        Self(e.to_string())
    }
}

/// Schema verification and guard errors, each with a directional message.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SchemaError {
    #[error("the database has not been initialized: run \"gatehouse database init\"")]
    NotInitialized,

    #[error("database is in a bad state: revert the database to the last known good state")]
    Dirty,

    #[error(
        "database schema version {database} is older than this binary expects ({binary}): \
         run \"gatehouse database migrate\" to update the database"
    )]
    MustMigrate { binary: i64, database: i64 },

    #[error(
        "database schema version {database} is newer than this binary expects ({binary}): \
         use a newer gatehouse binary"
    )]
    BinaryTooOld { binary: i64, database: i64 },

    #[error("schema store error: {0}")]
    Store(#[from] SchemaStoreError),

    #[error("timed out releasing the shared schema lock")]
    DetachTimeout,
}

/// The persistence seam under the guard. Production is Postgres; tests use
/// in-memory fakes.
#[async_trait::async_trait]
pub trait SchemaStore: Send + Sync {
    async fn shared_lock(&self) -> Result<(), SchemaStoreError>;
    async fn shared_unlock(&self) -> Result<(), SchemaStoreError>;
    async fn current_state(&self) -> Result<SchemaState, SchemaStoreError>;
    async fn ping(&self) -> Result<(), SchemaStoreError>;
}

/// Produces a fresh store handle; invoked at attach and once more per
/// re-attach attempt.
pub type StoreFactory = Box<dyn Fn() -> Arc<dyn SchemaStore> + Send + Sync>;

/// Holds the shared advisory lock and runs the liveness loop.
pub struct SchemaGuard {
    store: Mutex<Arc<dyn SchemaStore>>,
    factory: StoreFactory,
    interval: Duration,
}

impl std::fmt::Debug for SchemaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaGuard")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl SchemaGuard {
    /// Open a store, take the shared lock, and verify the schema state.
    ///
    /// # Errors
    ///
    /// Any [`SchemaError`]; all are fatal at startup.
    pub async fn attach(factory: StoreFactory) -> Result<Self, SchemaError> {
        Self::attach_with_interval(factory, LIVENESS_INTERVAL).await
    }

    /// [`SchemaGuard::attach`] with a custom liveness period.
    pub async fn attach_with_interval(
        factory: StoreFactory,
        interval: Duration,
    ) -> Result<Self, SchemaError> {
        let store = factory();
        store.shared_lock().await?;
        let state = store.current_state().await?;
        verify_state(&state)?;
        Ok(Self {
            store: Mutex::new(store),
            factory,
            interval,
        })
    }

    /// Release the shared lock with a bounded wait.
    ///
    /// Uses its own deadline rather than the (already cancelled) root token.
    ///
    /// # Errors
    ///
    /// `DetachTimeout` when release does not complete within ~1s, or the
    /// store's own error.
    pub async fn detach(&self) -> Result<(), SchemaError> {
        let store = self.store.lock().await.clone();
        match tokio::time::timeout(DETACH_TIMEOUT, store.shared_unlock()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SchemaError::DetachTimeout),
        }
    }

    /// Run the liveness loop until the root token is cancelled.
    ///
    /// Each cycle pings the store. A failed ping (with the root still live)
    /// gets exactly one recovery attempt: a fresh store handle and a fresh
    /// shared lock. If that also fails, `on_fatal` runs (the supervisor's
    /// hook that records the reason and cancels the root token) and the
    /// loop exits. This is the only path that self-destructs the process
    /// outside explicit shutdown.
    pub fn spawn_liveness(
        self: Arc<Self>,
        root: CancellationToken,
        on_fatal: Box<dyn FnOnce() + Send>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(jittered(self.interval)) => {}
                    _ = root.cancelled() => return,
                }

                let current = self.store.lock().await.clone();
                if let Err(e) = current.ping().await {
                    if root.is_cancelled() {
                        return;
                    }
                    tracing::warn!(error = %e, "schema manager ping failed, re-attaching");

                    let fresh = (self.factory)();
                    match fresh.shared_lock().await {
                        Ok(()) => {
                            *self.store.lock().await = fresh;
                            tracing::info!("schema manager re-attached");
                        }
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                "the schema manager lost its connection with the database \
                                 and cannot ensure its integrity"
                            );
                            on_fatal();
                            return;
                        }
                    }
                }
            }
        })
    }
}

/// Check a snapshot against what this binary can run with.
///
/// # Errors
///
/// One of the four directional state errors.
pub fn verify_state(state: &SchemaState) -> Result<(), SchemaError> {
    if !state.initialization_started {
        return Err(SchemaError::NotInitialized);
    }
    if state.dirty {
        return Err(SchemaError::Dirty);
    }
    if state.binary_schema_version > state.database_schema_version {
        return Err(SchemaError::MustMigrate {
            binary: state.binary_schema_version,
            database: state.database_schema_version,
        });
    }
    if state.binary_schema_version < state.database_schema_version {
        return Err(SchemaError::BinaryTooOld {
            binary: state.binary_schema_version,
            database: state.database_schema_version,
        });
    }
    Ok(())
}

fn jittered(base: Duration) -> Duration {
    // Uniform in [0.5, 1.5) of the base period; half a chance to be faster.
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(factor)
}

/// Advisory lock key shared by every gatehouse controller on a database.
/// The bytes spell "gatehous".
const SHARED_LOCK_ID: i64 = 0x6761_7465_686f_7573;

/// Postgres-backed schema store.
pub struct PgSchemaStore {
    pool: PgPool,
}

impl PgSchemaStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SchemaStore for PgSchemaStore {
    async fn shared_lock(&self) -> Result<(), SchemaStoreError> {
        sqlx::query("SELECT pg_advisory_lock_shared($1)")
            .bind(SHARED_LOCK_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn shared_unlock(&self) -> Result<(), SchemaStoreError> {
        sqlx::query("SELECT pg_advisory_unlock_shared($1)")
            .bind(SHARED_LOCK_ID)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn current_state(&self) -> Result<SchemaState, SchemaStoreError> {
        let row = sqlx::query("SELECT version, dirty FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await;

        match row {
            Ok(Some(row)) => Ok(SchemaState {
                initialization_started: true,
                dirty: row.get("dirty"),
                binary_schema_version: BINARY_SCHEMA_VERSION,
                database_schema_version: row.get("version"),
            }),
            // No row yet: initialization was started but never recorded a
            // version. Treat the same as an absent table.
            Ok(None) => Ok(uninitialized()),
            Err(e) => {
                if is_undefined_table(&e) {
                    Ok(uninitialized())
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn ping(&self) -> Result<(), SchemaStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn uninitialized() -> SchemaState {
    SchemaState {
        initialization_started: false,
        dirty: false,
        binary_schema_version: BINARY_SCHEMA_VERSION,
        database_schema_version: 0,
    }
}

fn is_undefined_table(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("42P01"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(init: bool, dirty: bool, binary: i64, database: i64) -> SchemaState {
        SchemaState {
            initialization_started: init,
            dirty,
            binary_schema_version: binary,
            database_schema_version: database,
        }
    }

    #[test]
    fn matching_versions_pass() {
        assert!(verify_state(&state(true, false, 5, 5)).is_ok());
    }

    #[test]
    fn uninitialized_database_directs_to_init() {
        let err = verify_state(&state(false, false, 5, 0)).unwrap_err();
        assert!(matches!(err, SchemaError::NotInitialized));
        assert!(err.to_string().contains("database init"));
    }

    #[test]
    fn dirty_database_rejected() {
        assert!(matches!(
            verify_state(&state(true, true, 5, 5)),
            Err(SchemaError::Dirty)
        ));
    }

    #[test]
    fn old_database_directs_to_migrate() {
        let err = verify_state(&state(true, false, 5, 3)).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::MustMigrate { binary: 5, database: 3 }
        ));
        assert!(err.to_string().contains("database migrate"));
    }

    #[test]
    fn old_binary_directs_to_upgrade() {
        let err = verify_state(&state(true, false, 5, 9)).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::BinaryTooOld { binary: 5, database: 9 }
        ));
        assert!(err.to_string().contains("newer gatehouse binary"));
    }

    #[test]
    fn jitter_stays_in_band() {
        let base = Duration::from_secs(20);
        for _ in 0..64 {
            let d = jittered(base);
            assert!(d >= Duration::from_secs(10));
            assert!(d < Duration::from_secs(30));
        }
    }
}
