//! Controller persistence seam.
//!
//! Everything the control plane must remember across requests lives behind
//! [`ControlStore`]: the sealed issuing key, the global root-key presence
//! marker, activation-token consumptions, and operator approvals of
//! worker-led requests. Production is Postgres on the same pool the schema
//! guard watches; tests use the in-memory store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use sqlx::postgres::PgPool;

/// Backend failure in the control store.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self(e.to_string())
    }
}

#[async_trait::async_trait]
pub trait ControlStore: Send + Sync {
    /// The sealed issuing keypair, if one has been persisted.
    async fn load_issuer(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Persist a sealed issuing keypair. First writer wins; callers must
    /// re-load afterwards and use whatever the store returns.
    async fn store_issuer(&self, sealed: &[u8]) -> Result<(), StoreError>;

    /// Whether a global-scope root key record exists. Its absence after
    /// migration means the database is in a bad state.
    async fn has_global_root_key(&self) -> Result<bool, StoreError>;

    /// Consume an activation token exactly once. Returns `false` when the
    /// token was already consumed.
    async fn consume_activation(
        &self,
        token_hash: [u8; 32],
        worker_name: &str,
    ) -> Result<bool, StoreError>;

    /// Record operator approval of an auth request token.
    async fn approve_request(&self, request_hash: [u8; 32]) -> Result<(), StoreError>;

    /// Whether an auth request token has been approved.
    async fn is_request_approved(&self, request_hash: [u8; 32]) -> Result<bool, StoreError>;
}

/// Postgres-backed control store.
pub struct PgControlStore {
    pool: PgPool,
}

impl PgControlStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ControlStore for PgControlStore {
    async fn load_issuer(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT sealed_key FROM controller_issuer WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(sealed,)| sealed))
    }

    async fn store_issuer(&self, sealed: &[u8]) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO controller_issuer (id, sealed_key) VALUES (1, $1)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(sealed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_global_root_key(&self) -> Result<bool, StoreError> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM kms_root_keys WHERE scope_id = 'global' LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn consume_activation(
        &self,
        token_hash: [u8; 32],
        worker_name: &str,
    ) -> Result<bool, StoreError> {
        // Single atomic insert; the primary key makes double-consumption a
        // no-op we can observe.
        let result = sqlx::query(
            "INSERT INTO activation_token_uses (token_hash, worker_name, used_at)
             VALUES ($1, $2, now())
             ON CONFLICT (token_hash) DO NOTHING",
        )
        .bind(&token_hash[..])
        .bind(worker_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn approve_request(&self, request_hash: [u8; 32]) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO worker_auth_approvals (request_hash, approved_at)
             VALUES ($1, now())
             ON CONFLICT (request_hash) DO NOTHING",
        )
        .bind(&request_hash[..])
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_request_approved(&self, request_hash: [u8; 32]) -> Result<bool, StoreError> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM worker_auth_approvals WHERE request_hash = $1")
                .bind(&request_hash[..])
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }
}

/// In-memory control store for tests and ephemeral setups.
#[derive(Default)]
pub struct MemoryControlStore {
    inner: Mutex<MemoryInner>,
    /// When set, every operation fails; used to exercise transient-error
    /// handling.
    fail: AtomicBool,
}

#[derive(Default)]
struct MemoryInner {
    issuer: Option<Vec<u8>>,
    consumed: HashSet<[u8; 32]>,
    approved: HashSet<[u8; 32]>,
    has_root_key: bool,
}

impl MemoryControlStore {
    /// A store that looks like a freshly migrated database.
    #[must_use]
    pub fn new() -> Self {
        let store = Self::default();
        store.inner.lock().expect("store lock poisoned").has_root_key = true;
        store
    }

    /// A store whose migration never produced a root key.
    #[must_use]
    pub fn without_root_key() -> Self {
        Self::default()
    }

    /// Toggle failure injection.
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError("injected store failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ControlStore for MemoryControlStore {
    async fn load_issuer(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        Ok(self.inner.lock().expect("store lock poisoned").issuer.clone())
    }

    async fn store_issuer(&self, sealed: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.issuer.is_none() {
            inner.issuer = Some(sealed.to_vec());
        }
        Ok(())
    }

    async fn has_global_root_key(&self) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.inner.lock().expect("store lock poisoned").has_root_key)
    }

    async fn consume_activation(
        &self,
        token_hash: [u8; 32],
        _worker_name: &str,
    ) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .expect("store lock poisoned")
            .consumed
            .insert(token_hash))
    }

    async fn approve_request(&self, request_hash: [u8; 32]) -> Result<(), StoreError> {
        self.check()?;
        self.inner
            .lock()
            .expect("store lock poisoned")
            .approved
            .insert(request_hash);
        Ok(())
    }

    async fn is_request_approved(&self, request_hash: [u8; 32]) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .expect("store lock poisoned")
            .approved
            .contains(&request_hash))
    }
}
