use std::collections::HashMap;
use std::time::Duration;

use postgate_contracts::TenantBackend;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tokio::sync::RwLock;

#[derive(Debug)]
pub enum ProviderError {
    Unavailable,
    Database(sqlx::Error),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Unavailable => write!(f, "no database session available"),
            ProviderError::Database(err) => write!(f, "session acquisition failed: {}", err),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Maps a tenant backend to a transactional session. Shared tenants ride
/// the host pool; dedicated tenants get a lazily created pool per DSN,
/// retained for the process lifetime.
pub struct ConnectionProvider {
    shared: PgPool,
    dedicated: RwLock<HashMap<String, PgPool>>,
    acquire_timeout: Duration,
    dedicated_pool_cap: u32,
}

impl ConnectionProvider {
    pub fn new(shared: PgPool, acquire_timeout: Duration, dedicated_pool_cap: u32) -> Self {
        Self {
            shared,
            dedicated: RwLock::new(HashMap::new()),
            acquire_timeout,
            dedicated_pool_cap,
        }
    }

    pub fn shared_pool(&self) -> &PgPool {
        &self.shared
    }

    /// Begin a transaction on the backend's pool. A session is returned to
    /// its pool when the transaction commits or is dropped.
    pub async fn begin(
        &self,
        backend: &TenantBackend,
    ) -> Result<Transaction<'static, Postgres>, ProviderError> {
        let pool = match backend {
            TenantBackend::Shared { .. } => self.shared.clone(),
            TenantBackend::Dedicated { dsn } => self.dedicated_pool(dsn).await?,
        };

        pool.begin().await.map_err(|err| match err {
            sqlx::Error::PoolTimedOut => ProviderError::Unavailable,
            other => ProviderError::Database(other),
        })
    }

    /// One-shot insert per DSN. `connect_lazy` registers the pool without
    /// dialing the remote, so creation never blocks the registry lock and
    /// the DSN is only probed on first use.
    async fn dedicated_pool(&self, dsn: &str) -> Result<PgPool, ProviderError> {
        if let Some(pool) = self.dedicated.read().await.get(dsn) {
            return Ok(pool.clone());
        }

        let mut pools = self.dedicated.write().await;
        if let Some(pool) = pools.get(dsn) {
            return Ok(pool.clone());
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.dedicated_pool_cap)
            .acquire_timeout(self.acquire_timeout)
            .connect_lazy(dsn)
            .map_err(ProviderError::Database)?;

        pools.insert(dsn.to_string(), pool.clone());
        Ok(pool)
    }
}
