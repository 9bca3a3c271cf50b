use std::collections::HashSet;

use chrono::{DateTime, Utc};
use postgate_contracts::{SqlOperation, Tenant, TenantBackend, TokenRecord, TokenSummary};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use uuid::Uuid;

pub mod provision;

pub use provision::TenantProvisioner;

#[derive(Debug)]
pub enum StoreError {
    Database(sqlx::Error),
    Conflict(String),
    TenantNotFound(Uuid),
    InvalidBackend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(err) => write!(f, "metadata sql error: {}", err),
            StoreError::Conflict(what) => write!(f, "conflict: {}", what),
            StoreError::TenantNotFound(id) => write!(f, "database {} not found", id),
            StoreError::InvalidBackend(reason) => write!(f, "invalid backend: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Database(value)
    }
}

/// CRUD over the two metadata tables in the host database. Concurrent
/// creators are serialized by the unique constraints, not by in-process
/// locks.
#[derive(Clone)]
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create_tenant(
        &self,
        name: &str,
        backend: &TenantBackend,
        row_cap: i32,
    ) -> Result<Tenant, StoreError> {
        if row_cap <= 0 {
            return Err(StoreError::InvalidBackend(
                "row cap must be positive".to_string(),
            ));
        }

        let (backend_type, schema_name, connection_string) = match backend {
            TenantBackend::Shared { namespace } => {
                if namespace.trim().is_empty() {
                    return Err(StoreError::InvalidBackend(
                        "shared backend requires a namespace".to_string(),
                    ));
                }
                ("schema", Some(namespace.as_str()), None)
            }
            TenantBackend::Dedicated { dsn } => {
                if dsn.trim().is_empty() {
                    return Err(StoreError::InvalidBackend(
                        "dedicated backend requires a connection string".to_string(),
                    ));
                }
                ("dedicated", None, Some(dsn.as_str()))
            }
        };

        let row = sqlx::query(
            "INSERT INTO postgate_databases (name, backend_type, schema_name, connection_string, max_rows) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id, created_at",
        )
        .bind(name)
        .bind(backend_type)
        .bind(schema_name)
        .bind(connection_string)
        .bind(row_cap)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict("namespace is already in use".to_string())
            } else {
                StoreError::Database(err)
            }
        })?;

        Ok(Tenant {
            id: row.try_get("id")?,
            name: name.to_string(),
            backend: backend.clone(),
            row_cap,
            created_at: row.try_get("created_at")?,
        })
    }

    pub async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, backend_type, schema_name, connection_string, max_rows, created_at \
             FROM postgate_databases WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| tenant_from_row(&row)).transpose()
    }

    /// Removes the metadata row and, via the cascade, every token bound to
    /// it. Dropping the backing namespace is the provisioner's job.
    pub async fn delete_tenant(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM postgate_databases WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, backend_type, schema_name, connection_string, max_rows, created_at \
             FROM postgate_databases ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(tenant_from_row).collect()
    }

    pub async fn create_token(
        &self,
        tenant_id: Uuid,
        name: &str,
        permissions: &HashSet<SqlOperation>,
        hash: &str,
        prefix: &str,
    ) -> Result<TokenRecord, StoreError> {
        if hash.is_empty() {
            return Err(StoreError::InvalidBackend(
                "token hash must be non-empty".to_string(),
            ));
        }

        let mut ops: Vec<String> = permissions.iter().map(|p| p.as_str().to_string()).collect();
        ops.sort();

        let row = sqlx::query(
            "INSERT INTO postgate_tokens (database_id, name, token_hash, token_prefix, allowed_operations) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id, created_at",
        )
        .bind(tenant_id)
        .bind(name)
        .bind(hash)
        .bind(prefix)
        .bind(&ops)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                StoreError::TenantNotFound(tenant_id)
            } else if is_unique_violation(&err) {
                StoreError::Conflict(format!("token name {:?} is already in use", name))
            } else {
                StoreError::Database(err)
            }
        })?;

        Ok(TokenRecord {
            id: row.try_get("id")?,
            tenant_id,
            name: name.to_string(),
            hash: hash.to_string(),
            prefix: prefix.to_string(),
            permissions: permissions.clone(),
            created_at: row.try_get("created_at")?,
            last_used_at: None,
        })
    }

    pub async fn delete_token(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM postgate_tokens WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_tokens(&self, tenant_id: Uuid) -> Result<Vec<TokenSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, token_prefix, created_at, last_used_at \
             FROM postgate_tokens WHERE database_id = $1 ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<TokenSummary, StoreError> {
                Ok(TokenSummary {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    prefix: row.try_get("token_prefix")?,
                    created_at: row.try_get("created_at")?,
                    last_used_at: row.try_get("last_used_at")?,
                })
            })
            .collect()
    }

    /// The auth hot path: indexed lookup by hash, then the tenant fetch. A
    /// token whose tenant row vanished between the two reads surfaces as
    /// `TenantNotFound`.
    pub async fn find_token_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<(TokenRecord, Tenant)>, StoreError> {
        let row = sqlx::query(
            "SELECT id, database_id, name, token_hash, token_prefix, allowed_operations, \
             created_at, last_used_at \
             FROM postgate_tokens WHERE token_hash = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let token = token_from_row(&row)?;
        let tenant = self
            .get_tenant(token.tenant_id)
            .await?
            .ok_or(StoreError::TenantNotFound(token.tenant_id))?;

        Ok(Some((token, tenant)))
    }

    /// Best-effort by contract: callers queue this outside the request
    /// transaction and tolerate loss.
    pub async fn touch_token(&self, id: Uuid, when: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE postgate_tokens SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(when)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant, StoreError> {
    let backend_type: String = row.try_get("backend_type")?;
    let schema_name: Option<String> = row.try_get("schema_name")?;
    let connection_string: Option<String> = row.try_get("connection_string")?;

    let backend = match backend_type.as_str() {
        "schema" => TenantBackend::Shared {
            namespace: schema_name.ok_or_else(|| {
                StoreError::InvalidBackend("schema backend without a namespace".to_string())
            })?,
        },
        "dedicated" => TenantBackend::Dedicated {
            dsn: connection_string.ok_or_else(|| {
                StoreError::InvalidBackend(
                    "dedicated backend without a connection string".to_string(),
                )
            })?,
        },
        other => return Err(StoreError::InvalidBackend(other.to_string())),
    };

    Ok(Tenant {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        backend,
        row_cap: row.try_get("max_rows")?,
        created_at: row.try_get("created_at")?,
    })
}

fn token_from_row(row: &PgRow) -> Result<TokenRecord, StoreError> {
    let ops: Vec<String> = row.try_get("allowed_operations")?;
    // Unknown strings in the persisted array are ignored rather than fatal.
    let permissions: HashSet<SqlOperation> =
        ops.iter().filter_map(|op| SqlOperation::parse(op)).collect();

    Ok(TokenRecord {
        id: row.try_get("id")?,
        tenant_id: row.try_get("database_id")?,
        name: row.try_get("name")?,
        hash: row.try_get("token_hash")?,
        prefix: row.try_get("token_prefix")?,
        permissions,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}
