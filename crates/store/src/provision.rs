use postgate_contracts::{Tenant, TenantBackend};
use sqlx::Row;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::StoreError;

/// Truncation bound for the sanitized name suffix; `tenant_` + 32 hex +
/// `_` + suffix must stay inside PostgreSQL's 63-byte identifier limit.
const NAME_SUFFIX_MAX: usize = 20;

/// Creates and destroys tenant namespaces atomically with their metadata
/// rows. DDL on the host and the row mutation always share one transaction,
/// so a failure on either side leaves no orphan namespace and no orphan row.
pub struct TenantProvisioner {
    pool: PgPool,
}

impl TenantProvisioner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_shared_tenant(
        &self,
        name: &str,
        row_cap: i32,
    ) -> Result<Tenant, StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::InvalidBackend(
                "tenant name must be non-empty".to_string(),
            ));
        }
        if row_cap <= 0 {
            return Err(StoreError::InvalidBackend(
                "row cap must be positive".to_string(),
            ));
        }

        let namespace = namespace_for(name);

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS \"{}\"",
            quote_escape(&namespace)
        ))
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "INSERT INTO postgate_databases (name, backend_type, schema_name, max_rows) \
             VALUES ($1, 'schema', $2, $3) RETURNING id, created_at",
        )
        .bind(name)
        .bind(&namespace)
        .bind(row_cap)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if matches!(&err, sqlx::Error::Database(db) if db.is_unique_violation()) {
                StoreError::Conflict("namespace is already in use".to_string())
            } else {
                StoreError::Database(err)
            }
        })?;

        let tenant = Tenant {
            id: row.try_get("id")?,
            name: name.to_string(),
            backend: TenantBackend::Shared { namespace },
            row_cap,
            created_at: row.try_get("created_at")?,
        };

        tx.commit().await?;

        Ok(tenant)
    }

    /// Inserts the metadata row only. The remote DSN is not probed here;
    /// the connection provider dials it on first use.
    pub async fn create_dedicated_tenant(
        &self,
        name: &str,
        dsn: &str,
        row_cap: i32,
    ) -> Result<Tenant, StoreError> {
        if dsn.trim().is_empty() {
            return Err(StoreError::InvalidBackend(
                "dedicated backend requires a connection string".to_string(),
            ));
        }
        if row_cap <= 0 {
            return Err(StoreError::InvalidBackend(
                "row cap must be positive".to_string(),
            ));
        }

        let row = sqlx::query(
            "INSERT INTO postgate_databases (name, backend_type, connection_string, max_rows) \
             VALUES ($1, 'dedicated', $2, $3) RETURNING id, created_at",
        )
        .bind(name)
        .bind(dsn)
        .bind(row_cap)
        .fetch_one(&self.pool)
        .await?;

        Ok(Tenant {
            id: row.try_get("id")?,
            name: name.to_string(),
            backend: TenantBackend::Dedicated {
                dsn: dsn.to_string(),
            },
            row_cap,
            created_at: row.try_get("created_at")?,
        })
    }

    /// Returns whether a row existed. For shared tenants the namespace is
    /// dropped CASCADE in the same transaction as the metadata delete; the
    /// token cascade rides on the foreign key. Nothing is ever dropped on a
    /// dedicated remote.
    pub async fn delete_tenant(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT backend_type, schema_name FROM postgate_databases WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let backend_type: String = row.try_get("backend_type")?;
        let schema_name: Option<String> = row.try_get("schema_name")?;

        if backend_type == "schema" {
            if let Some(namespace) = schema_name.filter(|ns| ns != "public") {
                sqlx::query(&format!(
                    "DROP SCHEMA IF EXISTS \"{}\" CASCADE",
                    quote_escape(&namespace)
                ))
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("DELETE FROM postgate_databases WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(true)
    }
}

/// `tenant_<32 hex>_<sanitized name>`. The hex segment carries a fresh
/// 128-bit identifier; sanitization maps anything outside `[A-Za-z0-9_]`
/// to `_`.
fn namespace_for(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .take(NAME_SUFFIX_MAX)
        .collect();

    format!("tenant_{}_{}", Uuid::new_v4().simple(), suffix)
}

fn quote_escape(ident: &str) -> String {
    ident.replace('"', "\"\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_have_the_documented_shape() {
        let ns = namespace_for("my-app!");
        let rest = ns.strip_prefix("tenant_").expect("tenant_ prefix");

        let (hex, suffix) = rest.split_at(32);
        assert!(hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
        assert_eq!(suffix, "_my_app_");
    }

    #[test]
    fn namespaces_are_unique_per_call() {
        assert_ne!(namespace_for("app"), namespace_for("app"));
    }

    #[test]
    fn long_names_are_truncated_below_the_identifier_limit() {
        let ns = namespace_for(&"x".repeat(200));
        assert!(ns.len() <= 63);
    }
}
