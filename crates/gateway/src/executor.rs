use std::sync::Arc;
use std::time::Duration;

use bigdecimal::ToPrimitive;
use futures::TryStreamExt;
use postgate_contracts::{HELPERS_NAMESPACE, Policy, TenantBackend};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgRow, PgTypeInfo};
use sqlx::{Column, Row, TypeInfo};

use crate::provider::{ConnectionProvider, ProviderError};

/// SQLSTATE raised when the server-side statement timeout cancels a query.
const QUERY_CANCELED: &str = "57014";

#[derive(Debug)]
pub enum ExecutorError {
    Database(sqlx::Error),
    Timeout,
    RowLimitExceeded(i32),
    Unavailable,
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorError::Database(err) => write!(f, "database error: {}", err),
            ExecutorError::Timeout => write!(f, "query timeout"),
            ExecutorError::RowLimitExceeded(cap) => {
                write!(f, "row limit exceeded (max: {})", cap)
            }
            ExecutorError::Unavailable => write!(f, "no database session available"),
        }
    }
}

impl std::error::Error for ExecutorError {}

pub struct QueryOutput {
    pub rows: Vec<Map<String, JsonValue>>,
    pub row_count: usize,
}

/// Runs one validated statement in a tenant-scoped transaction: statement
/// deadline on the server, search path bound to the tenant namespace, rows
/// streamed against the row cap, commit only on full success. Dropping the
/// transaction on any error or on request cancellation rolls it back and
/// releases the session.
pub struct Executor {
    provider: Arc<ConnectionProvider>,
    statement_timeout: Duration,
}

impl Executor {
    pub fn new(provider: Arc<ConnectionProvider>, statement_timeout: Duration) -> Self {
        Self {
            provider,
            statement_timeout,
        }
    }

    pub async fn execute(
        &self,
        policy: &Policy,
        sql: &str,
        params: &[JsonValue],
    ) -> Result<QueryOutput, ExecutorError> {
        let mut tx = self
            .provider
            .begin(policy.backend())
            .await
            .map_err(|err| match err {
                ProviderError::Unavailable => ExecutorError::Unavailable,
                ProviderError::Database(err) => ExecutorError::Database(err),
            })?;

        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        // An unqualified name can now only resolve inside the tenant's own
        // namespace or the helpers namespace. Dedicated backends keep the
        // remote's default search path.
        if let TenantBackend::Shared { namespace } = policy.backend() {
            sqlx::query(&format!(
                "SET LOCAL search_path TO \"{}\", {}",
                namespace.replace('"', "\"\""),
                HELPERS_NAMESPACE
            ))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_json_value(query, param);
        }

        // Statements that produce no result set (DML without RETURNING,
        // DDL) simply yield an empty stream here.
        let row_cap = policy.row_cap().max(0) as usize;
        let mut rows: Vec<Map<String, JsonValue>> = Vec::new();

        {
            let mut stream = query.fetch(&mut *tx);
            while let Some(row) = stream.try_next().await.map_err(map_sqlx_error)? {
                // The peek one past the cap is the detection mechanism; the
                // overflow row is never serialized.
                if rows.len() >= row_cap {
                    return Err(ExecutorError::RowLimitExceeded(policy.row_cap()));
                }
                rows.push(row_to_json(&row));
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(QueryOutput {
            row_count: rows.len(),
            rows,
        })
    }
}

fn map_sqlx_error(err: sqlx::Error) -> ExecutorError {
    match &err {
        sqlx::Error::PoolTimedOut => ExecutorError::Unavailable,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED) => {
            ExecutorError::Timeout
        }
        _ => ExecutorError::Database(err),
    }
}

fn bind_json_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q JsonValue,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        JsonValue::Null => query.bind(None::<String>),
        JsonValue::Bool(b) => query.bind(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(f) = n.as_f64() {
                query.bind(f)
            } else {
                query.bind(n.to_string())
            }
        }
        JsonValue::String(s) => query.bind(s.as_str()),
        JsonValue::Array(_) | JsonValue::Object(_) => query.bind(value),
    }
}

/// One JSON object per row, keyed by result column names. The first
/// occurrence wins when a statement yields duplicate column names.
fn row_to_json(row: &PgRow) -> Map<String, JsonValue> {
    let mut map = Map::new();

    for column in row.columns() {
        let name = column.name();
        if map.contains_key(name) {
            continue;
        }
        let value = column_value(row, column.ordinal(), column.type_info());
        map.insert(name.to_string(), value);
    }

    map
}

fn column_value(row: &PgRow, idx: usize, type_info: &PgTypeInfo) -> JsonValue {
    match type_info.name() {
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::Bool)
            .unwrap_or(JsonValue::Null),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::Number(v.into()))
            .unwrap_or(JsonValue::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::Number(v.into()))
            .unwrap_or(JsonValue::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::Number(v.into()))
            .unwrap_or(JsonValue::Null),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .ok()
            .flatten()
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        "NUMERIC" => row
            .try_get::<Option<bigdecimal::BigDecimal>, _>(idx)
            .ok()
            .flatten()
            .map(numeric_to_json)
            .unwrap_or(JsonValue::Null),
        "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "BPCHAR" => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null),
        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(hex::encode(v)))
            .unwrap_or(JsonValue::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(v.to_rfc3339()))
            .unwrap_or(JsonValue::Null),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(JsonValue::Null),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null),
        "TIME" => row
            .try_get::<Option<chrono::NaiveTime>, _>(idx)
            .ok()
            .flatten()
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<JsonValue>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(JsonValue::Null),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(JsonValue::String)
            .unwrap_or(JsonValue::Null),
    }
}

fn numeric_to_json(value: bigdecimal::BigDecimal) -> JsonValue {
    value
        .to_f64()
        .filter(|f| f.is_finite())
        .and_then(serde_json::Number::from_f64)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_become_numbers_when_representable() {
        let small: bigdecimal::BigDecimal = "42.5".parse().unwrap();
        assert_eq!(numeric_to_json(small), serde_json::json!(42.5));
    }

    #[test]
    fn oversized_numerics_fall_back_to_strings() {
        let huge: bigdecimal::BigDecimal = format!("1{}", "0".repeat(400)).parse().unwrap();
        let JsonValue::String(s) = numeric_to_json(huge) else {
            panic!("expected a string fallback");
        };
        assert!(s.starts_with('1'));
    }
}
