use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use postgate_contracts::Policy;
use postgate_store::{MetadataStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgPoolOptions;

use crate::config::{
    DEDICATED_POOL_MAX_CONNECTIONS, GatewayConfig, QUERY_TIMEOUT, SESSION_ACQUIRE_TIMEOUT,
    SHARED_POOL_MAX_CONNECTIONS, StartupError, TOUCH_QUEUE_CAPACITY,
};
use crate::executor::{Executor, ExecutorError};
use crate::provider::ConnectionProvider;
use crate::touch::TouchQueue;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    store: MetadataStore,
    executor: Arc<Executor>,
    touch: TouchQueue,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let pool = PgPoolOptions::new()
        .max_connections(SHARED_POOL_MAX_CONNECTIONS)
        .acquire_timeout(SESSION_ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await
        .map_err(|err| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: format!("failed to connect to the host database: {}", err),
        })?;

    postgate_store::migrate(&pool)
        .await
        .map_err(|err| StartupError {
            code: "ERR_MIGRATION_FAILED",
            message: format!("failed to apply metadata migrations: {}", err),
        })?;

    let store = MetadataStore::new(pool.clone());
    let provider = Arc::new(ConnectionProvider::new(
        pool,
        SESSION_ACQUIRE_TIMEOUT,
        DEDICATED_POOL_MAX_CONNECTIONS,
    ));
    let executor = Arc::new(Executor::new(provider, QUERY_TIMEOUT));
    let touch = TouchQueue::start(store.clone(), TOUCH_QUEUE_CAPACITY);

    let state = AppState {
        config,
        store,
        executor,
        touch,
    };

    Ok(Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/query", post(query))
        .with_state(state))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<JsonValue>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub rows: Vec<Map<String, JsonValue>>,
    pub row_count: usize,
}

async fn query(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let started = Instant::now();

    let result = query_inner(&state, &headers, body).await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request("/query", "POST", status.as_u16(), started.elapsed());

    result
}

async fn query_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let policy = authenticate(state, headers).await?;

    let Json(req) = body.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "PARSE_ERROR",
            "request body must be a JSON object with an \"sql\" field",
        )
    })?;

    let statement = postgate_validator::validate(&req.sql, &policy.allowed_ops).map_err(|err| {
        tracing::debug!(
            tenant_id = %policy.tenant.id,
            error = %err,
            "statement rejected"
        );
        json_error(StatusCode::BAD_REQUEST, "PARSE_ERROR", err.to_string())
    })?;

    let operation = statement.operation;
    let output = state
        .executor
        .execute(&policy, &req.sql, &req.params)
        .await
        .map_err(|err| {
            crate::metrics::observe_query(operation.as_str(), "error");
            executor_error_response(&policy, err)
        })?;

    crate::metrics::observe_query(operation.as_str(), "success");
    tracing::info!(
        tenant_id = %policy.tenant.id,
        operation = %operation,
        row_count = output.row_count,
        "query executed"
    );

    state.touch.enqueue(policy.token_id, Utc::now());

    Ok(Json(QueryResponse {
        rows: output.rows,
        row_count: output.row_count,
    }))
}

/// Bearer secret → hash → token + tenant → policy. Malformed and unknown
/// credentials are indistinguishable to the caller.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Policy, ApiError> {
    let secret = postgate_auth::bearer_secret(headers).map_err(|_| unauthorized())?;
    let hash = postgate_auth::hash_secret(&secret);

    match state.store.find_token_by_hash(&hash).await {
        Ok(Some((token, tenant))) => Ok(Policy {
            tenant,
            token_id: token.id,
            allowed_ops: token.permissions,
        }),
        Ok(None) => Err(unauthorized()),
        Err(StoreError::TenantNotFound(tenant_id)) => {
            tracing::warn!(%tenant_id, "token resolved but its database is gone");
            Err(json_error(
                StatusCode::NOT_FOUND,
                "DATABASE_NOT_FOUND",
                "the database for this token no longer exists",
            ))
        }
        Err(err @ StoreError::InvalidBackend(_)) => {
            // A persisted row violating the backend invariant is a bug, not
            // a caller problem.
            tracing::error!(error = %err, "metadata invariant violated");
            Err(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "internal error",
            ))
        }
        Err(err) => {
            tracing::error!(error = %err, "token lookup failed");
            Err(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "token lookup failed",
            ))
        }
    }
}

fn unauthorized() -> ApiError {
    json_error(
        StatusCode::UNAUTHORIZED,
        "UNAUTHORIZED",
        "invalid or missing bearer token",
    )
}

fn executor_error_response(policy: &Policy, err: ExecutorError) -> ApiError {
    match err {
        ExecutorError::RowLimitExceeded(cap) => json_error(
            StatusCode::BAD_REQUEST,
            "ROW_LIMIT_EXCEEDED",
            format!("row limit exceeded (max: {})", cap),
        ),
        ExecutorError::Timeout => {
            tracing::warn!(tenant_id = %policy.tenant.id, "statement timeout fired");
            json_error(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", "query timeout")
        }
        ExecutorError::Unavailable => {
            tracing::warn!(tenant_id = %policy.tenant.id, "session pool exhausted");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "UNAVAILABLE",
                "no database session available",
            )
        }
        ExecutorError::Database(err) => {
            tracing::warn!(
                tenant_id = %policy.tenant.id,
                error = %err,
                "query execution failed"
            );
            // Everything the statement could address lives inside the
            // caller's own namespace, so the driver message is theirs to see.
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                err.to_string(),
            )
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

fn json_error(status: StatusCode, code: impl Into<String>, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}
