//! HTTP API.
//!
//! # Endpoints
//!
//! | Method   | Path | Description |
//! |----------|------|-------------|
//! | `POST`   | `/v1/sql-answers` | Submit a question with its SQL; returns a query id |
//! | `GET`    | `/v1/sql-answers/{query_id}/result` | Current status and answer |
//! | `GET`    | `/v1/sql-answers/{query_id}/streaming` | Server-sent answer tokens |
//! | `DELETE` | `/v1/sql-answers/{query_id}` | Cancel a running request |
//! | `POST`   | `/v1/indexing` | Index an MDL manifest |
//! | `GET`    | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "sql must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `invalid_mdl` (400), `not_found` (404),
//! `internal` (500). Answer failures are not HTTP errors: they are reported
//! through the `failed` status of the result endpoint.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::indexing::{Indexing, IndexingResult};
use crate::service::{SqlAnswerRequest, SqlAnswerResultResponse, SqlAnswerService};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    service: Arc<SqlAnswerService>,
    indexing: Arc<Indexing>,
}

impl AppState {
    pub fn new(service: Arc<SqlAnswerService>, indexing: Arc<Indexing>) -> Self {
        Self { service, indexing }
    }

    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(
            Arc::new(SqlAnswerService::from_config(config).await?),
            Arc::new(Indexing::from_config(config).await?),
        ))
    }
}

/// Routes for `state`, with CORS applied.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/sql-answers", post(handle_submit))
        .route("/v1/sql-answers/{query_id}", delete(handle_cancel))
        .route("/v1/sql-answers/{query_id}/result", get(handle_result))
        .route("/v1/sql-answers/{query_id}/streaming", get(handle_streaming))
        .route("/v1/indexing", post(handle_indexing))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and serves until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;

    println!("HTTP server listening on http://{}", listener.local_addr()?);
    info!(bind = %config.server.bind, "server started");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

/// A malformed manifest is the caller's fault; anything else is ours.
fn classify_indexing_error(err: Error) -> AppError {
    match err.node_cause() {
        Some(cause @ Error::InvalidSchema(_)) => AppError {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_mdl",
            message: cause.to_string(),
        },
        _ => {
            warn!(error = %err, "indexing failed");
            internal(err.to_string())
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /v1/sql-answers ============

#[derive(Serialize)]
struct SubmitResponse {
    query_id: String,
}

async fn handle_submit(
    State(state): State<AppState>,
    Json(request): Json<SqlAnswerRequest>,
) -> Result<Json<SubmitResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if request.sql.trim().is_empty() {
        return Err(bad_request("sql must not be empty"));
    }
    Ok(Json(SubmitResponse {
        query_id: state.service.submit(request),
    }))
}

async fn handle_result(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
) -> Json<SqlAnswerResultResponse> {
    Json(state.service.get_result(&query_id))
}

/// Each token becomes one event, `data: {"message": "<token>"}`. The
/// stream closes once generation ends, and immediately when the request is
/// not generating.
async fn handle_streaming(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = state
        .service
        .get_streaming_result(&query_id)
        .map(|chunk| Ok(Event::default().data(json!({ "message": chunk }).to_string())));
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn handle_cancel(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
) -> Result<StatusCode, AppError> {
    match state.service.cancel(&query_id) {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e @ Error::NotFound(_)) => Err(not_found(e.to_string())),
        Err(e) => Err(internal(e.to_string())),
    }
}

// ============ POST /v1/indexing ============

/// `mdl` may be the manifest as a JSON string or inline as an object.
#[derive(Deserialize)]
struct IndexingRequest {
    mdl: Value,
    #[serde(default)]
    project_id: Option<String>,
}

async fn handle_indexing(
    State(state): State<AppState>,
    Json(request): Json<IndexingRequest>,
) -> Result<Json<IndexingResult>, AppError> {
    let mdl = match request.mdl {
        Value::String(s) => s,
        other => other.to_string(),
    };
    let result = state
        .indexing
        .run(&mdl, request.project_id.as_deref())
        .await
        .map_err(classify_indexing_error)?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_mdl_is_client_error() {
        let err = Error::NodeFailed {
            node: "validate_mdl".to_string(),
            source: Error::InvalidSchema("expected an object".to_string()).into(),
        };
        let app_err = classify_indexing_error(err);
        assert_eq!(app_err.status, StatusCode::BAD_REQUEST);
        assert_eq!(app_err.code, "invalid_mdl");
        assert!(app_err.message.contains("expected an object"));
    }

    #[test]
    fn test_store_failure_is_server_error() {
        let err = Error::NodeFailed {
            node: "write_view".to_string(),
            source: anyhow::anyhow!("disk full"),
        };
        let app_err = classify_indexing_error(err);
        assert_eq!(app_err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(app_err.code, "internal");
    }
}
