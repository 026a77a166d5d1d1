// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface of the gateway.

use crate::adapters::{Protocol, RequestContext};
use crate::errors::{DecodeError, HeartbeatError};
use crate::heartbeat::remote_addr;
use crate::http_utils::log_and_create_http_response;
use crate::pipeline::Pipeline;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, MatchedPath, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info};

pub const REMOTE_WRITE_PATH: &str = "/prometheus/v1/write";
pub const PROXY_WRITE_PATH: &str = "/proxy/v1/write";
pub const OPENTSDB_PUT_PATH: &str = "/opentsdb/put";
pub const FALCON_PUSH_PATH: &str = "/openfalcon/push";
pub const DATADOG_SERIES_PATH: &str = "/datadog/api/v1/series";
pub const DATADOG_VALIDATE_PATH: &str = "/datadog/api/v1/validate";
pub const DATADOG_CHECK_RUN_PATH: &str = "/datadog/api/v1/check_run";
pub const DATADOG_METADATA_PATH: &str = "/datadog/api/v1/metadata";
pub const DATADOG_INTAKE_PATH: &str = "/datadog/intake/";
pub const HEARTBEAT_PATH: &str = "/v1/n9e/heartbeat";
pub const EDGE_HEARTBEAT_PATH: &str = "/v1/n9e/edge/heartbeat";
pub const ACTIVE_TARGETS_PATH: &str = "/v1/n9e/targets/active";
pub const WRITERS_PATH: &str = "/v1/n9e/writers";
pub const STATS_PATH: &str = "/v1/n9e/stats";

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
}

pub fn router(pipeline: Arc<Pipeline>, max_request_body_bytes: usize) -> Router {
    let state = AppState { pipeline };

    let ingest_router = Router::new()
        .route(REMOTE_WRITE_PATH, post(remote_write))
        .route(PROXY_WRITE_PATH, post(remote_write))
        .route(OPENTSDB_PUT_PATH, post(opentsdb_put))
        .route(FALCON_PUSH_PATH, post(falcon_push))
        .route(DATADOG_SERIES_PATH, post(datadog_series))
        .route(DATADOG_CHECK_RUN_PATH, post(datadog_accepted))
        .route(DATADOG_METADATA_PATH, post(datadog_accepted))
        .route(DATADOG_INTAKE_PATH, post(datadog_accepted))
        .route(HEARTBEAT_PATH, post(heartbeat))
        .route(EDGE_HEARTBEAT_PATH, post(heartbeat))
        .layer(RequestBodyLimitLayer::new(max_request_body_bytes))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            track_requests,
        ))
        .with_state(state.clone());

    let query_router = Router::new()
        .route(DATADOG_VALIDATE_PATH, get(datadog_validate))
        .route(ACTIVE_TARGETS_PATH, get(active_targets))
        .route(WRITERS_PATH, get(writers))
        .route(STATS_PATH, get(stats))
        .with_state(state);

    Router::new()
        .merge(ingest_router)
        .merge(query_router)
        .fallback(handler_not_found)
        // Disable the default body limit so we can use our own limit
        .layer(DefaultBodyLimit::disable())
}

/// Serves `router` until `cancel` fires, then lets in-flight requests finish.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {addr}");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(graceful_shutdown(cancel))
        .await
}

async fn graceful_shutdown(cancel: CancellationToken) {
    cancel.cancelled().await;
    debug!("Shutdown signal received, shutting down HTTP server");
}

/// Records method, matched route, status and duration of every ingestion request.
async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let response = next.run(request).await;
    state.pipeline.observe_request(
        method.as_str(),
        &route,
        response.status().as_u16(),
        start.elapsed(),
    );
    response
}

/// Oversized decoded bodies are refused like oversized raw ones.
fn decode_error_status(error: &DecodeError) -> StatusCode {
    match error {
        DecodeError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    }
}

pub async fn handler_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    RequestContext::new(
        header_str(headers, header::CONTENT_TYPE),
        header_str(headers, header::CONTENT_ENCODING),
    )
}

async fn remote_write(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match state
        .pipeline
        .ingest(Protocol::RemoteWrite, &body, &request_context(&headers))
    {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => log_and_create_http_response(
            &format!("Invalid remote write payload: {e}"),
            decode_error_status(&e),
        ),
    }
}

/// OpenTSDB and Open-Falcon report per-record success and failure counts.
fn counted_ingest(state: &AppState, protocol: Protocol, headers: &HeaderMap, body: &[u8]) -> Response {
    match state
        .pipeline
        .ingest(protocol, body, &request_context(headers))
    {
        Ok(report) => {
            let msg = report
                .decode_errors
                .first()
                .map(ToString::to_string)
                .unwrap_or_default();
            (
                StatusCode::OK,
                Json(json!({
                    "succ": report.accepted,
                    "fail": report.failed(),
                    "msg": msg,
                })),
            )
                .into_response()
        }
        Err(e) => log_and_create_http_response(
            &format!("Invalid {} payload: {e}", protocol.name()),
            decode_error_status(&e),
        ),
    }
}

async fn opentsdb_put(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    counted_ingest(&state, Protocol::OpenTsdb, &headers, &body)
}

async fn falcon_push(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    counted_ingest(&state, Protocol::Falcon, &headers, &body)
}

async fn datadog_series(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match state
        .pipeline
        .ingest(Protocol::Datadog, &body, &request_context(&headers))
    {
        Ok(_) => (StatusCode::ACCEPTED, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => log_and_create_http_response(
            &format!("Invalid datadog series payload: {e}"),
            decode_error_status(&e),
        ),
    }
}

async fn datadog_validate() -> Response {
    (StatusCode::OK, Json(json!({ "valid": true }))).into_response()
}

/// Check runs, host metadata and intake payloads are accepted and discarded.
async fn datadog_accepted() -> Response {
    (StatusCode::ACCEPTED, Json(json!({ "status": "ok" }))).into_response()
}

async fn heartbeat(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let addr = remote_addr(
        header_str(&headers, header::HeaderName::from_static("x-real-ip")),
        header_str(&headers, header::HeaderName::from_static("x-forwarded-for")),
    );
    match state.pipeline.heartbeat(
        &body,
        header_str(&headers, header::CONTENT_ENCODING),
        addr.as_deref(),
    ) {
        Ok(_) => (StatusCode::OK, Json(json!({ "dat": "ok", "err": "" }))).into_response(),
        Err(HeartbeatError::Identity(e)) => {
            log_and_create_http_response(&e.to_string(), StatusCode::BAD_REQUEST)
        }
        Err(HeartbeatError::Decode(e)) => log_and_create_http_response(
            &format!("Invalid heartbeat payload: {e}"),
            decode_error_status(&e),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ActiveParams {
    since_secs: Option<u64>,
}

async fn active_targets(
    State(state): State<AppState>,
    Query(params): Query<ActiveParams>,
) -> Response {
    let window = params
        .since_secs
        .map_or(state.pipeline.ident_ttl(), Duration::from_secs);
    Json(state.pipeline.active_targets(window)).into_response()
}

async fn writers(State(state): State<AppState>) -> Response {
    Json(state.pipeline.writer_statuses()).into_response()
}

async fn stats(State(state): State<AppState>) -> Response {
    Json(state.pipeline.stats_report()).into_response()
}
