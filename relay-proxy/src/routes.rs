//! HTTP routes and handlers.
//!
//! The dispatch route `POST /{server}/{*path}` is the relay's main entry
//! point: the body is a JSON-RPC request, the response is the upstream's
//! JSON-RPC response verbatim at 200, or a JSON-RPC error body whose HTTP
//! status mirrors the failure (404 unknown server, 503 breaker open or
//! upstream unreachable, 504 timeout, 400 parse error). Every request,
//! including the introspection routes, passes the ring-log middleware.

use std::convert::Infallible;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

use relay_core::error::RelayError;
use relay_core::jsonrpc::{JsonRpcId, JsonRpcRequest, JsonRpcResponse};
use relay_core::observe::RequestLogEntry;

use crate::sse::Session;
use crate::state::AppState;

/// Build the public router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_info))
        .route("/health", get(aggregate_health))
        .route("/health/{server}", get(server_health))
        .route("/enhance", post(enhance))
        .route("/stats", get(stats))
        .route("/actions/clear-cache", post(clear_cache))
        .route("/actions/reset-breakers", post(reset_breakers))
        .route("/sse", get(sse_connect))
        .route("/sse/messages", post(sse_post_message))
        .route("/sse/{session}", delete(sse_disconnect))
        .route("/{server}/{*path}", post(dispatch))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            record_request,
        ))
        .with_state(state)
}

/// Ring-log middleware: one entry per request with final status and
/// latency.
async fn record_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let client = request
        .headers()
        .get("x-client-name")
        .and_then(|value| value.to_str().ok())
        .map(String::from);

    let response = next.run(request).await;

    state.request_log.record(RequestLogEntry {
        timestamp: Utc::now(),
        method,
        path,
        status: response.status().as_u16(),
        latency_ms: start.elapsed().as_millis() as u64,
        client,
    });
    response
}

async fn root_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": "mcp-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "servers": state.registry.list_servers(),
        "endpoints": [
            "GET  /health",
            "GET  /health/{server}",
            "POST /enhance",
            "POST /{server}/{path}",
            "GET  /stats",
            "GET  /sse",
            "POST /sse/messages?session={id}",
            "POST /actions/clear-cache",
            "POST /actions/reset-breakers",
        ],
    }))
}

/// `POST /{server}/{*path}`: the JSON-RPC dispatch entry point.
async fn dispatch(
    State(state): State<AppState>,
    Path((server, _path)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let err = RelayError::ParseError {
                details: e.to_string(),
            };
            // The id is undetectable in an unparseable body.
            return (
                StatusCode::BAD_REQUEST,
                Json(err.into_response(Some(JsonRpcId::Null))),
            )
                .into_response();
        }
    };

    match state.registry.call(&server, &request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            let status = StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(err.into_response(request.id))).into_response()
        }
    }
}

#[derive(Deserialize)]
struct EnhanceRequest {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    client: Option<String>,
}

/// `POST /enhance`: always 200; inference failure degrades to
/// passthrough inside the middleware.
async fn enhance(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request: EnhanceRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("invalid JSON body: {e}")})),
            )
                .into_response();
        }
    };
    if request.prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "prompt is required"})),
        )
            .into_response();
    }

    let client = request.client.or_else(|| {
        headers
            .get("x-client-name")
            .and_then(|value| value.to_str().ok())
            .map(String::from)
    });

    let outcome = state
        .enhancer
        .enhance(&request.prompt, client.as_deref())
        .await;
    Json(outcome).into_response()
}

/// `GET /health`: aggregate status across the inference service and
/// every upstream, plus breaker introspection.
async fn aggregate_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let inference_up = state.inference.available().await;
    let servers = state.registry.all_health().await;
    let breakers = state.registry.breaker_statuses();

    let degraded = !inference_up || servers.iter().any(|server| server.status == "down");

    let mut services = vec![json!({
        "name": "inference",
        "status": if inference_up { "healthy" } else { "down" },
    })];
    services.extend(
        servers
            .iter()
            .map(|server| serde_json::to_value(server).expect("health serializes")),
    );

    Json(json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "services": services,
        "breakers": breakers,
    }))
}

/// `GET /health/{server}`: one upstream's status.
async fn server_health(State(state): State<AppState>, Path(server): Path<String>) -> Response {
    match state.registry.health(&server).await {
        Ok(health) => Json(health).into_response(),
        Err(err) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "cache": state.enhancer.cache_stats().await,
        "recent_requests": state.request_log.snapshot(),
        "sse_sessions": state.sessions.count(),
    }))
}

async fn clear_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.enhancer.clear_cache().await;
    Json(json!({"status": "cache_cleared"}))
}

async fn reset_breakers(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.registry.reset_breakers();
    Json(json!({"status": "breakers_reset"}))
}

/// `GET /sse`: open a session. The first event on the stream is an
/// `endpoint` event whose data is the messages URL for this session; the
/// session id also rides the `X-Session-Id` response header.
async fn sse_connect(State(state): State<AppState>) -> Response {
    let Some((session, rx)) = state.sessions.open() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "session table full"})),
        )
            .into_response();
    };

    let endpoint = format!("/sse/messages?session={}", session.id);
    let _ = session
        .send(Event::default().event("endpoint").data(endpoint))
        .await;

    let stream = ReceiverStream::new(rx).map(Ok::<Event, Infallible>);
    let sse = Sse::new(stream).keep_alive(KeepAlive::default());
    ([("x-session-id", session.id.to_string())], sse).into_response()
}

/// `POST /sse/messages?session={id}`: accept one JSON-RPC request for a
/// session. The HTTP response is 202; the JSON-RPC response is emitted
/// on the stream when the upstream call completes.
async fn sse_post_message(
    State(state): State<AppState>,
    Query(query): Query<std::collections::HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let session = query
        .get("session")
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .and_then(|id| state.sessions.get(&id));
    let Some(session) = session else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found or expired"})),
        )
            .into_response();
    };
    session.touch();

    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let err = RelayError::ParseError {
                details: e.to_string(),
            };
            emit_response(&state, &session, err.into_response(Some(JsonRpcId::Null))).await;
            return (StatusCode::ACCEPTED, Json(json!({"status": "error_sent"}))).into_response();
        }
    };

    // The target upstream comes from the X-MCP-Server header; without
    // one, fall back to the first registered server.
    let target = headers
        .get("x-mcp-server")
        .and_then(|value| value.to_str().ok())
        .map(String::from)
        .or_else(|| state.registry.list_servers().into_iter().next());
    let Some(target) = target else {
        let err = RelayError::InvalidRequest {
            details: "no target server specified and none registered".to_string(),
        };
        emit_response(&state, &session, err.into_response(request.id)).await;
        return (StatusCode::ACCEPTED, Json(json!({"status": "error_sent"}))).into_response();
    };

    // Dispatch on its own task: messages are accepted in arrival order,
    // responses are emitted in completion order.
    let task_state = state.clone();
    tokio::spawn(async move {
        debug!(session = %session.id, server = %target, method = %request.method,
               "dispatching sse message");
        let response = match task_state.registry.call(&target, &request).await {
            Ok(response) => response,
            Err(err) => err.into_response(request.id.clone()),
        };
        emit_response(&task_state, &session, response).await;
    });

    (StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response()
}

/// Emit a JSON-RPC response as a `message` event; a failed send means
/// the client went away, so the session is closed.
async fn emit_response(state: &AppState, session: &Session, response: JsonRpcResponse) {
    let data = serde_json::to_string(&response).expect("response serializes");
    if session
        .send(Event::default().event("message").data(data))
        .await
        .is_err()
    {
        state.sessions.close(&session.id);
    }
}

/// `DELETE /sse/{session}`: explicit disconnect.
async fn sse_disconnect(State(state): State<AppState>, Path(session): Path<String>) -> Response {
    let closed = Uuid::parse_str(&session)
        .ok()
        .map(|id| state.sessions.close(&id))
        .unwrap_or(false);
    if closed {
        Json(json!({"status": "closed"})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found"})),
        )
            .into_response()
    }
}
