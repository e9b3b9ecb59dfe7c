use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use skein_core::events::Envelope;
use skein_core::ids::{NodeId, ThreadId};
use skein_core::layout::{ObservedGraph, Position};
use skein_core::wire;
use skein_telemetry::MetricsAggregator;

use crate::auth::{self, Authorizer};
use crate::hub::ChannelHub;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9091,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ChannelHub>,
    pub metrics: Arc<MetricsAggregator>,
    pub authorizer: Arc<dyn Authorizer>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/threads/{thread_id}/events", get(events_handler))
        .route("/threads/{thread_id}/snapshot", get(snapshot_handler))
        .route("/threads/{thread_id}/metrics", get(thread_metrics_handler))
        .route("/threads/{thread_id}/layout", get(layout_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, serve and start channel cleanup. Returns a handle to shut it all down.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    let hub = Arc::clone(&state.hub);
    let cleanup = hub.spawn_cleanup();
    let router = build_router(state);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    tracing::info!(%addr, "skein server started");
    Ok(ServerHandle {
        addr,
        hub,
        shutdown,
        server,
        cleanup,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    addr: SocketAddr,
    hub: Arc<ChannelHub>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// End every stream, stop accepting connections and wait for the tasks.
    pub async fn shutdown(self) {
        self.hub.shutdown();
        self.shutdown.cancel();
        let tasks = async {
            let _ = self.server.await;
            let _ = self.cleanup.await;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, tasks).await.is_err() {
            tracing::warn!("server tasks did not stop within the grace period");
        }
    }
}

/// How envelopes are framed on the response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamFormat {
    Ndjson,
    Sse,
}

impl StreamFormat {
    fn negotiate(headers: &HeaderMap) -> Self {
        let wants_sse = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/event-stream"));
        if wants_sse {
            Self::Sse
        } else {
            Self::Ndjson
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Self::Ndjson => "application/x-ndjson",
            Self::Sse => "text/event-stream",
        }
    }

    fn encode(self, env: &Envelope) -> Result<String, skein_core::errors::WireError> {
        match self {
            Self::Ndjson => wire::encode_line(env),
            Self::Sse => wire::encode_sse(env),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    last_sequence: Option<u64>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn events_handler(
    State(state): State<AppState>,
    Path(thread_id): Path<ThreadId>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = auth::check(state.authorizer.as_ref(), &headers, &thread_id) {
        return e.into_response();
    }
    let format = StreamFormat::negotiate(&headers);
    let last_sequence = query.last_sequence.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    });

    let subscription = match state.hub.subscribe(&thread_id, last_sequence) {
        Ok(s) => s,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    tracing::info!(
        thread_id = %thread_id,
        generation = subscription.generation,
        resynced = subscription.resynced,
        last_sequence,
        format = ?format,
        "stream opened"
    );

    let stream = ReceiverStream::new(subscription.events).filter_map(move |env| {
        let frame = match format.encode(&env) {
            Ok(text) => Some(Ok::<Bytes, Infallible>(Bytes::from(text))),
            Err(e) => {
                tracing::warn!(thread_id = %env.thread_id, sequence = env.sequence, error = %e, "envelope encoding failed");
                None
            }
        };
        futures::future::ready(frame)
    });

    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

async fn snapshot_handler(
    State(state): State<AppState>,
    Path(thread_id): Path<ThreadId>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = auth::check(state.authorizer.as_ref(), &headers, &thread_id) {
        return e.into_response();
    }
    match state.hub.snapshot(&thread_id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("unknown thread {thread_id}")),
    }
}

async fn thread_metrics_handler(
    State(state): State<AppState>,
    Path(thread_id): Path<ThreadId>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = auth::check(state.authorizer.as_ref(), &headers, &thread_id) {
        return e.into_response();
    }
    match state.metrics.execution(&thread_id) {
        Some(metrics) => Json(metrics).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("no metrics for thread {thread_id}")),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LayoutView {
    pub nodes: BTreeMap<NodeId, Position>,
    pub edges: Vec<(NodeId, NodeId)>,
}

async fn layout_handler(
    State(state): State<AppState>,
    Path(thread_id): Path<ThreadId>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = auth::check(state.authorizer.as_ref(), &headers, &thread_id) {
        return e.into_response();
    }
    let Some(snapshot) = state.hub.snapshot(&thread_id) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown thread {thread_id}"));
    };
    let mut graph = ObservedGraph::new();
    graph.merge_snapshot(&snapshot);
    Json(LayoutView {
        nodes: graph.layout(),
        edges: graph.edges.into_iter().collect(),
    })
    .into_response()
}

async fn metrics_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = auth::require_principal(state.authorizer.as_ref(), &headers) {
        return e.into_response();
    }
    Json(state.metrics.snapshot()).into_response()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "threads": state.hub.len(),
        "activeExecutions": state.metrics.active_executions(),
    }))
}
