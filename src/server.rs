//! HTTP and WebSocket surface of the broker.
//!
//! Each upgraded socket gets a reader loop feeding [`Broker::handle_frame`]
//! and a writer task draining the connection's outbound queue. The role is
//! fixed by the route the socket connected to.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, request, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::{middleware, routing, Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::broker::Broker;
use crate::pending::ReplyTo;
use crate::protocol::BrokerToClient;
use crate::rate_limit::{limit_requests, RateLimiter};
use crate::reaper::spawn_reaper;
use crate::registry::{Outbound, OutboundHandle, Role};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

fn allowed_origin(origin: &str) -> bool {
    origin.starts_with("chrome-extension://")
        || origin == "http://localhost"
        || origin.starts_with("http://localhost:")
        || (origin.starts_with("https://") && origin.ends_with(".render.com"))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            |origin: &HeaderValue, _parts: &request::Parts| {
                origin.to_str().is_ok_and(allowed_origin)
            },
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

pub fn router(broker: Broker) -> Router {
    let limiter = RateLimiter::new(
        broker.config().rate_limit_max,
        broker.config().rate_limit_window(),
    );
    let http = Router::new()
        .route("/health", routing::get(health))
        .route("/status", routing::get(status))
        .route("/ws-stats", routing::get(ws_stats))
        .route("/process-clipboard", routing::post(process_clipboard))
        .route_layer(middleware::from_fn_with_state(limiter, limit_requests))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors_layer());
    let sockets = Router::new()
        .route("/", routing::get(client_ws))
        .route("/ws", routing::get(client_ws))
        .route("/worker", routing::get(worker_ws))
        .route("/ollama", routing::get(worker_ws));
    http.merge(sockets).with_state(broker)
}

/// Serve until `shutdown` resolves, running the idle reaper alongside.
pub async fn run<F>(broker: Broker, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let config = broker.config();
    let reaper = spawn_reaper(broker.clone(), config.reap_interval(), config.idle_timeout());
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(target = "clipboard_relay::server", %addr, "broker listening");
    }
    let app = router(broker).into_make_service_with_connect_info::<SocketAddr>();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    reaper.abort();
    result
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn status(State(broker): State<Broker>) -> Json<Value> {
    Json(json!({
        "success": true,
        "status": broker.status(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn ws_stats(State(broker): State<Broker>) -> Json<Value> {
    let clients = broker.client_summaries();
    Json(json!({
        "connectedClients": clients.len(),
        "clients": clients,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct ClipboardBody {
    #[serde(default)]
    content: String,
    #[serde(default)]
    model: Option<String>,
}

fn status_for_code(code: &str) -> StatusCode {
    match code {
        "empty_content" => StatusCode::BAD_REQUEST,
        "no_worker_available" => StatusCode::SERVICE_UNAVAILABLE,
        "request_timeout" => StatusCode::GATEWAY_TIMEOUT,
        "duplicate_request" => StatusCode::CONFLICT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

async fn process_clipboard(
    State(broker): State<Broker>,
    Json(body): Json<ClipboardBody>,
) -> (StatusCode, Json<Value>) {
    let model = body
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| broker.config().default_model.clone());
    let (tx, rx) = oneshot::channel();

    if let Err(err) = broker.dispatch(ReplyTo::Waiter(tx), body.content, model, None) {
        return (
            status_for_code(err.code()),
            Json(json!({
                "success": false,
                "error": err.to_string(),
                "code": err.code(),
                "retryable": err.is_retryable(),
            })),
        );
    }

    match rx.await {
        Ok(BrokerToClient::RequestCompleted {
            content,
            model,
            original_preview,
            ..
        }) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "content": content,
                "model": model,
                "originalPreview": original_preview,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })),
        ),
        Ok(BrokerToClient::RequestFailed {
            message,
            detail,
            code,
            ..
        }) => (
            status_for_code(&code),
            Json(json!({
                "success": false,
                "error": message,
                "details": detail,
                "code": code,
            })),
        ),
        Ok(_) | Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": "internal reply dropped" })),
        ),
    }
}

// ---------------------------------------------------------------------------
// WebSocket handlers
// ---------------------------------------------------------------------------

async fn client_ws(ws: WebSocketUpgrade, State(broker): State<Broker>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, broker, Role::Client))
}

async fn worker_ws(ws: WebSocketUpgrade, State(broker): State<Broker>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, broker, Role::Worker))
}

async fn serve_socket(socket: WebSocket, broker: Broker, role: Role) {
    let (outbound, outbound_rx) = OutboundHandle::channel();
    let id = broker.accept(role, outbound);
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound_rx, broker.config().ping_interval()));

    let reader = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => broker.handle_frame(role, id, text.as_str()),
                Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                    Ok(text) => broker.handle_frame(role, id, text),
                    Err(_) => {
                        tracing::debug!(target = "clipboard_relay::server", connection_id = %id, "ignoring non-utf8 binary frame");
                    }
                },
                // Liveness only; silence is judged on application frames.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => break,
                Err(error) => {
                    tracing::debug!(target = "clipboard_relay::server", connection_id = %id, error = %error, "socket read failed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = &mut writer => {}
    }
    broker.disconnect(role, &id);
    writer.abort();
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ping_period: Duration,
) {
    let mut ping_interval = tokio::time::interval(ping_period);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            next = outbound_rx.recv() => match next {
                Some(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping_interval.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
