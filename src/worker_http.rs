//! Local HTTP API of the worker: health, status, installed models and a
//! direct generation endpoint for testing a box without a broker.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::{middleware, routing, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::broker::content_preview;
use crate::generation::Generator;
use crate::ollama::OllamaGenerator;
use crate::protocol::{GenerationOptions, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use crate::rate_limit::{limit_requests, RateLimiter};
use crate::server::MAX_BODY_BYTES;
use crate::worker_agent::WorkerAgent;

const DEFAULT_CLIENT_MODEL: &str = "qwen-coder";

#[derive(Clone)]
pub struct WorkerSurface {
    agent: Arc<WorkerAgent>,
    ollama: Arc<OllamaGenerator>,
}

impl WorkerSurface {
    pub fn new(agent: Arc<WorkerAgent>, ollama: Arc<OllamaGenerator>) -> Self {
        Self { agent, ollama }
    }

    fn broker_link(&self) -> &'static str {
        if self.agent.state().borrow().is_connected() {
            "connected"
        } else {
            "disconnected"
        }
    }
}

pub fn router(surface: WorkerSurface) -> Router {
    let config = surface.agent.config();
    let limiter = RateLimiter::new(config.rate_limit_max, config.rate_limit_window());
    Router::new()
        .route("/health", routing::get(health))
        .route("/status", routing::get(status))
        .route("/models", routing::get(models))
        .route("/generate", routing::post(generate))
        .route_layer(middleware::from_fn_with_state(limiter, limit_requests))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(surface)
}

pub async fn run<F>(surface: WorkerSurface, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(target = "clipboard_relay::worker_http", %addr, "worker api listening");
    }
    let app = router(surface).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health(State(surface): State<WorkerSurface>) -> (StatusCode, Json<Value>) {
    let worker_id = surface.agent.worker_id();
    let broker = surface.broker_link();
    match surface.ollama.list_models().await {
        Ok(installed) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "ollama": "connected",
                "broker": broker,
                "availableModels": surface.ollama.capabilities(),
                "installedModels": installed,
                "workerId": worker_id,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })),
        ),
        Err(error) => {
            tracing::warn!(target = "clipboard_relay::worker_http", error = %error, "ollama health probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "ollama": "disconnected",
                    "broker": broker,
                    "error": error.to_string(),
                    "workerId": worker_id,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                })),
            )
        }
    }
}

async fn status(State(surface): State<WorkerSurface>) -> Json<Value> {
    let state = *surface.agent.state().borrow();
    Json(json!({
        "workerId": surface.agent.worker_id(),
        "broker": surface.broker_link(),
        "brokerUrl": surface.agent.config().broker_url,
        "state": state.as_str(),
        "reconnectAttempts": state.reconnect_attempts(),
        "availableModels": surface.ollama.capabilities(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn models(State(surface): State<WorkerSurface>) -> (StatusCode, Json<Value>) {
    match surface.ollama.installed_models().await {
        Ok(installed) => {
            let installed: Vec<Value> = installed
                .into_iter()
                .map(|model| {
                    json!({
                        "name": model.name,
                        "size": model.size,
                        "modified": model.modified_at,
                    })
                })
                .collect();
            (
                StatusCode::OK,
                Json(json!({
                    "availableModels": surface.ollama.aliases(),
                    "installedModels": installed,
                    "defaultModel": surface.ollama.default_model(),
                    "broker": surface.broker_link(),
                })),
            )
        }
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Failed to fetch models",
                "message": error.to_string(),
            })),
        ),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateBody {
    #[serde(default)]
    content: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
}

async fn generate(
    State(surface): State<WorkerSurface>,
    Json(body): Json<GenerateBody>,
) -> (StatusCode, Json<Value>) {
    if body.content.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Content is required" })),
        );
    }

    let model = body
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CLIENT_MODEL.to_string());
    let options = GenerationOptions {
        temperature: body.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        max_tokens: body.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    };

    match surface.ollama.generate(&model, &body.content, &options).await {
        Ok(code) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "code": code,
                "model": model,
                "ollamaModel": surface.ollama.resolve_model(&model),
                "originalPreview": content_preview(&body.content),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })),
        ),
        Err(error) => {
            tracing::warn!(target = "clipboard_relay::worker_http", model = %model, error = %error, "direct generation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": "Code generation failed",
                    "message": error.to_string(),
                    "errorCode": error.code(),
                })),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use clap::Parser;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use serde_json::{json, Value};
    use tokio::sync::watch;
    use tower::ServiceExt;

    use super::{router, WorkerSurface};
    use crate::config::WorkerConfig;
    use crate::ollama::OllamaGenerator;
    use crate::worker_agent::{AgentState, WorkerAgent};

    fn surface(server: &MockServer, extra: &[&str]) -> WorkerSurface {
        let mut args = vec![
            "worker".to_string(),
            "--worker-id".to_string(),
            "w-local".to_string(),
            "--ollama-url".to_string(),
            server.base_url(),
        ];
        args.extend(extra.iter().map(|arg| arg.to_string()));
        let config = WorkerConfig::parse_from(args);
        let ollama = Arc::new(OllamaGenerator::from_config(&config).unwrap());
        let agent = Arc::new(WorkerAgent::new(config, ollama.clone()));
        WorkerSurface::new(agent, ollama)
    }

    fn mock_tags(server: &MockServer) {
        server.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200).json_body(json!({"models": [
                {"name": "qwen3:latest", "size": 5_000_000_000u64, "modified_at": "2025-01-01T00:00:00Z"}
            ]}));
        });
    }

    async fn call(surface: WorkerSurface, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(surface)
            .oneshot(request)
            .await
            .expect("request should succeed");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        (status, serde_json::from_slice(&body).expect("response body should be json"))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request should build")
    }

    fn post_generate(body: Value) -> Request<Body> {
        Request::builder()
            .uri("/generate")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build")
    }

    #[tokio::test]
    async fn health_lists_installed_models() {
        let server = MockServer::start();
        mock_tags(&server);
        let (status, body) = call(surface(&server, &[]), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["installedModels"], json!(["qwen3:latest"]));
        assert_eq!(body["broker"], "disconnected");
        assert_eq!(body["workerId"], "w-local");
        assert_eq!(body["availableModels"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn health_is_unavailable_when_ollama_is_down() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(500);
        });
        let (status, body) = call(surface(&server, &[]), get("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["ollama"], "disconnected");
    }

    #[tokio::test]
    async fn status_tracks_reconnect_attempts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let server = MockServer::start();
        let broker_url = format!("ws://{addr}");
        let surface = surface(
            &server,
            &["--broker-url", broker_url.as_str(), "--reconnect-base-ms", "60000"],
        );
        let (stop, stopped) = watch::channel(false);
        let agent = surface.agent.clone();
        let runner = tokio::spawn(async move { agent.run(stopped).await });

        let mut state = surface.agent.state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| matches!(s, AgentState::Reconnecting { .. })),
        )
        .await
        .expect("agent starts reconnecting")
        .expect("agent state channel open");

        let (status, body) = call(surface, get("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "reconnecting");
        assert_eq!(body["reconnectAttempts"], 1);
        assert_eq!(body["broker"], "disconnected");
        assert_eq!(body["brokerUrl"], broker_url);

        stop.send(true).unwrap();
        assert_eq!(runner.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn models_reports_aliases_and_installed_details() {
        let server = MockServer::start();
        mock_tags(&server);
        let (status, body) = call(surface(&server, &[]), get("/models")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["availableModels"]["codellama"], "llama3.1:8b");
        assert_eq!(body["installedModels"][0]["name"], "qwen3:latest");
        assert_eq!(body["installedModels"][0]["modified"], "2025-01-01T00:00:00Z");
        assert_eq!(body["defaultModel"], "qwen3:latest");
    }

    #[tokio::test]
    async fn generate_runs_the_backend_directly() {
        let server = MockServer::start();
        mock_tags(&server);
        let backend = server.mock(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body_partial(r#"{"model":"qwen3:latest","options":{"num_predict":64}}"#);
            then.status(200)
                .json_body(json!({"response": "```python\nprint('hi')\n```"}));
        });

        let (status, body) = call(
            surface(&server, &[]),
            post_generate(json!({"content": "print hi", "maxTokens": 64})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["code"], "print('hi')");
        assert_eq!(body["model"], "qwen-coder");
        assert_eq!(body["ollamaModel"], "qwen3:latest");
        backend.assert_hits(1);
    }

    #[tokio::test]
    async fn generate_requires_content() {
        let server = MockServer::start();
        let (status, body) = call(surface(&server, &[]), post_generate(json!({"content": " "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Content is required");
    }

    #[tokio::test]
    async fn generate_failure_is_a_server_error() {
        let server = MockServer::start();
        mock_tags(&server);
        server.mock(|when, then| {
            when.method(POST).path("/api/generate");
            then.status(500).body("out of memory");
        });
        let (status, body) = call(surface(&server, &[]), post_generate(json!({"content": "x"}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Code generation failed");
        assert!(body["message"].as_str().unwrap().contains("out of memory"));
    }
}
