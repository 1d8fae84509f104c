use std::collections::BTreeMap;
use std::time::Duration;

use clap::Parser;

use crate::protocol::{GenerationOptions, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use crate::selector::SelectionPolicy;

#[derive(Debug, Parser, Clone)]
#[command(name = "broker")]
#[command(about = "Relay client requests to connected generation workers")]
pub struct BrokerConfig {
    #[arg(long, env = "BROKER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Seconds a dispatched request waits for its worker reply.
    #[arg(long, default_value_t = 60)]
    pub request_timeout_secs: u64,

    #[arg(long, default_value_t = 60)]
    pub reap_interval_secs: u64,

    /// Connections silent for longer than this are closed.
    #[arg(long, default_value_t = 300)]
    pub idle_timeout_secs: u64,

    /// Transport pings sent on every socket; they never count as activity.
    #[arg(long, default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Model used when neither the request nor the client names one.
    #[arg(long, default_value = "qwen-coder")]
    pub default_model: String,

    #[arg(long, value_enum, default_value_t = SelectionPolicy::FirstAvailable)]
    pub selection: SelectionPolicy,

    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,

    /// HTTP requests allowed per client IP in each rate-limit window.
    #[arg(long, default_value_t = 100)]
    pub rate_limit_max: u32,

    #[arg(long, default_value_t = 900)]
    pub rate_limit_window_secs: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl BrokerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs.max(1))
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::parse_from(["broker"])
    }
}

const DEFAULT_MODEL_ALIASES: &str =
    "qwen-coder=qwen3:latest,codellama=llama3.1:8b,deepseek-coder=llama3.1:8b,codegemma=llama3.1:8b";

#[derive(Debug, Parser, Clone)]
#[command(name = "worker")]
#[command(about = "Connect a local Ollama instance to the broker as a worker")]
pub struct WorkerConfig {
    /// Broker base URL; `/worker` is appended when no worker path is given.
    #[arg(long, env = "BROKER_URL", default_value = "ws://localhost:3000")]
    pub broker_url: String,

    /// Stable identifier reused across reconnects. Generated when absent.
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    pub ollama_url: String,

    /// Backend model used for aliases the table does not know.
    #[arg(long, env = "DEFAULT_MODEL", default_value = "qwen3:latest")]
    pub default_model: String,

    /// Comma-separated `alias=backend-model` pairs advertised as capabilities.
    #[arg(long, default_value = DEFAULT_MODEL_ALIASES)]
    pub models: String,

    #[arg(long, default_value_t = 30)]
    pub heartbeat_secs: u64,

    #[arg(long, default_value_t = 10)]
    pub max_reconnect_attempts: u32,

    #[arg(long, default_value_t = 1_000)]
    pub reconnect_base_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub reconnect_max_ms: u64,

    #[arg(long, default_value_t = 60)]
    pub generation_timeout_secs: u64,

    /// Address of the local HTTP API (health, status, models, generate).
    #[arg(long, default_value = "127.0.0.1")]
    pub http_host: String,

    #[arg(long, env = "WORKER_HTTP_PORT", default_value_t = 11435)]
    pub http_port: u16,

    #[arg(long, default_value_t = 50)]
    pub rate_limit_max: u32,

    #[arg(long, default_value_t = 900)]
    pub rate_limit_window_secs: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl WorkerConfig {
    /// Parsed alias table. Malformed pairs are skipped.
    pub fn model_aliases(&self) -> BTreeMap<String, String> {
        self.models
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(alias, model)| (alias.trim().to_string(), model.trim().to_string()))
            .filter(|(alias, model)| !alias.is_empty() && !model.is_empty())
            .collect()
    }

    pub fn resolved_worker_id(&self) -> String {
        self.worker_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(generate_worker_id)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs.max(1))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::parse_from(["worker"])
    }
}

fn generate_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}
