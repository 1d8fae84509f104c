//! The worker side: one outbound connection to the broker's worker endpoint,
//! re-established with capped exponential backoff when it drops.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::Url;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::WorkerConfig;
use crate::generation::Generator;
use crate::protocol::{decode_frame, BrokerToWorker, GenerationOptions, WorkerToBroker};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const JITTER_MAX_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    /// Socket open and registration sent, awaiting the broker's ack.
    Registered,
    Active,
    Reconnecting { attempt: u32 },
    Failed,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registered => "registered",
            Self::Active => "active",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Failed => "failed",
        }
    }

    /// Socket open and registration sent.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Registered | Self::Active)
    }

    pub fn reconnect_attempts(self) -> u32 {
        match self {
            Self::Reconnecting { attempt } => attempt,
            _ => 0,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("invalid broker url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } => "invalid_url",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
        }
    }
}

/// Wait before reconnect `attempt` (zero-based): `base * 2^attempt` capped
/// at `cap`, plus up to 250ms of jitter.
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
    let bounded = base_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(cap_ms);
    let jitter = rand::thread_rng().gen_range(0..=JITTER_MAX_MS);
    Duration::from_millis(bounded.saturating_add(jitter))
}

/// Normalize a broker base URL to its worker endpoint.
pub fn build_worker_url(base_url: &str) -> Result<Url, AgentError> {
    let raw = base_url.trim();
    let normalized = if raw.starts_with("wss://") || raw.starts_with("ws://") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{raw}")
    };

    let mut url = Url::parse(&normalized).map_err(|err| AgentError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    let path = url.path().trim_end_matches('/').to_string();
    if path.ends_with("/worker") || path.ends_with("/ollama") {
        url.set_path(&path);
    } else {
        url.set_path(&format!("{path}/worker"));
    }
    Ok(url)
}

enum SessionEnd {
    Shutdown,
    Lost { registered: bool },
}

/// Resolves once shutdown is requested. A dropped sender counts as one.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn send_frame(sink: &mut WsSink, msg: &WorkerToBroker) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(error) => {
            tracing::warn!(target = "clipboard_relay::worker_agent", error = %error, "failed to encode frame");
            false
        }
    }
}

pub struct WorkerAgent {
    config: WorkerConfig,
    worker_id: String,
    capabilities: Vec<String>,
    generator: Arc<dyn Generator>,
    state_tx: watch::Sender<AgentState>,
}

impl WorkerAgent {
    pub fn new(config: WorkerConfig, generator: Arc<dyn Generator>) -> Self {
        let worker_id = config.resolved_worker_id();
        let capabilities = config.model_aliases().into_keys().collect();
        let (state_tx, _) = watch::channel(AgentState::Disconnected);
        Self {
            config,
            worker_id,
            capabilities,
            generator,
            state_tx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> watch::Receiver<AgentState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: AgentState) {
        self.state_tx.send_replace(state);
    }

    /// Connect and serve dispatches until `shutdown` flips to true or the
    /// reconnect budget runs out.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        let url = build_worker_url(&self.config.broker_url)?;
        let base = Duration::from_millis(self.config.reconnect_base_ms);
        let cap = Duration::from_millis(self.config.reconnect_max_ms);
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.session(&url, &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost { registered } => {
                    if registered {
                        failures = 0;
                    }
                }
            }

            if failures >= self.config.max_reconnect_attempts {
                self.set_state(AgentState::Failed);
                return Err(AgentError::ReconnectExhausted { attempts: failures });
            }
            let delay = reconnect_delay(failures, base, cap);
            failures += 1;
            self.set_state(AgentState::Reconnecting { attempt: failures });
            tracing::warn!(
                target = "clipboard_relay::worker_agent",
                attempt = failures,
                max_attempts = self.config.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "broker connection lost, reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        self.set_state(AgentState::Disconnected);
        tracing::info!(target = "clipboard_relay::worker_agent", worker_id = %self.worker_id, "worker agent stopped");
        Ok(())
    }

    async fn session(&self, url: &Url, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        self.set_state(AgentState::Connecting);
        let stream = tokio::select! {
            result = connect_async(url.as_str()) => match result {
                Ok((stream, _)) => stream,
                Err(error) => {
                    tracing::warn!(target = "clipboard_relay::worker_agent", url = %url, error = %error, "connect failed");
                    return SessionEnd::Lost { registered: false };
                }
            },
            _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
        };
        let (mut write, mut read) = stream.split();
        tracing::info!(target = "clipboard_relay::worker_agent", url = %url, worker_id = %self.worker_id, "connected to broker");

        let register = WorkerToBroker::Register {
            worker_id: self.worker_id.clone(),
            capabilities: self.capabilities.clone(),
            default_model: Some(self.config.default_model.clone()),
        };
        if !send_frame(&mut write, &register).await {
            return SessionEnd::Lost { registered: false };
        }
        self.set_state(AgentState::Registered);

        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Dropping the set at session end abandons generations for a broker
        // that has already forgotten them.
        let mut generations: JoinSet<WorkerToBroker> = JoinSet::new();
        let mut registered = false;

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match decode_frame::<BrokerToWorker>(&text) {
                        Ok(BrokerToWorker::RegisterAck { connection_id, .. }) => {
                            registered = true;
                            self.set_state(AgentState::Active);
                            tracing::info!(target = "clipboard_relay::worker_agent", connection_id = %connection_id, "registration acknowledged");
                        }
                        Ok(BrokerToWorker::DispatchRequest { correlation_id, content, model, options }) => {
                            let status = WorkerToBroker::WorkerStatus {
                                correlation_id: correlation_id.clone(),
                                status: "processing".to_string(),
                            };
                            if !send_frame(&mut write, &status).await {
                                return SessionEnd::Lost { registered };
                            }
                            self.spawn_generation(&mut generations, correlation_id, content, model, options);
                        }
                        Ok(BrokerToWorker::HeartbeatAck {}) => {}
                        Ok(BrokerToWorker::Error { message, code }) => {
                            tracing::warn!(target = "clipboard_relay::worker_agent", code = %code, message = %message, "broker rejected a frame");
                        }
                        Err(error) => {
                            tracing::warn!(target = "clipboard_relay::worker_agent", error = %error, "ignoring undecodable broker frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(target = "clipboard_relay::worker_agent", "broker closed the connection");
                        return SessionEnd::Lost { registered };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(target = "clipboard_relay::worker_agent", error = %error, "broker socket error");
                        return SessionEnd::Lost { registered };
                    }
                },
                Some(joined) = generations.join_next() => match joined {
                    Ok(reply) => {
                        if !send_frame(&mut write, &reply).await {
                            return SessionEnd::Lost { registered };
                        }
                    }
                    Err(error) => {
                        tracing::error!(target = "clipboard_relay::worker_agent", error = %error, "generation task failed");
                    }
                },
                _ = heartbeat.tick(), if registered => {
                    if !send_frame(&mut write, &WorkerToBroker::Heartbeat {}).await {
                        return SessionEnd::Lost { registered };
                    }
                }
                _ = shutdown_requested(shutdown) => {
                    let goodbye = WorkerToBroker::Disconnect { worker_id: self.worker_id.clone() };
                    send_frame(&mut write, &goodbye).await;
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    fn spawn_generation(
        &self,
        generations: &mut JoinSet<WorkerToBroker>,
        correlation_id: String,
        content: String,
        model: String,
        options: GenerationOptions,
    ) {
        tracing::info!(target = "clipboard_relay::worker_agent", correlation_id = %correlation_id, model = %model, "generating");
        let generator = self.generator.clone();
        generations.spawn(async move {
            match generator.generate(&model, &content, &options).await {
                Ok(output) => WorkerToBroker::WorkerResult {
                    correlation_id,
                    content: output,
                    model: Some(model),
                },
                Err(error) => {
                    tracing::warn!(target = "clipboard_relay::worker_agent", correlation_id = %correlation_id, error = %error, "generation failed");
                    WorkerToBroker::WorkerError {
                        correlation_id,
                        error: error.to_string(),
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{build_worker_url, reconnect_delay, AgentError, AgentState};

    #[test]
    fn backoff_doubles_and_caps_with_bounded_jitter() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);
        let first = reconnect_delay(0, base, cap).as_millis();
        assert!((1_000..=1_250).contains(&first));
        let third = reconnect_delay(2, base, cap).as_millis();
        assert!((4_000..=4_250).contains(&third));
        for attempt in [5, 9, 40, u32::MAX] {
            let delay = reconnect_delay(attempt, base, cap).as_millis();
            assert!((30_000..=30_250).contains(&delay), "attempt {attempt}: {delay}");
        }
    }

    #[test]
    fn worker_path_is_appended() {
        assert_eq!(
            build_worker_url("ws://localhost:3000").unwrap().as_str(),
            "ws://localhost:3000/worker"
        );
        assert_eq!(
            build_worker_url("https://relay.example.com/").unwrap().as_str(),
            "wss://relay.example.com/worker"
        );
        assert_eq!(
            build_worker_url("http://10.0.0.2:8080/relay").unwrap().as_str(),
            "ws://10.0.0.2:8080/relay/worker"
        );
        assert_eq!(
            build_worker_url("broker.local:3000").unwrap().as_str(),
            "ws://broker.local:3000/worker"
        );
    }

    #[test]
    fn existing_worker_paths_are_kept() {
        assert_eq!(
            build_worker_url("wss://relay.example.com/ollama").unwrap().path(),
            "/ollama"
        );
        assert_eq!(
            build_worker_url("ws://localhost:3000/worker/").unwrap().path(),
            "/worker"
        );
    }

    #[test]
    fn unparseable_url_is_rejected() {
        let err = build_worker_url("ws://").unwrap_err();
        assert!(matches!(err, AgentError::InvalidUrl { .. }));
        assert_eq!(err.code(), "invalid_url");
    }

    #[test]
    fn state_reports_connection_and_attempts() {
        assert!(AgentState::Active.is_connected());
        assert!(AgentState::Registered.is_connected());
        assert!(!AgentState::Connecting.is_connected());
        assert_eq!(AgentState::Reconnecting { attempt: 4 }.reconnect_attempts(), 4);
        assert_eq!(AgentState::Reconnecting { attempt: 4 }.as_str(), "reconnecting");
        assert_eq!(AgentState::Active.reconnect_attempts(), 0);
    }
}
