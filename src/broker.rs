//! The broker's per-connection protocol handling.
//!
//! Every inbound frame is handled synchronously: registry and pending-table
//! updates plus queueing frames on outbound channels. Nothing here awaits.
//! A worker's reply is delivered to its client from the handler invocation
//! for the worker's frame, not from the one that dispatched the request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::{RelayError, Result};
use crate::pending::{PendingEntry, PendingRequest, PendingRequests, ReplyTo};
use crate::protocol::{
    decode_frame, BrokerToClient, BrokerToWorker, ClientToBroker, GenerationOptions,
    WorkerToBroker,
};
use crate::registry::{
    Capabilities, ConnectionId, ConnectionRecord, ConnectionRegistry, ConnectionState,
    OutboundHandle, Role,
};
use crate::selector::{is_eligible, WorkerSelector};

const PREVIEW_CHARS: usize = 100;
/// Selections tried per request when the chosen worker's queue is closed.
const DISPATCH_ATTEMPTS: usize = 2;

/// First 100 characters of a submission, with `...` when truncated.
pub fn content_preview(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[derive(Clone)]
pub struct Broker {
    clients: ConnectionRegistry,
    workers: ConnectionRegistry,
    pending: PendingRequests,
    selector: Arc<dyn WorkerSelector>,
    config: Arc<BrokerConfig>,
    started_at: Instant,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let selector: Arc<dyn WorkerSelector> = Arc::from(config.selection.build());
        Self::with_selector(config, selector)
    }

    pub fn with_selector(config: BrokerConfig, selector: Arc<dyn WorkerSelector>) -> Self {
        Self {
            clients: ConnectionRegistry::new(Role::Client),
            workers: ConnectionRegistry::new(Role::Worker),
            pending: PendingRequests::new(),
            selector,
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn clients(&self) -> &ConnectionRegistry {
        &self.clients
    }

    pub fn workers(&self) -> &ConnectionRegistry {
        &self.workers
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    fn registry(&self, role: Role) -> &ConnectionRegistry {
        match role {
            Role::Client => &self.clients,
            Role::Worker => &self.workers,
        }
    }

    /// Workers that could take a request right now.
    pub fn worker_pool_size(&self) -> usize {
        self.workers.list().iter().filter(|r| is_eligible(r)).count()
    }

    /// Register a freshly upgraded socket. The role comes from the endpoint
    /// it connected to and never changes.
    pub fn accept(&self, role: Role, outbound: OutboundHandle) -> ConnectionId {
        let id = self.registry(role).register(outbound, None);
        tracing::info!(
            target = "clipboard_relay::broker",
            connection_id = %id,
            role = %role,
            clients = self.clients.len(),
            workers = self.workers.len(),
            "connection accepted"
        );
        id
    }

    /// Socket closed, errored, or was evicted. Safe to call more than once.
    pub fn disconnect(&self, role: Role, id: &ConnectionId) -> Option<ConnectionRecord> {
        let record = self.registry(role).remove(id)?;
        if role == Role::Worker {
            let orphaned = self.pending.dispatched_to(id).len();
            if orphaned > 0 {
                tracing::warn!(
                    target = "clipboard_relay::broker",
                    connection_id = %id,
                    orphaned,
                    "worker closed with requests in flight; they will time out"
                );
            }
        }
        tracing::info!(
            target = "clipboard_relay::broker",
            connection_id = %id,
            role = %role,
            clients = self.clients.len(),
            workers = self.workers.len(),
            "connection closed"
        );
        Some(record)
    }

    /// Interpret one text frame from `id`. Frames from one connection must
    /// be fed in arrival order.
    pub fn handle_frame(&self, role: Role, id: ConnectionId, text: &str) {
        self.registry(role).touch(&id);
        match role {
            Role::Client => match decode_frame::<ClientToBroker>(text) {
                Ok(msg) => self.handle_client(id, msg),
                Err(err) => {
                    tracing::debug!(target = "clipboard_relay::broker", connection_id = %id, error = %err, "rejected client frame");
                    self.clients.send(&id, &BrokerToClient::error(&err));
                }
            },
            Role::Worker => match decode_frame::<WorkerToBroker>(text) {
                Ok(msg) => self.handle_worker(id, msg),
                Err(err) => {
                    tracing::debug!(target = "clipboard_relay::broker", connection_id = %id, error = %err, "rejected worker frame");
                    self.workers.send(
                        &id,
                        &BrokerToWorker::Error {
                            message: err.to_string(),
                            code: err.code().to_string(),
                        },
                    );
                }
            },
        }
    }

    fn handle_client(&self, id: ConnectionId, msg: ClientToBroker) {
        // Clients need no registration: any frame activates them.
        self.clients.set_state(&id, ConnectionState::Active);

        match msg {
            ClientToBroker::Connect { model } => {
                if let Some(model) = model.filter(|m| !m.trim().is_empty()) {
                    self.clients.bind_model(&id, model);
                }
                let bound = self.clients.get(&id).and_then(|r| r.bound_model);
                self.clients.send(
                    &id,
                    &BrokerToClient::ConnectionAck {
                        client_id: id.to_string(),
                        worker_pool_size: self.worker_pool_size(),
                        model: bound,
                    },
                );
            }
            ClientToBroker::SubmitRequest {
                content,
                model,
                request_id,
            } => self.handle_submit(id, content, model, request_id),
            ClientToBroker::Heartbeat {} => {
                self.clients.send(&id, &BrokerToClient::HeartbeatAck {});
            }
        }
    }

    fn handle_submit(
        &self,
        client: ConnectionId,
        content: String,
        model: Option<String>,
        request_id: Option<String>,
    ) {
        if content.trim().is_empty() {
            self.clients
                .send(&client, &BrokerToClient::error(&RelayError::EmptyContent));
            return;
        }

        self.clients.send(
            &client,
            &BrokerToClient::ProcessingStarted {
                request_id: request_id.clone(),
            },
        );

        let model = self.resolve_model(&client, model);
        tracing::info!(
            target = "clipboard_relay::broker",
            client_id = %client,
            model = %model,
            "processing submission"
        );
        if let Err(err) = self.dispatch(
            ReplyTo::Connection(client),
            content,
            model,
            request_id.clone(),
        ) {
            tracing::info!(target = "clipboard_relay::broker", client_id = %client, error = %err, "submission not dispatched");
            self.clients
                .send(&client, &BrokerToClient::request_failed(request_id, &err));
        }
    }

    fn resolve_model(&self, client: &ConnectionId, requested: Option<String>) -> String {
        requested
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.clients.get(client).and_then(|r| r.bound_model))
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    /// Pick a worker, claim a pending entry and forward the request. On
    /// success the terminal reply is later delivered to `reply_to`; on error
    /// nothing was enqueued and the caller reports the failure.
    pub fn dispatch(
        &self,
        reply_to: ReplyTo,
        content: String,
        model: String,
        client_request_id: Option<String>,
    ) -> Result<String> {
        if content.trim().is_empty() {
            return Err(RelayError::EmptyContent);
        }

        let correlation_id = match (&reply_to, &client_request_id) {
            (ReplyTo::Connection(client), Some(request_id)) => format!("{client}:{request_id}"),
            _ => Uuid::new_v4().to_string(),
        };

        let mut reply_to = reply_to;
        let mut excluded: Option<ConnectionId> = None;
        for _ in 0..DISPATCH_ATTEMPTS {
            let snapshot: Vec<ConnectionRecord> = self
                .workers
                .list()
                .into_iter()
                .filter(|record| Some(record.id) != excluded)
                .collect();
            let Some(worker_id) = self.selector.select(&snapshot, Some(&model)) else {
                break;
            };

            let broker = self.clone();
            self.pending.claim(
                PendingRequest {
                    correlation_id: correlation_id.clone(),
                    reply_to,
                    worker_id,
                    client_request_id: client_request_id.clone(),
                    model: model.clone(),
                    preview: content_preview(&content),
                },
                self.config.request_timeout(),
                move |entry| broker.expire(entry),
            )?;
            self.workers.adjust_in_flight(&worker_id, 1);

            let forwarded = self.workers.send(
                &worker_id,
                &BrokerToWorker::DispatchRequest {
                    correlation_id: correlation_id.clone(),
                    content: content.clone(),
                    model: model.clone(),
                    options: self.generation_options(),
                },
            );
            if forwarded {
                tracing::debug!(
                    target = "clipboard_relay::broker",
                    correlation_id = %correlation_id,
                    worker = %worker_id,
                    "dispatched request"
                );
                return Ok(correlation_id);
            }

            // The worker vanished between selection and send.
            let Some(entry) = self.pending.resolve(&correlation_id) else {
                return Err(RelayError::NoWorkerAvailable);
            };
            self.workers.adjust_in_flight(&worker_id, -1);
            tracing::warn!(
                target = "clipboard_relay::broker",
                correlation_id = %correlation_id,
                worker = %worker_id,
                "selected worker is gone, selecting again"
            );
            reply_to = entry.reply_to;
            excluded = Some(worker_id);
        }
        Err(RelayError::NoWorkerAvailable)
    }

    fn generation_options(&self) -> GenerationOptions {
        self.config.generation_options()
    }

    fn handle_worker(&self, id: ConnectionId, msg: WorkerToBroker) {
        match msg {
            WorkerToBroker::Register {
                worker_id,
                capabilities,
                default_model,
            } => {
                let worker_id = if worker_id.trim().is_empty() {
                    id.to_string()
                } else {
                    worker_id
                };
                tracing::info!(
                    target = "clipboard_relay::broker",
                    connection_id = %id,
                    worker_id = %worker_id,
                    models = ?capabilities,
                    "worker registered"
                );
                self.workers.set_capabilities(
                    &id,
                    Capabilities {
                        worker_id: worker_id.clone(),
                        models: capabilities,
                        default_model,
                    },
                );
                self.workers.set_state(&id, ConnectionState::Registered);
                // Selectable before the worker hears back.
                self.workers.set_state(&id, ConnectionState::Active);
                self.workers.send(
                    &id,
                    &BrokerToWorker::RegisterAck {
                        worker_id,
                        connection_id: id.to_string(),
                    },
                );
            }
            WorkerToBroker::WorkerResult {
                correlation_id,
                content,
                model,
            } => {
                let Some(entry) = self.pending.resolve(&correlation_id) else {
                    tracing::debug!(target = "clipboard_relay::broker", correlation_id = %correlation_id, "discarding late or duplicate worker result");
                    return;
                };
                let reply = BrokerToClient::RequestCompleted {
                    request_id: entry.client_request_id.clone(),
                    content,
                    model: model
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or_else(|| entry.model.clone()),
                    original_preview: entry.preview.clone(),
                };
                self.deliver(entry, reply);
            }
            WorkerToBroker::WorkerError {
                correlation_id,
                error,
            } => {
                let Some(entry) = self.pending.resolve(&correlation_id) else {
                    tracing::debug!(target = "clipboard_relay::broker", correlation_id = %correlation_id, "discarding late or duplicate worker error");
                    return;
                };
                tracing::warn!(target = "clipboard_relay::broker", correlation_id = %correlation_id, error = %error, "worker reported generation failure");
                let reply = BrokerToClient::request_failed(
                    entry.client_request_id.clone(),
                    &RelayError::Generation(error),
                );
                self.deliver(entry, reply);
            }
            WorkerToBroker::WorkerStatus {
                correlation_id,
                status,
            } => {
                tracing::debug!(target = "clipboard_relay::broker", correlation_id = %correlation_id, status = %status, "worker status");
            }
            WorkerToBroker::Disconnect { worker_id } => {
                tracing::info!(target = "clipboard_relay::broker", connection_id = %id, worker_id = %worker_id, "worker draining");
                self.workers.mark_draining(&id);
            }
            WorkerToBroker::Heartbeat {} => {
                self.workers.send(&id, &BrokerToWorker::HeartbeatAck {});
            }
        }
    }

    fn expire(&self, entry: PendingEntry) {
        tracing::warn!(
            target = "clipboard_relay::broker",
            correlation_id = %entry.correlation_id,
            worker = %entry.worker_id,
            "request timed out waiting for worker"
        );
        let reply =
            BrokerToClient::request_failed(entry.client_request_id.clone(), &RelayError::RequestTimeout);
        self.deliver(entry, reply);
    }

    fn deliver(&self, entry: PendingEntry, reply: BrokerToClient) {
        self.workers.adjust_in_flight(&entry.worker_id, -1);
        let correlation_id = entry.correlation_id;
        match entry.reply_to {
            ReplyTo::Connection(client) => {
                if !self.clients.send(&client, &reply) {
                    tracing::debug!(target = "clipboard_relay::broker", correlation_id = %correlation_id, client_id = %client, "originating client gone; dropping reply");
                }
            }
            ReplyTo::Waiter(waiter) => {
                if waiter.send(reply).is_err() {
                    tracing::debug!(target = "clipboard_relay::broker", correlation_id = %correlation_id, "http caller went away; dropping reply");
                }
            }
        }
    }

    /// Close and forget every connection idle for longer than `threshold`.
    /// Eviction goes through the same path as a peer-initiated close.
    pub fn evict_idle(&self, threshold: Duration, now: Instant) -> Vec<ConnectionId> {
        let mut evicted = Vec::new();
        for role in [Role::Client, Role::Worker] {
            for id in self.registry(role).idle_since(threshold, now) {
                if let Some(record) = self.disconnect(role, &id) {
                    tracing::info!(target = "clipboard_relay::broker", connection_id = %id, role = %role, "closing inactive connection");
                    record.outbound.close();
                    evicted.push(id);
                }
            }
        }
        evicted
    }

    pub fn status(&self) -> BrokerStatus {
        let now = Instant::now();
        let workers = self.workers.list();
        BrokerStatus {
            clients: self.clients.len(),
            workers: workers.len(),
            workers_available: workers.iter().filter(|r| is_eligible(r)).count(),
            pending_requests: self.pending.len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            worker_details: workers
                .iter()
                .map(|record| WorkerSummary::from_record(record, now))
                .collect(),
        }
    }

    pub fn client_summaries(&self) -> Vec<ClientSummary> {
        let now = Instant::now();
        self.clients
            .list()
            .iter()
            .map(|record| ClientSummary {
                id: record.id.to_string(),
                connected_at: record.connected_at,
                last_activity_secs: record.idle_for(now).as_secs(),
                model: record.bound_model.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    pub clients: usize,
    pub workers: usize,
    pub workers_available: usize,
    pub pending_requests: usize,
    pub uptime_secs: u64,
    pub worker_details: Vec<WorkerSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub connection_id: String,
    pub worker_id: Option<String>,
    pub capabilities: Vec<String>,
    pub default_model: Option<String>,
    pub state: ConnectionState,
    pub draining: bool,
    pub in_flight: usize,
    pub connected_at: DateTime<Utc>,
    pub last_activity_secs: u64,
}

impl WorkerSummary {
    fn from_record(record: &ConnectionRecord, now: Instant) -> Self {
        let caps = record.capabilities.clone().unwrap_or_default();
        Self {
            connection_id: record.id.to_string(),
            worker_id: record.capabilities.as_ref().map(|c| c.worker_id.clone()),
            capabilities: caps.models,
            default_model: caps.default_model,
            state: record.state,
            draining: record.draining,
            in_flight: record.in_flight,
            connected_at: record.connected_at,
            last_activity_secs: record.idle_for(now).as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity_secs: u64,
    pub model: Option<String>,
}
