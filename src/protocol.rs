//! Wire messages exchanged over the client and worker WebSocket endpoints.
//!
//! Every frame is a JSON object tagged by `"type"`. Type names are snake_case
//! and payload fields camelCase; both are load-bearing for interop with the
//! browser extension and deployed workers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

pub const DEFAULT_TEMPERATURE: f32 = 0.3;
pub const DEFAULT_MAX_TOKENS: u32 = 2000;

/// Sampling options forwarded from the broker to the generation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub temperature: f32,
    #[serde(rename = "maxTokens", alias = "max_tokens")]
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToBroker {
    Connect {
        #[serde(default)]
        model: Option<String>,
    },
    SubmitRequest {
        #[serde(default)]
        content: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(rename = "requestId", default)]
        request_id: Option<String>,
    },
    Heartbeat {},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerToClient {
    ConnectionAck {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "workerPoolSize")]
        worker_pool_size: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    ProcessingStarted {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    RequestCompleted {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        content: String,
        model: String,
        #[serde(rename = "originalPreview")]
        original_preview: String,
    },
    RequestFailed {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
        detail: String,
        code: String,
    },
    Error {
        message: String,
        code: String,
    },
    HeartbeatAck {},
}

impl BrokerToClient {
    /// `error` frame for a failure local to the offending connection.
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }

    /// Terminal failure for a submitted request.
    pub fn request_failed(request_id: Option<String>, err: &RelayError) -> Self {
        let (message, detail) = match err {
            RelayError::Generation(detail) => {
                ("AI generation failed".to_string(), detail.clone())
            }
            other => ("Failed to generate AI code".to_string(), other.to_string()),
        };
        Self::RequestFailed {
            request_id,
            message,
            detail,
            code: err.code().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerToBroker {
    Register {
        #[serde(rename = "workerId", default)]
        worker_id: String,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(rename = "defaultModel", default)]
        default_model: Option<String>,
    },
    WorkerResult {
        #[serde(rename = "correlationId")]
        correlation_id: String,
        content: String,
        #[serde(default)]
        model: Option<String>,
    },
    WorkerError {
        #[serde(rename = "correlationId")]
        correlation_id: String,
        error: String,
    },
    WorkerStatus {
        #[serde(rename = "correlationId")]
        correlation_id: String,
        status: String,
    },
    Disconnect {
        #[serde(rename = "workerId", default)]
        worker_id: String,
    },
    Heartbeat {},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerToWorker {
    RegisterAck {
        #[serde(rename = "workerId")]
        worker_id: String,
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    DispatchRequest {
        #[serde(rename = "correlationId")]
        correlation_id: String,
        content: String,
        model: String,
        #[serde(default)]
        options: GenerationOptions,
    },
    HeartbeatAck {},
    Error {
        message: String,
        code: String,
    },
}

/// Inbound message families, with every `type` value they accept.
pub trait Inbound: DeserializeOwned {
    const TYPES: &'static [&'static str];
}

impl Inbound for ClientToBroker {
    const TYPES: &'static [&'static str] = &["connect", "submit_request", "heartbeat"];
}

impl Inbound for WorkerToBroker {
    const TYPES: &'static [&'static str] = &[
        "register",
        "worker_result",
        "worker_error",
        "worker_status",
        "disconnect",
        "heartbeat",
    ];
}

impl Inbound for BrokerToWorker {
    const TYPES: &'static [&'static str] =
        &["register_ack", "dispatch_request", "heartbeat_ack", "error"];
}

/// Parse one text frame, separating an unknown `type` from a malformed one.
pub fn decode_frame<T: Inbound>(text: &str) -> Result<T, RelayError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| RelayError::InvalidMessage(err.to_string()))?;
    let msg_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::InvalidMessage("missing \"type\" field".to_string()))?;
    if !T::TYPES.contains(&msg_type) {
        return Err(RelayError::UnknownMessageType(msg_type.to_string()));
    }
    serde_json::from_value(value).map_err(|err| RelayError::InvalidMessage(err.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn submit_request_uses_wire_field_names() {
        let msg: ClientToBroker = decode_frame(
            r#"{"type":"submit_request","content":"x = 1","model":"qwen-coder","requestId":"r-7"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientToBroker::SubmitRequest {
                content: "x = 1".into(),
                model: Some("qwen-coder".into()),
                request_id: Some("r-7".into()),
            }
        );
    }

    #[test]
    fn missing_content_decodes_as_empty() {
        let msg: ClientToBroker = decode_frame(r#"{"type":"submit_request"}"#).unwrap();
        assert!(matches!(msg, ClientToBroker::SubmitRequest { content, .. } if content.is_empty()));
    }

    #[test]
    fn heartbeat_ignores_extra_fields() {
        let msg: WorkerToBroker = decode_frame(r#"{"type":"heartbeat","timestamp":1}"#).unwrap();
        assert_eq!(msg, WorkerToBroker::Heartbeat {});
    }

    #[test]
    fn unknown_type_is_distinguished_from_malformed() {
        let err = decode_frame::<ClientToBroker>(r#"{"type":"launch_rockets"}"#).unwrap_err();
        assert_eq!(err, RelayError::UnknownMessageType("launch_rockets".into()));

        let err = decode_frame::<ClientToBroker>("not json").unwrap_err();
        assert_eq!(err.code(), "invalid_message");

        let err = decode_frame::<ClientToBroker>(r#"{"content":"no type"}"#).unwrap_err();
        assert_eq!(err.code(), "invalid_message");
    }

    #[test]
    fn register_decodes_camel_case_fields() {
        let msg: WorkerToBroker = decode_frame(
            r#"{"type":"register","workerId":"gpu-1","capabilities":["qwen-coder"],"defaultModel":"qwen3:latest"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            WorkerToBroker::Register {
                worker_id: "gpu-1".into(),
                capabilities: vec!["qwen-coder".into()],
                default_model: Some("qwen3:latest".into()),
            }
        );
    }

    #[test]
    fn retired_type_names_are_unknown() {
        for legacy in ["ping", "connection", "process_clipboard"] {
            let frame = format!(r#"{{"type":"{legacy}"}}"#);
            let err = decode_frame::<ClientToBroker>(&frame).unwrap_err();
            assert_eq!(err, RelayError::UnknownMessageType(legacy.into()));
        }
        for legacy in ["ollama_server_register", "generation_complete", "generation_error"] {
            let frame = format!(r#"{{"type":"{legacy}","requestId":"r1"}}"#);
            let err = decode_frame::<WorkerToBroker>(&frame).unwrap_err();
            assert_eq!(err, RelayError::UnknownMessageType(legacy.into()));
        }
    }

    #[test]
    fn dispatch_request_serializes_camel_case_options() {
        let msg = BrokerToWorker::DispatchRequest {
            correlation_id: "c1".into(),
            content: "fn main() {}".into(),
            model: "qwen-coder".into(),
            options: GenerationOptions::default(),
        };
        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "dispatch_request");
        assert_eq!(value["correlationId"], "c1");
        assert_eq!(value["options"]["maxTokens"], 2000);
        let temperature = value["options"]["temperature"].as_f64().unwrap();
        assert!((temperature - 0.3).abs() < 1e-6);
    }

    #[test]
    fn options_accept_snake_case_max_tokens() {
        let opts: GenerationOptions =
            serde_json::from_value(json!({"temperature": 0.7, "max_tokens": 512})).unwrap();
        assert_eq!(opts.max_tokens, 512);
    }

    #[test]
    fn empty_variants_serialize_as_bare_type() {
        let value = serde_json::to_value(BrokerToClient::HeartbeatAck {}).unwrap();
        assert_eq!(value, json!({"type": "heartbeat_ack"}));
        let value = serde_json::to_value(BrokerToClient::ProcessingStarted { request_id: None })
            .unwrap();
        assert_eq!(value, json!({"type": "processing_started"}));
    }

    #[test]
    fn request_failed_carries_generation_detail() {
        let msg = BrokerToClient::request_failed(
            Some("r1".into()),
            &RelayError::Generation("model exploded".into()),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "request_failed");
        assert_eq!(value["detail"], "model exploded");
        assert_eq!(value["code"], "generation_failed");
    }
}
