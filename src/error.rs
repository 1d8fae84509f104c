//! Error types surfaced by the broker to its peers.

use thiserror::Error;

/// Failures the broker reports back to the connection (or HTTP caller) that
/// caused them. Socket-level failures never appear here: those are cleaned
/// up silently.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// A submission arrived with no content.
    #[error("Content is required")]
    EmptyContent,

    /// No registered, open worker could take the request.
    #[error("No worker servers available")]
    NoWorkerAvailable,

    /// The correlation id is already in flight.
    #[error("Request {0} is already in flight")]
    DuplicateRequest(String),

    /// No worker reply arrived before the deadline.
    #[error("Request timeout")]
    RequestTimeout,

    /// The `type` discriminator is not one this endpoint understands.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// The frame was not a JSON object with a valid `type`, or its payload
    /// did not match the declared type.
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// The worker reported a generation failure.
    #[error("AI generation failed: {0}")]
    Generation(String),
}

impl RelayError {
    /// Stable snake_case code carried on the wire next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyContent => "empty_content",
            Self::NoWorkerAvailable => "no_worker_available",
            Self::DuplicateRequest(_) => "duplicate_request",
            Self::RequestTimeout => "request_timeout",
            Self::UnknownMessageType(_) => "unknown_message_type",
            Self::InvalidMessage(_) => "invalid_message",
            Self::Generation(_) => "generation_failed",
        }
    }

    /// Whether the caller may reasonably resubmit the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoWorkerAvailable | Self::RequestTimeout | Self::Generation(_)
        )
    }
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, RelayError>;
