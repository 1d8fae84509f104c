//! The seam between a worker agent and whatever produces its output.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::GenerationOptions;

/// Failures of a single generation. The Display text is what the broker
/// relays to the client as the failure detail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("model {model} is unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },

    #[error("generation timed out after {}s", .0.as_secs())]
    GenerationTimeout(Duration),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("no response from model")]
    EmptyResponse,
}

impl GenerationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::GenerationTimeout(_) => "generation_timeout",
            Self::Backend(_) => "backend_error",
            Self::EmptyResponse => "empty_response",
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Turn submitted content into output using `model`, which may be an
    /// alias the implementation resolves itself.
    async fn generate(
        &self,
        model: &str,
        content: &str,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError>;
}
