//! [`Generator`] backed by a local Ollama server.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::config::WorkerConfig;
use crate::generation::{GenerationError, Generator};
use crate::prompt::{build_prompt, clean_output};
use crate::protocol::GenerationOptions;

const TOP_P: f32 = 0.9;
const STOP_SEQUENCES: [&str; 3] = ["```", "Human:", "User:"];
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<InstalledModel>,
}

/// One entry of Ollama's `/api/tags` listing.
#[derive(Debug, Clone, Deserialize)]
pub struct InstalledModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Clone)]
pub struct OllamaGenerator {
    client: Client,
    base_url: String,
    aliases: BTreeMap<String, String>,
    default_model: String,
    timeout: Duration,
}

impl OllamaGenerator {
    pub fn new(
        base_url: impl Into<String>,
        aliases: BTreeMap<String, String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .build()
            .map_err(|err| GenerationError::Backend(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            aliases,
            default_model: default_model.into(),
            timeout,
        })
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self, GenerationError> {
        Self::new(
            config.ollama_url.clone(),
            config.model_aliases(),
            config.default_model.clone(),
            config.generation_timeout(),
        )
    }

    /// Backend model for a requested alias. Backend names pass through;
    /// anything unknown falls back to the default model.
    pub fn resolve_model(&self, requested: &str) -> String {
        if let Some(model) = self.aliases.get(requested) {
            return model.clone();
        }
        if self.aliases.values().any(|model| model == requested) {
            return requested.to_string();
        }
        self.default_model.clone()
    }

    /// Aliases this backend answers to, advertised at registration.
    pub fn capabilities(&self) -> Vec<String> {
        self.aliases.keys().cloned().collect()
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }

    pub async fn list_models(&self) -> Result<Vec<String>, GenerationError> {
        let installed = self.installed_models().await?;
        Ok(installed.into_iter().map(|entry| entry.name).collect())
    }

    pub async fn installed_models(&self) -> Result<Vec<InstalledModel>, GenerationError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| GenerationError::Backend(err.to_string()))?;
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|err| GenerationError::Backend(err.to_string()))?;
        Ok(tags.models)
    }

    /// Pull `model` if the server does not have it. A failed listing is
    /// logged and ignored; the generate call will surface the real problem.
    pub async fn ensure_model(&self, model: &str) -> Result<(), GenerationError> {
        match self.list_models().await {
            Ok(installed) if installed.iter().any(|name| name == model) => return Ok(()),
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(target = "clipboard_relay::ollama", model, error = %error, "could not list installed models");
                return Ok(());
            }
        }

        tracing::info!(target = "clipboard_relay::ollama", model, "model not installed, pulling");
        self.client
            .post(format!("{}/api/pull", self.base_url))
            .json(&json!({ "name": model, "stream": false }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| GenerationError::ModelUnavailable {
                model: model.to_string(),
                reason: err.to_string(),
            })?;
        Ok(())
    }

    async fn request_generation(
        &self,
        model: &str,
        prompt: String,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&json!({
                "model": model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": options.temperature,
                    "top_p": TOP_P,
                    "num_predict": options.max_tokens,
                    "stop": STOP_SEQUENCES,
                },
            }))
            .send()
            .await
            .map_err(|err| GenerationError::Backend(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Backend(format!(
                "ollama returned {status}: {}",
                body.trim()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|err| GenerationError::Backend(err.to_string()))?;
        Ok(body.response)
    }

    async fn pull_and_generate(
        &self,
        backend_model: &str,
        content: &str,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        self.ensure_model(backend_model).await?;
        self.request_generation(backend_model, build_prompt(content), options)
            .await
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(
        &self,
        model: &str,
        content: &str,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        let backend_model = self.resolve_model(model);
        // One deadline covers the pull as well as the generation.
        let raw = tokio::time::timeout(
            self.timeout,
            self.pull_and_generate(&backend_model, content, options),
        )
        .await
        .map_err(|_| GenerationError::GenerationTimeout(self.timeout))??;

        let cleaned = clean_output(&raw);
        if cleaned.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        tracing::debug!(
            target = "clipboard_relay::ollama",
            model = %backend_model,
            chars = cleaned.len(),
            "generation finished"
        );
        Ok(cleaned)
    }
}
