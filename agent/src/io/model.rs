//! Inference backend abstraction.
//!
//! The [`ModelBackend`] trait decouples the repair loop from the HTTP exchange
//! with the model server. Tests use scripted backends that return queued
//! responses without touching the network.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::config::ModelConfig;
use crate::io::prompt::head_bytes;

/// Bytes of an error response body quoted in diagnostics.
const MAX_ERROR_BODY_LEN: usize = 500;

/// One prompt/response exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: String,
    pub temperature: f32,
}

/// Abstraction over model inference backends.
pub trait ModelBackend {
    /// Return the generated text. Any `Err` counts as a failed generation attempt.
    fn generate(&self, request: &GenerateRequest) -> Result<String>;
}

/// Backend for an Ollama server (`POST /api/generate`, non-streaming).
pub struct OllamaBackend {
    client: Client,
    endpoint: String,
    model: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaBackend {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build model HTTP client")?;
        Ok(Self {
            client,
            endpoint: generate_endpoint(&config.url),
            model: config.model.clone(),
            timeout,
        })
    }
}

impl ModelBackend for OllamaBackend {
    #[instrument(skip_all, fields(model = %self.model, prompt_bytes = request.prompt.len()))]
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        info!(endpoint = %self.endpoint, "requesting completion");
        let body = OllamaRequest {
            model: &self.model,
            prompt: &request.prompt,
            system: &request.system,
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
            },
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    warn!(timeout_secs = self.timeout.as_secs(), "model request timed out");
                    anyhow!("model request timed out after {:?}", self.timeout)
                } else {
                    anyhow!("model request failed: {err}")
                }
            })?;
        let status = resp.status();
        let text = resp.text().context("read model response body")?;
        let generated = decode_response(status, &text)?;
        debug!(response_bytes = generated.len(), "model responded");
        Ok(generated)
    }
}

fn generate_endpoint(base_url: &str) -> String {
    format!("{}/api/generate", base_url.trim_end_matches('/'))
}

fn decode_response(status: StatusCode, body: &str) -> Result<String> {
    if !status.is_success() {
        return Err(anyhow!(
            "model server returned {status}: {}",
            head_bytes(body.trim(), MAX_ERROR_BODY_LEN)
        ));
    }
    let parsed: OllamaResponse = serde_json::from_str(body).with_context(|| {
        format!(
            "decode model response: {}",
            head_bytes(body.trim(), MAX_ERROR_BODY_LEN)
        )
    })?;
    Ok(parsed.response)
}
