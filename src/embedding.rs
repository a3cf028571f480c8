//! HTTP embedding gateways.
//!
//! Concrete [`EmbeddingGateway`] implementations:
//! - **[`DisabledGateway`]**: fails every request; used when embeddings are not configured.
//! - **[`OpenAIGateway`]**: `POST {url}/embeddings` on an OpenAI-compatible API.
//! - **[`OllamaGateway`]**: `POST {url}/api/embed` on a local Ollama instance.
//!
//! Gateways make exactly one request per call. Retry and backoff belong to
//! the caller, which relies on the error classification below:
//!
//! | Condition | Error |
//! |-----------|-------|
//! | HTTP 429, HTTP 5xx | [`EmbeddingError::Transient`] |
//! | timeout, connection failure | [`EmbeddingError::Transient`] |
//! | other HTTP 4xx | [`EmbeddingError::Permanent`] |
//! | malformed response body | [`EmbeddingError::Permanent`] |
//! | wrong vector width | [`EmbeddingError::DimensionMismatch`] |
//!
//! Use [`create_gateway`] to pick an implementation from configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use codeslice_core::embedding::{validate_batch, EmbeddingGateway};
use codeslice_core::error::EmbeddingError;
use tracing::debug;

use crate::config::EmbeddingConfig;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

// ============ Disabled Gateway ============

/// Gateway that rejects every request.
pub struct DisabledGateway;

#[async_trait]
impl EmbeddingGateway for DisabledGateway {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed_batch(
        &self,
        _texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Permanent(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ Shared HTTP plumbing ============

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("failed to build HTTP client")
}

fn classify_send_error(provider: &str, e: reqwest::Error) -> EmbeddingError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        EmbeddingError::Transient(format!("{provider} request failed: {e}"))
    } else {
        EmbeddingError::Permanent(format!("{provider} request failed: {e}"))
    }
}

/// Send a request and return the JSON body of a successful response.
async fn send_json(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> std::result::Result<serde_json::Value, EmbeddingError> {
    let response = request
        .send()
        .await
        .map_err(|e| classify_send_error(provider, e))?;
    let status = response.status();

    if status.is_success() {
        return response.json().await.map_err(|e| {
            EmbeddingError::Permanent(format!("{provider} returned invalid JSON: {e}"))
        });
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{provider} API error {status}: {body}");
    if status.as_u16() == 429 || status.is_server_error() {
        Err(EmbeddingError::Transient(message))
    } else {
        Err(EmbeddingError::Permanent(message))
    }
}

fn parse_vector(value: &serde_json::Value) -> std::result::Result<Vec<f32>, EmbeddingError> {
    let items = value
        .as_array()
        .ok_or_else(|| EmbeddingError::Permanent("embedding is not an array".to_string()))?;
    items
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                EmbeddingError::Permanent("embedding contains a non-numeric value".to_string())
            })
        })
        .collect()
}

fn require_model_and_dims(config: &EmbeddingConfig, provider: &str) -> Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {provider} provider"))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {provider} provider"))?;
    Ok((model, dims))
}

// ============ OpenAI Gateway ============

/// OpenAI-compatible embeddings API.
///
/// Reads the bearer token from `OPENAI_API_KEY` at construction.
pub struct OpenAIGateway {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAIGateway {
    /// # Errors
    ///
    /// Fails when `model` or `dims` is not configured, or when
    /// `OPENAI_API_KEY` is not set.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = require_model_and_dims(config, "OpenAI")?;
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string());
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingGateway for OpenAIGateway {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/embeddings", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);

        let json = send_json("OpenAI", request).await?;
        let vectors = parse_openai_response(&json)?;
        validate_batch(&vectors, texts.len(), self.dims)?;
        debug!(model = %self.model, count = vectors.len(), "Embedded batch");
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(
    json: &serde_json::Value,
) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json.get("data").and_then(|d| d.as_array()).ok_or_else(|| {
        EmbeddingError::Permanent("invalid OpenAI response: missing data array".to_string())
    })?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map_or(position, |i| i as usize);
        let embedding = item.get("embedding").ok_or_else(|| {
            EmbeddingError::Permanent("invalid OpenAI response: missing embedding".to_string())
        })?;
        indexed.push((index, parse_vector(embedding)?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Gateway ============

/// Local Ollama instance.
pub struct OllamaGateway {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaGateway {
    /// # Errors
    ///
    /// Fails when `model` or `dims` is not configured.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = require_model_and_dims(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }
}

#[async_trait]
impl EmbeddingGateway for OllamaGateway {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body);

        let json = send_json("Ollama", request).await?;
        let vectors = parse_ollama_response(&json)?;
        validate_batch(&vectors, texts.len(), self.dims)?;
        debug!(model = %self.model, count = vectors.len(), "Embedded batch");
        Ok(vectors)
    }
}

fn parse_ollama_response(
    json: &serde_json::Value,
) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            EmbeddingError::Permanent(
                "invalid Ollama response: missing embeddings array".to_string(),
            )
        })?;
    embeddings.iter().map(parse_vector).collect()
}

/// Create the [`EmbeddingGateway`] named by `config.provider`.
///
/// | Config Value | Gateway |
/// |-------------|---------|
/// | `"disabled"` | [`DisabledGateway`] |
/// | `"openai"` | [`OpenAIGateway`] |
/// | `"ollama"` | [`OllamaGateway`] |
///
/// # Errors
///
/// Unknown provider names, or a gateway that cannot be initialized.
pub fn create_gateway(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingGateway>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGateway)),
        "openai" => Ok(Arc::new(OpenAIGateway::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGateway::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
