//! Embedding provider implementations.
//!
//! Concrete backends for [`docrag_core::embedding::EmbeddingProvider`]:
//! - **[`DisabledProvider`]**: returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls an OpenAI-compatible `/embeddings` endpoint with batching, retry, and backoff.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalProvider`**: runs models locally via fastembed (`local-embeddings` feature); no network calls after model download.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to instantiate the appropriate provider based
//! on the configuration:
//!
//! ```rust,no_run
//! # use docrag::config::EmbeddingConfig;
//! # use docrag::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```
//!
//! # Retry Strategy
//!
//! Network providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Exhausted retries surface as `UpstreamUnavailable`; client errors and
//! malformed responses as `Processing(embedding_generation)`.

#[cfg(feature = "local-embeddings")]
mod local;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tracing::{debug, warn};

use docrag_core::embedding::{l2_normalize, EmbeddingProvider, EmbeddingRequest, EmbeddingResponse};
use docrag_core::error::{InputKind, Result, RetrievalError, Step};

use crate::config::EmbeddingConfig;

#[cfg(feature = "local-embeddings")]
pub use local::LocalProvider;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// POST `body` to `url`, retrying transient failures with exponential backoff.
///
/// Shared by the embedding providers and the answer generator; `service`
/// names the collaborator in errors and `step` tags non-retryable failures.
pub(crate) async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    service: &str,
    step: Step,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(service, attempt, delay_secs = delay.as_secs(), "retrying");
            tokio::time::sleep(delay).await;
        }

        let mut req = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = bearer {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json().await.map_err(|e| {
                        RetrievalError::processing(step, format!("{} returned invalid JSON: {}", service, e))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(service, %status, "transient API error");
                    last_err = Some(format!("{} API error {}: {}", service, status, body_text));
                    continue;
                }

                // Client error (not 429): fail now
                return Err(RetrievalError::processing(
                    step,
                    format!("{} API error {}: {}", service, status, body_text),
                ));
            }
            Err(e) => {
                warn!(service, error = %e, "connection error");
                last_err = Some(format!("connection error at {}: {}", url, e));
                continue;
            }
        }
    }

    Err(RetrievalError::upstream(
        service,
        last_err.unwrap_or_else(|| "failed after retries".to_string()),
    ))
}

fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn require_texts(request: &EmbeddingRequest) -> Result<()> {
    if request.texts.is_empty() {
        return Err(RetrievalError::input(
            InputKind::EmptyInput,
            "no texts to embed",
        ));
    }
    Ok(())
}

/// Check the provider's answer and apply client-side normalization.
fn finish(
    request: &EmbeddingRequest,
    mut vectors: Vec<Vec<f32>>,
    dims: usize,
    model: &str,
) -> Result<EmbeddingResponse> {
    if vectors.len() != request.texts.len() {
        return Err(RetrievalError::processing(
            Step::EmbeddingGeneration,
            format!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                request.texts.len()
            ),
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(RetrievalError::processing(
            Step::EmbeddingGeneration,
            format!("expected dimension {}, provider returned {}", dims, bad.len()),
        ));
    }
    if request.normalize {
        for v in vectors.iter_mut() {
            l2_normalize(v);
        }
    }
    Ok(EmbeddingResponse {
        vectors,
        dimension: dims,
        model: model.to_string(),
    })
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
///
/// Used when `embedding.provider = "disabled"` in the configuration.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        Err(RetrievalError::processing(
            Step::EmbeddingGeneration,
            "Embedding provider is disabled",
        ))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using an OpenAI-compatible API.
///
/// Calls `POST {url}/embeddings` with the configured model. The API key is
/// read from the environment variable named by `embedding.api_key_env`
/// (default `OPENAI_API_KEY`).
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config, or if
    /// the API key variable is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) => key,
            Err(_) => bail!("{} environment variable not set", config.api_key_env),
        };

        Ok(Self {
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string()),
            api_key,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        require_texts(request)?;
        let model = request.model.as_deref().unwrap_or(&self.model);
        let url = format!("{}/embeddings", self.url.trim_end_matches('/'));

        let mut vectors = Vec::with_capacity(request.texts.len());
        for batch in request.texts.chunks(self.batch_size.max(1)) {
            let body = serde_json::json!({
                "model": model,
                "input": batch,
            });
            let json = post_with_retry(
                &self.client,
                &url,
                Some(&self.api_key),
                &body,
                self.max_retries,
                "openai",
                Step::EmbeddingGeneration,
            )
            .await?;
            vectors.extend(parse_openai_response(&json)?);
        }

        finish(request, vectors, self.dims, model)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| invalid_response("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| invalid_response("missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32s(embedding)));
    }
    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default: `http://localhost:11434`).
/// Requires Ollama to be running with an embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    batch_size: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;

        Ok(Self {
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string()),
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        require_texts(request)?;
        let model = request.model.as_deref().unwrap_or(&self.model);
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));

        let mut vectors = Vec::with_capacity(request.texts.len());
        for batch in request.texts.chunks(self.batch_size.max(1)) {
            let body = serde_json::json!({
                "model": model,
                "input": batch,
            });
            let json = post_with_retry(
                &self.client,
                &url,
                None,
                &body,
                self.max_retries,
                "ollama",
                Step::EmbeddingGeneration,
            )
            .await?;
            vectors.extend(parse_ollama_response(&json)?);
        }

        finish(request, vectors, self.dims, model)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| invalid_response("missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| to_f32s(values))
                .ok_or_else(|| invalid_response("embedding is not an array"))
        })
        .collect()
}

fn to_f32s(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

fn invalid_response(message: &str) -> RetrievalError {
    RetrievalError::processing(
        Step::EmbeddingGeneration,
        format!("invalid embedding response: {}", message),
    )
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// # Supported Providers
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (requires the `local-embeddings` feature) |
pub fn create_provider(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(texts: &[&str], normalize: bool) -> EmbeddingRequest {
        EmbeddingRequest {
            texts: texts.iter().map(|t| t.to_string()).collect(),
            model: None,
            normalize,
        }
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] },
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_ollama() {
        let json = serde_json::json!({ "embeddings": [[0.5, 0.5]] });
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![vec![0.5, 0.5]]);
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_finish_normalizes_and_checks_dims() {
        let response = finish(&request(&["a"], true), vec![vec![3.0, 4.0]], 2, "m").unwrap();
        assert!((response.vectors[0][0] - 0.6).abs() < 1e-6);

        let err = finish(&request(&["a"], false), vec![vec![1.0]], 2, "m").unwrap_err();
        assert_eq!(err.step(), Some(Step::EmbeddingGeneration));

        let err = finish(&request(&["a", "b"], false), vec![vec![1.0, 0.0]], 2, "m").unwrap_err();
        assert_eq!(err.step(), Some(Step::EmbeddingGeneration));
    }

    #[tokio::test]
    async fn test_disabled_provider_errors() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
        let err = provider.embed(&request(&["a"], false)).await.unwrap_err();
        assert_eq!(err.step(), Some(Step::EmbeddingGeneration));
    }

    #[tokio::test]
    async fn test_unreachable_ollama_is_upstream_error() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(2),
            url: Some("http://127.0.0.1:9".into()),
            max_retries: 0,
            timeout_secs: 2,
            ..EmbeddingConfig::default()
        };
        let provider = OllamaProvider::new(&config).unwrap();
        let err = provider.embed(&request(&["a"], false)).await.unwrap_err();
        assert!(matches!(err, RetrievalError::UpstreamUnavailable { .. }));
    }
}
