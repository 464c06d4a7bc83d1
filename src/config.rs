//! Configuration parsing and validation.
//!
//! docrag is configured via a TOML file (default: `config/docrag.toml`).
//! Every section is optional and falls back to the defaults below.
//!
//! # Example Configuration
//!
//! ```toml
//! [storage]
//! root = "./data"
//!
//! [chunking]
//! chunk_size = 800
//! chunk_overlap = 100
//! min_chunk_size = 100
//!
//! [index]
//! kind = "clustered"       # or "exhaustive"
//! metric = "inner_product" # or "euclidean"
//! nlist = 100
//! nprobe = 10
//! normalize = true
//!
//! [retrieval]
//! context_length = 3
//! similarity_threshold = 0.3
//!
//! [embedding]
//! provider = "openai"      # disabled | openai | ollama | local
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [generation]
//! provider = "openai"      # disabled | openai (any OpenAI-compatible endpoint)
//! base_url = "https://integrate.api.nvidia.com/v1"
//! model = "nvidia/llama-3.1-nemotron-70b-instruct"
//! api_key_env = "NVIDIA_API_KEY"
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use docrag_core::chunk::ChunkerConfig;
use docrag_core::index::IndexConfig;
use docrag_core::pipeline::{RetrievalDefaults, MAX_CONTEXT_LENGTH};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkerConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalDefaults,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL: OpenAI-compatible API root, or the Ollama server.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_embedding_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_generation_url")]
    pub base_url: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_generation_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_generation_url(),
            model: default_generation_model(),
            api_key_env: default_generation_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Deadline for global searches and answers issued over HTTP.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_generation_url() -> String {
    "https://integrate.api.nvidia.com/v1".to_string()
}
fn default_generation_model() -> String {
    "nvidia/llama-3.1-nemotron-70b-instruct".to_string()
}
fn default_generation_key_env() -> String {
    "NVIDIA_API_KEY".to_string()
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_temperature() -> f32 {
    0.1
}
fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}
fn default_request_timeout_secs() -> u64 {
    60
}

/// Load a config file, or the defaults when `path` does not exist and
/// `allow_missing` is set.
pub fn load_config_or_default(path: &Path, allow_missing: bool) -> Result<Config> {
    if allow_missing && !path.exists() {
        let config = Config::default();
        validate(&config)?;
        return Ok(config);
    }
    load_config(path)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    config
        .chunking
        .validate()
        .map_err(|e| anyhow::anyhow!("chunking: {}", e))?;
    config
        .index
        .validate()
        .map_err(|e| anyhow::anyhow!("index: {}", e))?;

    // Validate retrieval
    let r = &config.retrieval;
    if !(1..=MAX_CONTEXT_LENGTH).contains(&r.context_length) {
        anyhow::bail!(
            "retrieval.context_length must be in [1, {}]",
            MAX_CONTEXT_LENGTH
        );
    }
    if !(-1.0..=1.0).contains(&r.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
    }

    // Validate embedding
    let e = &config.embedding;
    match e.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if e.is_enabled() && e.provider != "local" {
        if e.dims.is_none() || e.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
        }
        if e.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                e.provider
            );
        }
    }
    if e.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if let (Some(dims), Some(expected)) = (e.dims, config.index.dimension) {
        if dims != expected {
            anyhow::bail!(
                "embedding.dims ({}) does not match index.dimension ({})",
                dims,
                expected
            );
        }
    }

    // Validate generation
    match config.generation.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.server.request_timeout_secs == 0 {
        anyhow::bail!("server.request_timeout_secs must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docrag_core::models::{IndexKind, Metric};

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.chunking.chunk_size, 800);
        assert_eq!(config.chunking.chunk_overlap, 100);
        assert_eq!(config.index.kind, IndexKind::Clustered);
        assert_eq!(config.index.metric, Metric::InnerProduct);
        assert_eq!(config.index.nlist, 100);
        assert_eq!(config.retrieval.context_length, 3);
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.storage.root, PathBuf::from("./data"));
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = parse(
            r#"
            [chunking]
            chunk_size = 300
            chunk_overlap = 30
            min_chunk_size = 10

            [index]
            kind = "exhaustive"
            metric = "euclidean"

            [embedding]
            provider = "ollama"
            model = "nomic-embed-text"
            dims = 768
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.chunk_size, 300);
        assert_eq!(config.index.kind, IndexKind::Exhaustive);
        assert_eq!(config.index.metric, Metric::Euclidean);
        assert_eq!(config.embedding.dims, Some(768));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse("[chunking]\nchunk_size = 10\nchunk_overlap = 10\nmin_chunk_size = 1").is_err());
        assert!(parse("[embedding]\nprovider = \"openai\"").is_err());
        assert!(parse("[embedding]\nprovider = \"magic\"").is_err());
        assert!(parse("[generation]\nprovider = \"magic\"").is_err());
        assert!(parse("[retrieval]\ncontext_length = 0").is_err());
        assert!(parse("[index]\nnlist = 0").is_err());
    }
}
