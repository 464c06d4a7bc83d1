//! Local embeddings via fastembed (bundled ONNX runtime).
//!
//! Models are downloaded from Hugging Face on first use and cached; after
//! that, embedding runs entirely offline. The loaded model is kept for the
//! lifetime of the provider.

use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;

use docrag_core::embedding::{EmbeddingProvider, EmbeddingRequest, EmbeddingResponse};
use docrag_core::error::{Result, RetrievalError, Step};

use super::{finish, require_texts};
use crate::config::EmbeddingConfig;

pub struct LocalProvider {
    model_name: String,
    dims: usize,
    model: fastembed::EmbeddingModel,
    batch_size: usize,
    loaded: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
}

impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let model = config_to_fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
            "multilingual-e5-base" => 768,
            "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
            _ => 384,
        });

        Ok(Self {
            model_name,
            dims,
            model,
            batch_size: config.batch_size,
            loaded: Arc::new(Mutex::new(None)),
        })
    }
}

fn config_to_fastembed_model(name: &str) -> anyhow::Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

fn local_error(message: String) -> RetrievalError {
    RetrievalError::processing(Step::EmbeddingGeneration, message)
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        require_texts(request)?;
        let texts = request.texts.clone();
        let batch_size = self.batch_size;
        let model = self.model.clone();
        let loaded = Arc::clone(&self.loaded);

        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = loaded
                .lock()
                .map_err(|_| local_error("local model lock poisoned".to_string()))?;
            if guard.is_none() {
                let embedding = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(false),
                )
                .map_err(|e| local_error(format!("Failed to initialize local embedding model: {}", e)))?;
                *guard = Some(embedding);
            }
            match guard.as_mut() {
                Some(embedding) => embedding
                    .embed(texts, Some(batch_size))
                    .map_err(|e| local_error(format!("Local embedding failed: {}", e))),
                None => Err(local_error("local model not loaded".to_string())),
            }
        })
        .await
        .map_err(|e| local_error(format!("embedding task failed: {}", e)))??;

        finish(request, vectors, self.dims, &self.model_name)
    }
}
