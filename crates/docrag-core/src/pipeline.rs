//! Retrieval orchestrator: question → ranked contexts → answer.
//!
//! # Steps
//!
//! | # | Step | Failure |
//! |---|------|---------|
//! | 1 | Embed the question | `Processing(embedding_generation)` |
//! | 2 | Search one document's index, or all of them | missing index → no contexts; otherwise `Processing(vector_search)` |
//! | 3 | Resolve hit chunk ids through the chunk store | unknown ids dropped; otherwise `Processing(text_processing_service)` |
//! | 4 | Join contexts with blank lines (placeholder when empty) | - |
//! | 5 | Generate the answer | `Processing(answer_generation)` |
//! | 6 | Compute confidence | - |
//!
//! [`RetrievalPipeline::retrieve`] runs steps 1–3 and returns the contexts
//! without calling the generator.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::embedding::{
    AnswerGenerator, EmbeddingProvider, EmbeddingRequest, GenerationRequest, TokenUsage,
};
use crate::error::{InputKind, Result, RetrievalError, Step};
use crate::models::{validate_document_id, Chunk, ContextItem, SearchHit};
use crate::registry::IndexRegistry;
use crate::store::ChunkStore;

/// Context passed to the generator when nothing could be retrieved.
pub const NO_CONTEXT_PLACEHOLDER: &str = "No relevant information was found.";

pub const MAX_CONTEXT_LENGTH: usize = 100;

/// Defaults applied to requests that leave fields unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalDefaults {
    #[serde(default = "default_context_length")]
    pub context_length: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Ask the embedding provider for unit-length query vectors.
    #[serde(default = "default_normalize_queries")]
    pub normalize_queries: bool,
}

fn default_context_length() -> usize {
    3
}
fn default_similarity_threshold() -> f32 {
    0.3
}
fn default_normalize_queries() -> bool {
    true
}

impl Default for RetrievalDefaults {
    fn default() -> Self {
        Self {
            context_length: default_context_length(),
            similarity_threshold: default_similarity_threshold(),
            normalize_queries: default_normalize_queries(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub question: String,
    /// Restrict retrieval to one document; search all indexes when unset.
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub context_length: Option<usize>,
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub embedding: u64,
    pub search: u64,
    pub fetch: u64,
    pub generation: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub request_id: String,
    pub embedding_dimension: usize,
    pub total_hits: usize,
    pub resolved: usize,
    pub unresolved_chunk_ids: Vec<String>,
    pub model_used: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub timings_ms: Timings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    pub contexts: Vec<ContextItem>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub answer: String,
    pub confidence: f32,
    pub contexts: Vec<ContextItem>,
    pub diagnostics: Diagnostics,
}

/// Drives retrieval over injected collaborators.
#[derive(Clone)]
pub struct RetrievalPipeline {
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn AnswerGenerator>,
    chunks: Arc<dyn ChunkStore>,
    registry: IndexRegistry,
    defaults: RetrievalDefaults,
}

struct Resolved {
    contexts: Vec<ContextItem>,
    unresolved: Vec<String>,
}

impl RetrievalPipeline {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn AnswerGenerator>,
        chunks: Arc<dyn ChunkStore>,
        registry: IndexRegistry,
        defaults: RetrievalDefaults,
    ) -> Self {
        Self {
            embedder,
            generator,
            chunks,
            registry,
            defaults,
        }
    }

    pub fn defaults(&self) -> &RetrievalDefaults {
        &self.defaults
    }

    /// Reject malformed requests before any collaborator is called.
    pub fn validate(&self, request: &AnswerRequest) -> Result<(usize, f32)> {
        if request.question.trim().is_empty() {
            return Err(RetrievalError::input(
                InputKind::EmptyInput,
                "question must not be empty",
            ));
        }
        if let Some(doc) = &request.document_id {
            validate_document_id(doc)?;
        }
        let context_length = request
            .context_length
            .unwrap_or(self.defaults.context_length);
        if !(1..=MAX_CONTEXT_LENGTH).contains(&context_length) {
            return Err(RetrievalError::input(
                InputKind::InvalidRequest,
                format!("context_length must be between 1 and {}", MAX_CONTEXT_LENGTH),
            ));
        }
        let threshold = request
            .similarity_threshold
            .unwrap_or(self.defaults.similarity_threshold);
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(RetrievalError::input(
                InputKind::InvalidRequest,
                "similarity_threshold must be between -1 and 1",
            ));
        }
        Ok((context_length, threshold))
    }

    /// Embed the question, search, and resolve contexts.
    pub async fn retrieve(
        &self,
        request: &AnswerRequest,
        cancel: Option<&AtomicBool>,
    ) -> Result<RetrievalOutcome> {
        let started = Instant::now();
        let (context_length, threshold) = self.validate(request)?;
        let mut diagnostics = Diagnostics {
            request_id: uuid::Uuid::new_v4().to_string(),
            ..Diagnostics::default()
        };

        let query = self.embed_question(&request.question).await?;
        diagnostics.embedding_dimension = query.len();
        diagnostics.timings_ms.embedding = started.elapsed().as_millis() as u64;

        let search_started = Instant::now();
        let hits = self
            .search(
                request.document_id.as_deref(),
                &query,
                context_length,
                threshold,
                cancel,
            )
            .await?;
        diagnostics.total_hits = hits.len();
        diagnostics.timings_ms.search = search_started.elapsed().as_millis() as u64;

        let fetch_started = Instant::now();
        let resolved = self.resolve(&hits).await?;
        diagnostics.resolved = resolved.contexts.len();
        diagnostics.unresolved_chunk_ids = resolved.unresolved;
        diagnostics.timings_ms.fetch = fetch_started.elapsed().as_millis() as u64;
        diagnostics.timings_ms.total = started.elapsed().as_millis() as u64;

        info!(
            request_id = %diagnostics.request_id,
            hits = diagnostics.total_hits,
            resolved = diagnostics.resolved,
            elapsed_ms = diagnostics.timings_ms.total,
            "retrieval complete"
        );

        Ok(RetrievalOutcome {
            contexts: resolved.contexts,
            diagnostics,
        })
    }

    /// Run the full pipeline and generate an answer.
    pub async fn answer(
        &self,
        request: &AnswerRequest,
        cancel: Option<&AtomicBool>,
    ) -> Result<AnswerResponse> {
        let started = Instant::now();
        let RetrievalOutcome {
            contexts,
            mut diagnostics,
        } = self.retrieve(request, cancel).await?;

        let context = join_contexts(&contexts);

        let generation_started = Instant::now();
        let generated = self
            .generator
            .generate(&GenerationRequest {
                question: request.question.clone(),
                context,
                model: request.model.clone(),
                max_tokens: request.max_tokens,
                temperature: request.temperature,
            })
            .await
            .map_err(|e| RetrievalError::processing(Step::AnswerGeneration, e.to_string()))?;
        diagnostics.timings_ms.generation = generation_started.elapsed().as_millis() as u64;
        diagnostics.timings_ms.total = started.elapsed().as_millis() as u64;
        diagnostics.model_used = Some(generated.model);
        diagnostics.token_usage = generated.token_usage;

        let confidence = confidence(&contexts);
        info!(
            request_id = %diagnostics.request_id,
            contexts = contexts.len(),
            confidence,
            elapsed_ms = diagnostics.timings_ms.total,
            "answer generated"
        );

        Ok(AnswerResponse {
            answer: generated.text,
            confidence,
            contexts,
            diagnostics,
        })
    }

    async fn embed_question(&self, question: &str) -> Result<Vec<f32>> {
        let response = self
            .embedder
            .embed(&EmbeddingRequest {
                texts: vec![question.to_string()],
                model: None,
                normalize: self.defaults.normalize_queries,
            })
            .await
            .map_err(|e| RetrievalError::processing(Step::EmbeddingGeneration, e.to_string()))?;

        match response.vectors.into_iter().next() {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(RetrievalError::processing(
                Step::EmbeddingGeneration,
                "provider returned no embedding",
            )),
        }
    }

    async fn search(
        &self,
        document_id: Option<&str>,
        query: &[f32],
        top_k: usize,
        threshold: f32,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<SearchHit>> {
        let result = match document_id {
            Some(doc) => self.registry.store().search(doc, query, top_k, threshold).await,
            None => {
                self.registry
                    .global_search(query, top_k, threshold, cancel)
                    .await
            }
        };
        match result {
            Ok(hits) => Ok(hits),
            Err(e) if e.is_not_found() => {
                warn!(document_id = ?document_id, "no index, continuing without context");
                Ok(Vec::new())
            }
            Err(e) if e.step() == Some(Step::Cancelled) => Err(e),
            Err(e) => Err(RetrievalError::processing(
                Step::VectorSearch,
                e.to_string(),
            )),
        }
    }

    async fn resolve(&self, hits: &[SearchHit]) -> Result<Resolved> {
        let mut by_document: HashMap<&str, HashMap<String, Chunk>> = HashMap::new();
        for hit in hits {
            if by_document.contains_key(hit.document_id.as_str()) {
                continue;
            }
            let chunks = match self.chunks.list(&hit.document_id, None, 0).await {
                Ok(chunks) => chunks,
                Err(e) if e.is_not_found() => {
                    warn!(document_id = %hit.document_id, "index hit for document without chunks");
                    Vec::new()
                }
                Err(e) => {
                    return Err(RetrievalError::processing(
                        Step::TextProcessingService,
                        e.to_string(),
                    ))
                }
            };
            by_document.insert(
                hit.document_id.as_str(),
                chunks.into_iter().map(|c| (c.chunk_id.clone(), c)).collect(),
            );
        }

        let mut contexts = Vec::with_capacity(hits.len());
        let mut unresolved = Vec::new();
        for hit in hits {
            match by_document
                .get(hit.document_id.as_str())
                .and_then(|chunks| chunks.get(&hit.chunk_id))
            {
                Some(chunk) => contexts.push(ContextItem {
                    chunk_id: chunk.chunk_id.clone(),
                    document_id: chunk.document_id.clone(),
                    chunk_index: chunk.chunk_index,
                    content: chunk.content.clone(),
                    score: hit.score,
                    rank: hit.rank,
                }),
                None => {
                    warn!(chunk_id = %hit.chunk_id, document_id = %hit.document_id, "unresolved chunk");
                    unresolved.push(hit.chunk_id.clone());
                }
            }
        }

        Ok(Resolved {
            contexts,
            unresolved,
        })
    }
}

/// Join context contents with blank lines, or the placeholder when empty.
pub fn join_contexts(contexts: &[ContextItem]) -> String {
    if contexts.is_empty() {
        return NO_CONTEXT_PLACEHOLDER.to_string();
    }
    contexts
        .iter()
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// `0.1` with no contexts, else `min(0.95, 0.7 * max_score + min(0.3, 0.1 * count))`.
pub fn confidence(contexts: &[ContextItem]) -> f32 {
    if contexts.is_empty() {
        return 0.1;
    }
    let max_score = contexts
        .iter()
        .map(|c| c.score)
        .fold(f32::NEG_INFINITY, f32::max);
    let coverage = (0.1 * contexts.len() as f32).min(0.3);
    (0.7 * max_score + coverage).min(0.95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{split_text, ChunkerConfig};
    use crate::embedding::{EmbeddingResponse, GenerationResponse};
    use crate::index::IndexConfig;
    use crate::models::IndexKind;
    use crate::store::memory::{InMemoryChunkStore, InMemoryIndexStore};
    use crate::store::IndexStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Embeds by looking up fixed vectors; unknown text maps to `[0, 0, 1]`.
    struct TableEmbedder {
        table: Vec<(String, Vec<f32>)>,
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for TableEmbedder {
        fn model_name(&self) -> &str {
            "table"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
            if self.fail {
                return Err(RetrievalError::upstream("embedder", "connection refused"));
            }
            let vectors = request
                .texts
                .iter()
                .map(|t| {
                    self.table
                        .iter()
                        .find(|(k, _)| k == t)
                        .map(|(_, v)| v.clone())
                        .unwrap_or_else(|| vec![0.0, 0.0, 1.0])
                })
                .collect();
            Ok(EmbeddingResponse {
                vectors,
                dimension: 3,
                model: "table".into(),
            })
        }
    }

    #[derive(Default)]
    struct EchoGenerator {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AnswerGenerator for EchoGenerator {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
            self.seen.lock().unwrap().push(request.context.clone());
            Ok(GenerationResponse {
                text: format!("answer to {}", request.question),
                model: "echo".into(),
                token_usage: None,
            })
        }
    }

    const PARIS: &str = "Paris is the capital of France. It is located on the Seine.";

    async fn setup(fail: bool) -> (RetrievalPipeline, Arc<EchoGenerator>, Vec<Chunk>) {
        let chunker = ChunkerConfig {
            chunk_size: 30,
            chunk_overlap: 5,
            min_chunk_size: 1,
            ..ChunkerConfig::default()
        };
        let chunks = split_text("paris", PARIS, &chunker).unwrap();
        let axes = [
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.6, 0.8],
            vec![0.0, 0.0, 1.0],
        ];

        let chunk_store = Arc::new(InMemoryChunkStore::new());
        chunk_store.save("paris", &chunks).await.unwrap();

        let index_store = Arc::new(InMemoryIndexStore::new());
        index_store
            .build(
                "paris",
                axes[..chunks.len()].to_vec(),
                chunks.iter().map(|c| format!("e-{}", c.chunk_index)).collect(),
                chunks.iter().map(|c| c.chunk_id.clone()).collect(),
                &IndexConfig {
                    kind: IndexKind::Exhaustive,
                    ..IndexConfig::default()
                },
                None,
            )
            .await
            .unwrap();

        let embedder = Arc::new(TableEmbedder {
            table: vec![("What is the capital of France?".into(), vec![0.95, 0.05, 0.0])],
            fail,
        });
        let generator = Arc::new(EchoGenerator::default());
        let pipeline = RetrievalPipeline::new(
            embedder,
            generator.clone(),
            chunk_store,
            IndexRegistry::new(index_store),
            RetrievalDefaults::default(),
        );
        (pipeline, generator, chunks)
    }

    fn request(question: &str) -> AnswerRequest {
        AnswerRequest {
            question: question.into(),
            document_id: Some("paris".into()),
            context_length: Some(3),
            similarity_threshold: Some(0.0),
            ..AnswerRequest::default()
        }
    }

    #[tokio::test]
    async fn test_paris_first_chunk_ranks_first() {
        let (pipeline, generator, chunks) = setup(false).await;
        let response = pipeline
            .answer(&request("What is the capital of France?"), None)
            .await
            .unwrap();
        assert_eq!(response.contexts[0].chunk_id, chunks[0].chunk_id);
        assert_eq!(response.contexts[0].rank, 1);
        assert!(response.confidence > 0.1 && response.confidence <= 0.95);
        assert_eq!(response.diagnostics.embedding_dimension, 3);
        assert_eq!(response.diagnostics.model_used.as_deref(), Some("echo"));

        let seen = generator.seen.lock().unwrap();
        assert!(seen[0].starts_with("Paris is the capital of"));
    }

    #[tokio::test]
    async fn test_missing_index_uses_placeholder() {
        let (pipeline, generator, _) = setup(false).await;
        let mut req = request("anything");
        req.document_id = Some("unknown".into());
        let response = pipeline.answer(&req, None).await.unwrap();
        assert!(response.contexts.is_empty());
        assert_eq!(response.confidence, 0.1);
        assert_eq!(generator.seen.lock().unwrap()[0], NO_CONTEXT_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_tagged() {
        let (pipeline, _, _) = setup(true).await;
        let err = pipeline.answer(&request("q"), None).await.unwrap_err();
        assert_eq!(err.step(), Some(Step::EmbeddingGeneration));
    }

    #[tokio::test]
    async fn test_request_validation() {
        let (pipeline, _, _) = setup(false).await;
        assert!(pipeline.answer(&request("   "), None).await.is_err());

        let mut req = request("q");
        req.context_length = Some(0);
        assert!(pipeline.retrieve(&req, None).await.is_err());
        req.context_length = Some(101);
        assert!(pipeline.retrieve(&req, None).await.is_err());

        let mut req = request("q");
        req.similarity_threshold = Some(1.5);
        assert!(matches!(
            pipeline.retrieve(&req, None).await.unwrap_err(),
            RetrievalError::Input {
                kind: InputKind::InvalidRequest,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_global_retrieve_drops_chunks_of_deleted_document() {
        let (pipeline, _, _) = setup(false).await;
        pipeline.chunks.delete("paris").await.unwrap();
        let mut req = request("What is the capital of France?");
        req.document_id = None;
        let outcome = pipeline.retrieve(&req, None).await.unwrap();
        assert!(outcome.contexts.is_empty());
        assert!(outcome.diagnostics.total_hits > 0);
        assert_eq!(
            outcome.diagnostics.unresolved_chunk_ids.len(),
            outcome.diagnostics.total_hits
        );
    }

    #[test]
    fn test_confidence_formula() {
        assert_eq!(confidence(&[]), 0.1);
        let item = |score| ContextItem {
            chunk_id: "c".into(),
            document_id: "d".into(),
            chunk_index: 0,
            content: "x".into(),
            score,
            rank: 1,
        };
        assert!((confidence(&[item(0.5)]) - 0.45).abs() < 1e-6);
        assert!((confidence(&[item(0.9), item(0.8), item(0.7), item(0.6)]) - 0.93).abs() < 1e-6);
        assert_eq!(confidence(&[item(1.0), item(1.0), item(1.0)]), 0.95);
    }

    #[test]
    fn test_join_contexts() {
        assert_eq!(join_contexts(&[]), NO_CONTEXT_PLACEHOLDER);
    }
}
