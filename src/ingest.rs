//! Ingestion glue: text → chunks → embeddings → index.
//!
//! [`ingest_text`] runs the whole flow for one document. [`index_document`]
//! (re)builds the index from chunks already in the store, for when the
//! embedding model changes or an earlier indexing attempt failed. Chunks
//! saved before an indexing failure are kept; they are valid on their own.

use serde::Serialize;
use tracing::{debug, info};

use docrag_core::chunk::split_text;
use docrag_core::embedding::{EmbeddingProvider, EmbeddingRequest};
use docrag_core::error::{Result, RetrievalError, Step};
use docrag_core::models::{Chunk, ChunkStatistics, EmbeddingVector, IndexSummary};

use crate::services::Services;

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks: ChunkStatistics,
    pub index: IndexSummary,
}

/// Split, store, embed, and index `text` as `document_id`.
pub async fn ingest_text(services: &Services, document_id: &str, text: &str) -> Result<IngestReport> {
    let chunks = split_text(document_id, text, &services.config.chunking)
        .map_err(|e| e.at_step(Step::TextSplitting))?;
    let stats = services.chunks.save(document_id, &chunks).await?;
    let index = build_from_chunks(services, document_id, &chunks).await?;

    info!(
        document_id,
        chunks = stats.total_chunks,
        vectors = index.vector_count,
        "ingested document"
    );
    Ok(IngestReport {
        document_id: document_id.to_string(),
        chunks: stats,
        index,
    })
}

/// Embed a document's stored chunks and (re)build its index.
pub async fn index_document(services: &Services, document_id: &str) -> Result<IndexSummary> {
    let chunks = services.chunks.list(document_id, None, 0).await?;
    build_from_chunks(services, document_id, &chunks).await
}

async fn build_from_chunks(
    services: &Services,
    document_id: &str,
    chunks: &[Chunk],
) -> Result<IndexSummary> {
    let embeddings = embed_chunks(
        services.embedder.as_ref(),
        chunks,
        services.config.embedding.batch_size,
    )
    .await?;

    let mut vectors = Vec::with_capacity(embeddings.len());
    let mut embedding_ids = Vec::with_capacity(embeddings.len());
    let mut chunk_ids = Vec::with_capacity(embeddings.len());
    for e in embeddings {
        vectors.push(e.values);
        embedding_ids.push(e.embedding_id);
        chunk_ids.push(e.chunk_id);
    }

    services
        .indexes
        .build(
            document_id,
            vectors,
            embedding_ids,
            chunk_ids,
            &services.config.index,
            Some(services.embedder.model_name().to_string()),
        )
        .await
}

/// Embed chunk contents in batches of `batch_size`. Every batch must come
/// back with exactly one vector per chunk.
pub async fn embed_chunks(
    embedder: &dyn EmbeddingProvider,
    chunks: &[Chunk],
    batch_size: usize,
) -> Result<Vec<EmbeddingVector>> {
    let mut out = Vec::with_capacity(chunks.len());
    for (i, batch) in chunks.chunks(batch_size.max(1)).enumerate() {
        let response = embedder
            .embed(&EmbeddingRequest {
                texts: batch.iter().map(|c| c.content.clone()).collect(),
                model: None,
                normalize: false,
            })
            .await
            .map_err(|e| match e {
                RetrievalError::UpstreamUnavailable { .. } => e,
                other => RetrievalError::processing(Step::EmbeddingGeneration, other.to_string()),
            })?;
        if response.vectors.len() != batch.len() {
            return Err(RetrievalError::processing(
                Step::EmbeddingGeneration,
                format!(
                    "provider returned {} vectors for {} texts",
                    response.vectors.len(),
                    batch.len()
                ),
            ));
        }
        debug!(batch = i, size = batch.len(), "embedded batch");
        for (chunk, values) in batch.iter().zip(response.vectors) {
            out.push(EmbeddingVector::new(chunk, values, &response.model));
        }
    }
    Ok(out)
}
