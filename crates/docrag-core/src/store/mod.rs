//! Storage abstraction for chunks and vector indexes.
//!
//! The [`ChunkStore`] and [`IndexStore`] traits define every persistence
//! operation the retrieval pipeline needs, so that the file-backed stores
//! in the `docrag` app crate and the in-memory stores in [`memory`] are
//! interchangeable.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::index::IndexConfig;
use crate::models::{Chunk, ChunkStatistics, IndexSummary, SearchHit};

/// Persists a document's ordered chunks and their statistics.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`save`](ChunkStore::save) | Replace all chunks for a document (all-or-nothing) |
/// | [`list`](ChunkStore::list) | Page through a document's chunks in order |
/// | [`get`](ChunkStore::get) | Fetch one chunk by id |
/// | [`delete`](ChunkStore::delete) | Remove a document's chunks and statistics |
/// | [`statistics`](ChunkStore::statistics) | Stored statistics for a document |
/// | [`documents`](ChunkStore::documents) | Statistics for every document, newest first |
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store `chunks` for `document_id`, replacing any previous set.
    /// Fails with `Input(empty_input)` for an empty list.
    async fn save(&self, document_id: &str, chunks: &[Chunk]) -> Result<ChunkStatistics>;

    /// Chunks in `chunk_index` order, skipping `offset` and returning at most
    /// `limit` (all when `None`). Fails with `NotFound` for unknown documents.
    async fn list(
        &self,
        document_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Chunk>>;

    /// One chunk by id; `Ok(None)` if the document exists but the chunk does
    /// not. Fails with `NotFound` for unknown documents.
    async fn get(&self, document_id: &str, chunk_id: &str) -> Result<Option<Chunk>>;

    /// Returns whether anything was removed.
    async fn delete(&self, document_id: &str) -> Result<bool>;

    async fn statistics(&self, document_id: &str) -> Result<Option<ChunkStatistics>>;

    async fn documents(&self) -> Result<Vec<ChunkStatistics>>;
}

/// Builds, persists, and queries per-document vector indexes.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Build (or fully replace) the index for `document_id`.
    async fn build(
        &self,
        document_id: &str,
        vectors: Vec<Vec<f32>>,
        embedding_ids: Vec<String>,
        chunk_ids: Vec<String>,
        config: &IndexConfig,
        model_identifier: Option<String>,
    ) -> Result<IndexSummary>;

    /// Search one document's index. Fails with `NotFound` when none exists.
    async fn search(
        &self,
        document_id: &str,
        query: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>>;

    /// Returns whether an index was removed.
    async fn delete(&self, document_id: &str) -> Result<bool>;

    async fn statistics(&self, document_id: &str) -> Result<Option<IndexSummary>>;

    /// Summaries of every complete index, newest first.
    async fn summaries(&self) -> Result<Vec<IndexSummary>>;
}

/// Apply `offset`/`limit` paging to an ordered chunk list.
pub fn page(chunks: Vec<Chunk>, limit: Option<usize>, offset: usize) -> Vec<Chunk> {
    let iter = chunks.into_iter().skip(offset);
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}
