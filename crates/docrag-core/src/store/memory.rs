//! In-memory [`ChunkStore`] and [`IndexStore`] implementations.
//!
//! Uses `HashMap` behind `std::sync::RwLock` for thread safety. Used by
//! tests and by callers that do not need persistence.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use async_trait::async_trait;

use crate::error::{InputKind, Result, RetrievalError};
use crate::index::{IndexConfig, VectorIndex};
use crate::models::{validate_document_id, Chunk, ChunkStatistics, IndexSummary, SearchHit};

use super::{page, ChunkStore, IndexStore};

// A panic while holding the lock cannot leave a map half-updated (every
// write is a single insert or remove), so poisoning is ignored.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

struct StoredChunks {
    chunks: Vec<Chunk>,
    stats: ChunkStatistics,
}

/// In-memory chunk store.
#[derive(Default)]
pub struct InMemoryChunkStore {
    docs: RwLock<HashMap<String, StoredChunks>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn save(&self, document_id: &str, chunks: &[Chunk]) -> Result<ChunkStatistics> {
        validate_document_id(document_id)?;
        if chunks.is_empty() {
            return Err(RetrievalError::input(
                InputKind::EmptyInput,
                "no chunks to save",
            ));
        }
        let stats = ChunkStatistics::from_chunks(document_id, chunks);
        write(&self.docs).insert(
            document_id.to_string(),
            StoredChunks {
                chunks: chunks.to_vec(),
                stats: stats.clone(),
            },
        );
        Ok(stats)
    }

    async fn list(
        &self,
        document_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Chunk>> {
        let docs = read(&self.docs);
        let stored = docs
            .get(document_id)
            .ok_or_else(|| RetrievalError::not_found(format!("no chunks for {}", document_id)))?;
        Ok(page(stored.chunks.clone(), limit, offset))
    }

    async fn get(&self, document_id: &str, chunk_id: &str) -> Result<Option<Chunk>> {
        let docs = read(&self.docs);
        let stored = docs
            .get(document_id)
            .ok_or_else(|| RetrievalError::not_found(format!("no chunks for {}", document_id)))?;
        Ok(stored.chunks.iter().find(|c| c.chunk_id == chunk_id).cloned())
    }

    async fn delete(&self, document_id: &str) -> Result<bool> {
        Ok(write(&self.docs).remove(document_id).is_some())
    }

    async fn statistics(&self, document_id: &str) -> Result<Option<ChunkStatistics>> {
        Ok(read(&self.docs).get(document_id).map(|s| s.stats.clone()))
    }

    async fn documents(&self) -> Result<Vec<ChunkStatistics>> {
        let mut all: Vec<ChunkStatistics> =
            read(&self.docs).values().map(|s| s.stats.clone()).collect();
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        Ok(all)
    }
}

/// In-memory index store.
#[derive(Default)]
pub struct InMemoryIndexStore {
    indexes: RwLock<HashMap<String, (Arc<VectorIndex>, IndexSummary)>>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn build(
        &self,
        document_id: &str,
        vectors: Vec<Vec<f32>>,
        embedding_ids: Vec<String>,
        chunk_ids: Vec<String>,
        config: &IndexConfig,
        model_identifier: Option<String>,
    ) -> Result<IndexSummary> {
        let started = Instant::now();
        let index = VectorIndex::build(document_id, vectors, embedding_ids, chunk_ids, config)?;
        let size = index.to_bytes().len() as u64;
        let summary = index.summary(
            model_identifier,
            size,
            started.elapsed().as_millis() as u64,
        );
        write(&self.indexes).insert(document_id.to_string(), (Arc::new(index), summary.clone()));
        Ok(summary)
    }

    async fn search(
        &self,
        document_id: &str,
        query: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        let index = read(&self.indexes)
            .get(document_id)
            .map(|(index, _)| Arc::clone(index))
            .ok_or_else(|| RetrievalError::not_found(format!("no index for {}", document_id)))?;
        index.search(query, top_k, threshold)
    }

    async fn delete(&self, document_id: &str) -> Result<bool> {
        Ok(write(&self.indexes).remove(document_id).is_some())
    }

    async fn statistics(&self, document_id: &str) -> Result<Option<IndexSummary>> {
        Ok(read(&self.indexes).get(document_id).map(|(_, s)| s.clone()))
    }

    async fn summaries(&self) -> Result<Vec<IndexSummary>> {
        let mut all: Vec<IndexSummary> =
            read(&self.indexes).values().map(|(_, s)| s.clone()).collect();
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{split_text, ChunkerConfig};
    use crate::models::IndexKind;

    fn chunks() -> Vec<Chunk> {
        let config = ChunkerConfig {
            chunk_size: 20,
            chunk_overlap: 0,
            min_chunk_size: 1,
            ..ChunkerConfig::default()
        };
        split_text("doc1", "one two three four five six seven eight nine ten", &config).unwrap()
    }

    #[tokio::test]
    async fn test_chunk_store_paging() {
        let store = InMemoryChunkStore::new();
        let chunks = chunks();
        let stats = store.save("doc1", &chunks).await.unwrap();
        assert_eq!(stats.total_chunks, chunks.len());

        let page = store.list("doc1", Some(1), 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].chunk_index, 1);

        let all = store.list("doc1", None, 0).await.unwrap();
        assert_eq!(all, chunks);
    }

    #[tokio::test]
    async fn test_chunk_store_missing_and_delete() {
        let store = InMemoryChunkStore::new();
        assert!(store.list("nope", None, 0).await.unwrap_err().is_not_found());
        assert!(store.save("doc1", &[]).await.is_err());

        store.save("doc1", &chunks()).await.unwrap();
        assert!(store.get("doc1", "missing").await.unwrap().is_none());
        assert!(store.delete("doc1").await.unwrap());
        assert!(!store.delete("doc1").await.unwrap());
        assert!(store.statistics("doc1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_index_store_lifecycle() {
        let store = InMemoryIndexStore::new();
        let config = IndexConfig {
            kind: IndexKind::Exhaustive,
            ..IndexConfig::default()
        };
        let summary = store
            .build(
                "doc1",
                vec![vec![1.0, 0.0], vec![0.0, 1.0]],
                vec!["e0".into(), "e1".into()],
                vec!["c0".into(), "c1".into()],
                &config,
                Some("mock".into()),
            )
            .await
            .unwrap();
        assert_eq!(summary.vector_count, 2);
        assert_eq!(summary.model_identifier.as_deref(), Some("mock"));

        let hits = store.search("doc1", &[0.0, 1.0], 1, 0.0).await.unwrap();
        assert_eq!(hits[0].chunk_id, "c1");

        assert!(store.delete("doc1").await.unwrap());
        assert!(store
            .search("doc1", &[0.0, 1.0], 1, 0.0)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(!store.delete("doc1").await.unwrap());
    }
}
