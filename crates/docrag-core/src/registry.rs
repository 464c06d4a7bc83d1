//! Index registry: discovery, deletion, and fan-out search across every
//! per-document index.
//!
//! Global search runs the per-document searches one after another, merges
//! the hits, and re-ranks them:
//!
//! 1. List all indexes (newest first).
//! 2. For each, check the cancellation flag, then search with the caller's
//!    `top_k` and `threshold`. Indexes that vanished, fail to load, or were
//!    built for a different dimension are skipped with a warning.
//! 3. Stable-sort the union by descending score, truncate to `top_k`, and
//!    re-assign `rank` 1..n across the merged list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{InputKind, Result, RetrievalError, Step};
use crate::models::{IndexSummary, SearchHit};
use crate::store::IndexStore;

#[derive(Clone)]
pub struct IndexRegistry {
    store: Arc<dyn IndexStore>,
}

impl IndexRegistry {
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    /// Summaries of every index, newest first.
    pub async fn list(&self) -> Result<Vec<IndexSummary>> {
        self.store
            .summaries()
            .await
            .map_err(|e| e.at_step(Step::IndexListing))
    }

    pub async fn delete(&self, document_id: &str) -> Result<bool> {
        self.store.delete(document_id).await
    }

    /// Search every index and merge the results.
    ///
    /// When `cancel` is raised, no further per-document searches are issued
    /// and the call fails with `Processing(cancelled)`.
    pub async fn global_search(
        &self,
        query: &[f32],
        top_k: usize,
        threshold: f32,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<SearchHit>> {
        let summaries = self.list().await?;
        let mut merged: Vec<SearchHit> = Vec::new();

        for summary in &summaries {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(RetrievalError::processing(
                    Step::Cancelled,
                    "global search cancelled",
                ));
            }

            match self
                .store
                .search(&summary.document_id, query, top_k, threshold)
                .await
            {
                Ok(hits) => merged.extend(hits),
                Err(e) if is_skippable(&e) => {
                    warn!(document_id = %summary.document_id, error = %e, "skipping index");
                }
                Err(e) => return Err(e.at_step(Step::VectorSearch)),
            }
        }

        if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(RetrievalError::processing(
                Step::Cancelled,
                "global search cancelled",
            ));
        }

        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged.truncate(top_k);
        for (i, hit) in merged.iter_mut().enumerate() {
            hit.rank = i + 1;
        }

        debug!(
            indexes = summaries.len(),
            hits = merged.len(),
            "global search complete"
        );
        Ok(merged)
    }
}

fn is_skippable(e: &RetrievalError) -> bool {
    match e {
        RetrievalError::NotFound(_) => true,
        RetrievalError::Processing { step, .. } => *step == Step::IndexLoading,
        RetrievalError::Input { kind, .. } => *kind == InputKind::DimensionMismatch,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexConfig;
    use crate::models::IndexKind;
    use crate::store::memory::InMemoryIndexStore;

    async fn registry() -> IndexRegistry {
        let store = Arc::new(InMemoryIndexStore::new());
        let config = IndexConfig {
            kind: IndexKind::Exhaustive,
            ..IndexConfig::default()
        };
        let docs = [
            ("a", vec![vec![1.0, 0.0], vec![0.7, 0.7]]),
            ("b", vec![vec![0.9, 0.1], vec![0.0, 1.0]]),
            ("c", vec![vec![1.0, 0.0, 0.0]]),
        ];
        for (doc, vectors) in docs {
            let n = vectors.len();
            store
                .build(
                    doc,
                    vectors,
                    (0..n).map(|i| format!("{}-e{}", doc, i)).collect(),
                    (0..n).map(|i| format!("{}-c{}", doc, i)).collect(),
                    &config,
                    None,
                )
                .await
                .unwrap();
        }
        IndexRegistry::new(store)
    }

    #[tokio::test]
    async fn test_global_search_merges_and_reranks() {
        let registry = registry().await;
        let hits = registry
            .global_search(&[1.0, 0.0], 3, 0.0, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].chunk_id, "a-c0");
        assert_eq!(hits[1].chunk_id, "b-c0");
        let ranks: Vec<usize> = hits.iter().map(|h| h.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        for w in hits.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
    }

    #[tokio::test]
    async fn test_global_search_is_subset_of_per_document() {
        let registry = registry().await;
        let global = registry
            .global_search(&[0.6, 0.8], 10, 0.1, None)
            .await
            .unwrap();
        let mut union = Vec::new();
        for doc in ["a", "b"] {
            union.extend(registry.store().search(doc, &[0.6, 0.8], 10, 0.1).await.unwrap());
        }
        for hit in &global {
            assert!(union
                .iter()
                .any(|h| h.chunk_id == hit.chunk_id && h.score == hit.score));
        }
    }

    #[tokio::test]
    async fn test_global_search_cancelled() {
        let registry = registry().await;
        let flag = AtomicBool::new(true);
        let err = registry
            .global_search(&[1.0, 0.0], 3, 0.0, Some(&flag))
            .await
            .unwrap_err();
        assert_eq!(err.step(), Some(Step::Cancelled));
    }

    /// Raises the flag from inside the first per-document search.
    struct CancelAfterFirst {
        inner: Arc<dyn IndexStore>,
        flag: Arc<AtomicBool>,
        searched: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl IndexStore for CancelAfterFirst {
        async fn build(
            &self,
            document_id: &str,
            vectors: Vec<Vec<f32>>,
            embedding_ids: Vec<String>,
            chunk_ids: Vec<String>,
            config: &IndexConfig,
            model_identifier: Option<String>,
        ) -> Result<IndexSummary> {
            self.inner
                .build(document_id, vectors, embedding_ids, chunk_ids, config, model_identifier)
                .await
        }

        async fn search(
            &self,
            document_id: &str,
            query: &[f32],
            top_k: usize,
            threshold: f32,
        ) -> Result<Vec<SearchHit>> {
            self.searched.lock().unwrap().push(document_id.to_string());
            self.flag.store(true, Ordering::Relaxed);
            self.inner.search(document_id, query, top_k, threshold).await
        }

        async fn delete(&self, document_id: &str) -> Result<bool> {
            self.inner.delete(document_id).await
        }

        async fn statistics(&self, document_id: &str) -> Result<Option<IndexSummary>> {
            self.inner.statistics(document_id).await
        }

        async fn summaries(&self) -> Result<Vec<IndexSummary>> {
            self.inner.summaries().await
        }
    }

    #[tokio::test]
    async fn test_cancel_during_fan_out_stops_further_searches() {
        let flag = Arc::new(AtomicBool::new(false));
        let store = Arc::new(CancelAfterFirst {
            inner: Arc::clone(registry().await.store()),
            flag: Arc::clone(&flag),
            searched: std::sync::Mutex::new(Vec::new()),
        });
        let registry = IndexRegistry::new(store.clone());

        let err = registry
            .global_search(&[1.0, 0.0], 3, 0.0, Some(flag.as_ref()))
            .await
            .unwrap_err();
        assert_eq!(err.step(), Some(Step::Cancelled));
        assert_eq!(store.searched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let registry = registry().await;
        assert_eq!(registry.list().await.unwrap().len(), 3);
        assert!(registry.delete("a").await.unwrap());
        assert!(!registry.delete("a").await.unwrap());
        assert_eq!(registry.list().await.unwrap().len(), 2);
    }
}
