//! File-backed [`IndexStore`] with an in-memory cache of loaded indexes.
//!
//! # Artifacts
//!
//! | File | Content |
//! |------|---------|
//! | `indexes/{doc}.vidx` | Binary index blob ([`VectorIndex::to_bytes`]) |
//! | `index_metadata/{doc}_mapping.json` | Ordered slot mapping |
//! | `index_metadata/{doc}_index.json` | [`IndexSummary`] |
//!
//! Builds and deletes hold the document's exclusive lock; searches hold the
//! shared side. A build stages all three artifacts, renames them into
//! place, and replaces the cached index. If staging fails, the staged files
//! are removed and the previous set is left alone; if a rename fails after
//! another has landed, every artifact for the document is removed. Listing
//! skips documents whose artifact set is incomplete.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use docrag_core::error::{Result, RetrievalError, Step};
use docrag_core::index::{IndexConfig, VectorIndex};
use docrag_core::models::{validate_document_id, IndexSummary, SearchHit, SlotMapping};
use docrag_core::store::IndexStore;

use crate::storage::{read_optional, remove_if_exists, write_tmp, DocumentLocks};

pub struct FileIndexStore {
    index_dir: PathBuf,
    metadata_dir: PathBuf,
    locks: DocumentLocks,
    cache: RwLock<HashMap<String, Arc<VectorIndex>>>,
}

impl FileIndexStore {
    /// Open (creating directories as needed) a store under `root`.
    pub fn open(root: &Path) -> std::io::Result<Self> {
        let index_dir = root.join("indexes");
        let metadata_dir = root.join("index_metadata");
        std::fs::create_dir_all(&index_dir)?;
        std::fs::create_dir_all(&metadata_dir)?;
        Ok(Self {
            index_dir,
            metadata_dir,
            locks: DocumentLocks::new(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn blob_path(&self, document_id: &str) -> PathBuf {
        self.index_dir.join(format!("{}.vidx", document_id))
    }

    fn mapping_path(&self, document_id: &str) -> PathBuf {
        self.metadata_dir
            .join(format!("{}_mapping.json", document_id))
    }

    fn summary_path(&self, document_id: &str) -> PathBuf {
        self.metadata_dir.join(format!("{}_index.json", document_id))
    }

    fn artifacts(&self, document_id: &str) -> [PathBuf; 3] {
        [
            self.blob_path(document_id),
            self.mapping_path(document_id),
            self.summary_path(document_id),
        ]
    }

    fn cached(&self, document_id: &str) -> Option<Arc<VectorIndex>> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(document_id)
            .cloned()
    }

    fn cache_put(&self, document_id: &str, index: Arc<VectorIndex>) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(document_id.to_string(), index);
    }

    fn cache_evict(&self, document_id: &str) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(document_id);
    }

    /// Load from disk, bypassing the cache.
    async fn load(&self, document_id: &str) -> Result<VectorIndex> {
        let loading = |e: std::io::Error| RetrievalError::from(e).at_step(Step::IndexLoading);
        let blob = read_optional(&self.blob_path(document_id))
            .await
            .map_err(loading)?;
        let mapping = read_optional(&self.mapping_path(document_id))
            .await
            .map_err(loading)?;
        let (blob, mapping) = match (blob, mapping) {
            (Some(blob), Some(mapping)) => (blob, mapping),
            _ => {
                return Err(RetrievalError::not_found(format!(
                    "no index for {}",
                    document_id
                )))
            }
        };
        let mapping: Vec<SlotMapping> = serde_json::from_slice(&mapping)
            .map_err(|e| RetrievalError::from(e).at_step(Step::IndexLoading))?;
        VectorIndex::from_bytes(document_id, &blob, mapping)
    }

    async fn persist(&self, index: &VectorIndex, summary: &IndexSummary) -> Result<()> {
        let document_id = index.document_id();
        let [blob_path, mapping_path, summary_path] = self.artifacts(document_id);

        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(3);
        let staging: Result<()> = async {
            staged.push((write_tmp(&blob_path, &index.to_bytes()).await?, blob_path.clone()));
            staged.push((
                write_tmp(&mapping_path, &serde_json::to_vec(index.mapping())?).await?,
                mapping_path.clone(),
            ));
            staged.push((
                write_tmp(&summary_path, &serde_json::to_vec_pretty(summary)?).await?,
                summary_path.clone(),
            ));
            Ok(())
        }
        .await;

        // Nothing has replaced the previous set yet; it stays as it was.
        if let Err(e) = staging {
            for (tmp, _) in &staged {
                let _ = remove_if_exists(tmp).await;
            }
            return Err(e.at_step(Step::IndexCreation));
        }

        for (renamed, (tmp, target)) in staged.iter().enumerate() {
            if let Err(e) = tokio::fs::rename(tmp, target).await {
                for (tmp, _) in &staged[renamed..] {
                    let _ = remove_if_exists(tmp).await;
                }
                // Old and new artifacts are now mixed on disk.
                if renamed > 0 {
                    warn!(document_id, "removing partially replaced index artifacts");
                    for path in self.artifacts(document_id) {
                        let _ = remove_if_exists(&path).await;
                    }
                    self.cache_evict(document_id);
                }
                return Err(RetrievalError::from(e).at_step(Step::IndexCreation));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IndexStore for FileIndexStore {
    async fn build(
        &self,
        document_id: &str,
        vectors: Vec<Vec<f32>>,
        embedding_ids: Vec<String>,
        chunk_ids: Vec<String>,
        config: &IndexConfig,
        model_identifier: Option<String>,
    ) -> Result<IndexSummary> {
        validate_document_id(document_id)?;
        let lock = self.locks.get(document_id);
        let _guard = lock.write().await;

        let started = Instant::now();
        let index = VectorIndex::build(document_id, vectors, embedding_ids, chunk_ids, config)?;
        let size_bytes = index.to_bytes().len() as u64;
        let summary = index.summary(
            model_identifier,
            size_bytes,
            started.elapsed().as_millis() as u64,
        );

        self.persist(&index, &summary).await?;
        self.cache_put(document_id, Arc::new(index));

        info!(
            document_id,
            vectors = summary.vector_count,
            kind = summary.kind.as_str(),
            elapsed_ms = summary.build_millis,
            "built index"
        );
        Ok(summary)
    }

    async fn search(
        &self,
        document_id: &str,
        query: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        validate_document_id(document_id)?;
        let lock = self.locks.get(document_id);
        let loaded = {
            let _guard = lock.read().await;
            match self.cached(document_id) {
                Some(index) => Ok(index),
                None => self.load(document_id).await.map(|index| {
                    let index = Arc::new(index);
                    debug!(document_id, "loaded index into cache");
                    self.cache_put(document_id, Arc::clone(&index));
                    index
                }),
            }
        };
        drop(lock);
        if matches!(&loaded, Err(e) if e.is_not_found()) {
            self.locks.release(document_id);
        }
        loaded?.search(query, top_k, threshold)
    }

    async fn delete(&self, document_id: &str) -> Result<bool> {
        validate_document_id(document_id)?;
        let lock = self.locks.get(document_id);
        let guard = lock.write().await;

        self.cache_evict(document_id);
        let mut removed = false;
        for path in self.artifacts(document_id) {
            removed |= remove_if_exists(&path)
                .await
                .map_err(|e| RetrievalError::from(e).at_step(Step::IndexDeletion))?;
        }
        drop(guard);
        drop(lock);
        self.locks.release(document_id);

        if removed {
            info!(document_id, "deleted index");
        }
        Ok(removed)
    }

    async fn statistics(&self, document_id: &str) -> Result<Option<IndexSummary>> {
        validate_document_id(document_id)?;
        let bytes = read_optional(&self.summary_path(document_id))
            .await
            .map_err(|e| RetrievalError::from(e).at_step(Step::IndexLoading))?;
        match bytes {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .map_err(|e| RetrievalError::from(e).at_step(Step::IndexLoading))?,
            )),
            None => Ok(None),
        }
    }

    async fn summaries(&self) -> Result<Vec<IndexSummary>> {
        let listing = |e: std::io::Error| RetrievalError::from(e).at_step(Step::IndexListing);
        let mut entries = tokio::fs::read_dir(&self.metadata_dir)
            .await
            .map_err(listing)?;

        let mut all = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(listing)? {
            let name = entry.file_name().to_string_lossy().to_string();
            let document_id = match name.strip_suffix("_index.json") {
                Some(id) if validate_document_id(id).is_ok() => id.to_string(),
                _ => continue,
            };
            if !self.blob_path(&document_id).exists() || !self.mapping_path(&document_id).exists() {
                warn!(document_id = %document_id, "skipping incomplete index artifacts");
                continue;
            }
            let parsed = match tokio::fs::read(entry.path()).await {
                Ok(bytes) => serde_json::from_slice::<IndexSummary>(&bytes).ok(),
                Err(_) => None,
            };
            match parsed {
                Some(summary) => all.push(summary),
                None => warn!(document_id = %document_id, "skipping unreadable index summary"),
            }
        }

        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        Ok(all)
    }
}
