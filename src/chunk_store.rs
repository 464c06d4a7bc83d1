//! File-backed [`ChunkStore`].
//!
//! Each document's chunks live in `chunks/{doc}.json` with statistics in
//! `chunk_metadata/{doc}_metadata.json`. Saves stage both files and rename
//! them into place under the document's write lock. A failure before the
//! first rename leaves the previous pair untouched; a failure between the
//! renames removes both files for the document.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use docrag_core::error::{InputKind, Result, RetrievalError, Step};
use docrag_core::models::{validate_document_id, Chunk, ChunkStatistics};
use docrag_core::store::{page, ChunkStore};

use crate::storage::{read_optional, remove_if_exists, write_tmp, DocumentLocks};

pub struct FileChunkStore {
    chunks_dir: PathBuf,
    metadata_dir: PathBuf,
    locks: DocumentLocks,
}

impl FileChunkStore {
    /// Open (creating directories as needed) a store under `root`.
    pub fn open(root: &Path) -> std::io::Result<Self> {
        let chunks_dir = root.join("chunks");
        let metadata_dir = root.join("chunk_metadata");
        std::fs::create_dir_all(&chunks_dir)?;
        std::fs::create_dir_all(&metadata_dir)?;
        Ok(Self {
            chunks_dir,
            metadata_dir,
            locks: DocumentLocks::new(),
        })
    }

    fn chunks_path(&self, document_id: &str) -> PathBuf {
        self.chunks_dir.join(format!("{}.json", document_id))
    }

    fn metadata_path(&self, document_id: &str) -> PathBuf {
        self.metadata_dir
            .join(format!("{}_metadata.json", document_id))
    }

    async fn load(&self, document_id: &str) -> Result<Vec<Chunk>> {
        validate_document_id(document_id)?;
        let bytes = read_optional(&self.chunks_path(document_id))
            .await
            .map_err(|e| RetrievalError::from(e).at_step(Step::ChunkRetrieval))?
            .ok_or_else(|| RetrievalError::not_found(format!("no chunks for {}", document_id)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RetrievalError::from(e).at_step(Step::ChunkRetrieval))
    }

    /// [`load`](Self::load) under the document's read lock. The lock entry
    /// is dropped again when the document does not exist.
    async fn load_locked(&self, document_id: &str) -> Result<Vec<Chunk>> {
        validate_document_id(document_id)?;
        let lock = self.locks.get(document_id);
        let loaded = {
            let _guard = lock.read().await;
            self.load(document_id).await
        };
        drop(lock);
        if matches!(&loaded, Err(e) if e.is_not_found()) {
            self.locks.release(document_id);
        }
        loaded
    }

    async fn write_all(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        stats: &ChunkStatistics,
    ) -> Result<()> {
        let chunks_path = self.chunks_path(document_id);
        let metadata_path = self.metadata_path(document_id);

        let chunks_tmp = write_tmp(&chunks_path, &serde_json::to_vec_pretty(chunks)?).await?;
        let metadata_tmp = match write_tmp(&metadata_path, &serde_json::to_vec_pretty(stats)?).await
        {
            Ok(tmp) => tmp,
            Err(e) => {
                let _ = remove_if_exists(&chunks_tmp).await;
                return Err(e.into());
            }
        };

        if let Err(e) = tokio::fs::rename(&chunks_tmp, &chunks_path).await {
            let _ = remove_if_exists(&chunks_tmp).await;
            let _ = remove_if_exists(&metadata_tmp).await;
            return Err(e.into());
        }
        // The new chunk file has landed; a failure now leaves a mixed pair.
        if let Err(e) = tokio::fs::rename(&metadata_tmp, &metadata_path).await {
            for path in [&metadata_tmp, &chunks_path, &metadata_path] {
                let _ = remove_if_exists(path).await;
            }
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for FileChunkStore {
    async fn save(&self, document_id: &str, chunks: &[Chunk]) -> Result<ChunkStatistics> {
        validate_document_id(document_id)?;
        if chunks.is_empty() {
            return Err(RetrievalError::input(
                InputKind::EmptyInput,
                "no chunks to save",
            ));
        }

        let lock = self.locks.get(document_id);
        let _guard = lock.write().await;

        let stats = ChunkStatistics::from_chunks(document_id, chunks);
        self.write_all(document_id, chunks, &stats)
            .await
            .map_err(|e| e.at_step(Step::ChunkSave))?;

        info!(document_id, chunks = chunks.len(), "saved chunks");
        Ok(stats)
    }

    async fn list(
        &self,
        document_id: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<Chunk>> {
        Ok(page(self.load_locked(document_id).await?, limit, offset))
    }

    async fn get(&self, document_id: &str, chunk_id: &str) -> Result<Option<Chunk>> {
        Ok(self
            .load_locked(document_id)
            .await?
            .into_iter()
            .find(|c| c.chunk_id == chunk_id))
    }

    async fn delete(&self, document_id: &str) -> Result<bool> {
        validate_document_id(document_id)?;
        let lock = self.locks.get(document_id);
        let guard = lock.write().await;

        let removed_chunks = remove_if_exists(&self.chunks_path(document_id))
            .await
            .map_err(|e| RetrievalError::from(e).at_step(Step::ChunkDeletion))?;
        let removed_meta = remove_if_exists(&self.metadata_path(document_id))
            .await
            .map_err(|e| RetrievalError::from(e).at_step(Step::ChunkDeletion))?;

        drop(guard);
        drop(lock);
        self.locks.release(document_id);

        let removed = removed_chunks || removed_meta;
        if removed {
            info!(document_id, "deleted chunks");
        }
        Ok(removed)
    }

    async fn statistics(&self, document_id: &str) -> Result<Option<ChunkStatistics>> {
        validate_document_id(document_id)?;
        let bytes = read_optional(&self.metadata_path(document_id))
            .await
            .map_err(|e| RetrievalError::from(e).at_step(Step::ChunkRetrieval))?;
        match bytes {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .map_err(|e| RetrievalError::from(e).at_step(Step::ChunkRetrieval))?,
            )),
            None => Ok(None),
        }
    }

    async fn documents(&self) -> Result<Vec<ChunkStatistics>> {
        let listing = |e: std::io::Error| RetrievalError::from(e).at_step(Step::DocumentListing);
        let mut entries = tokio::fs::read_dir(&self.metadata_dir)
            .await
            .map_err(listing)?;

        let mut all = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(listing)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with("_metadata.json") {
                continue;
            }
            let parsed = match tokio::fs::read(entry.path()).await {
                Ok(bytes) => serde_json::from_slice::<ChunkStatistics>(&bytes).ok(),
                Err(_) => None,
            };
            match parsed {
                Some(stats) => all.push(stats),
                None => warn!(file = %name, "skipping unreadable chunk metadata"),
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

#[cfg(test)]
mod tests {
    use super::*;
    use docrag_core::chunk::{split_text, ChunkerConfig};
    use tempfile::TempDir;

    fn chunks(doc: &str) -> Vec<Chunk> {
        let config = ChunkerConfig {
            chunk_size: 40,
            chunk_overlap: 5,
            min_chunk_size: 1,
            ..ChunkerConfig::default()
        };
        split_text(
            doc,
            "Rust is a systems language. It has ownership. It has traits and generics.",
            &config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_list_get_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FileChunkStore::open(tmp.path()).unwrap();
        let saved = chunks("doc1");

        let stats = store.save("doc1", &saved).await.unwrap();
        assert_eq!(stats.total_chunks, saved.len());
        assert!(tmp.path().join("chunks/doc1.json").exists());
        assert!(tmp.path().join("chunk_metadata/doc1_metadata.json").exists());

        assert_eq!(store.list("doc1", None, 0).await.unwrap(), saved);
        let second = store.list("doc1", Some(1), 1).await.unwrap();
        assert_eq!(second[0].chunk_index, 1);

        let found = store.get("doc1", &saved[0].chunk_id).await.unwrap();
        assert_eq!(found.as_ref(), Some(&saved[0]));
        assert!(store.get("doc1", "nope").await.unwrap().is_none());

        assert!(store.delete("doc1").await.unwrap());
        assert!(!store.delete("doc1").await.unwrap());
        assert!(store.list("doc1", None, 0).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_documents_newest_first() {
        let tmp = TempDir::new().unwrap();
        let store = FileChunkStore::open(tmp.path()).unwrap();
        store.save("older", &chunks("older")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        store.save("newer", &chunks("newer")).await.unwrap();

        let docs = store.documents().await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.document_id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older"]);
    }

    #[tokio::test]
    async fn test_rejects_bad_ids_and_empty_saves() {
        let tmp = TempDir::new().unwrap();
        let store = FileChunkStore::open(tmp.path()).unwrap();
        assert!(store.save("../escape", &chunks("x")).await.is_err());
        assert!(store.save("doc1", &[]).await.is_err());
        assert!(store.list("../escape", None, 0).await.is_err());
        assert!(store.statistics("doc1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_previous_chunks() {
        let tmp = TempDir::new().unwrap();
        let store = FileChunkStore::open(tmp.path()).unwrap();
        let original = chunks("doc1");
        store.save("doc1", &original).await.unwrap();

        // Staging the metadata fails once its directory is not a directory.
        let meta = tmp.path().join("chunk_metadata");
        let aside = tmp.path().join("chunk_metadata.aside");
        std::fs::rename(&meta, &aside).unwrap();
        std::fs::write(&meta, b"").unwrap();

        let replacement = &original[..1];
        let err = store.save("doc1", replacement).await.unwrap_err();
        assert_eq!(err.step(), Some(Step::ChunkSave));

        std::fs::remove_file(&meta).unwrap();
        std::fs::rename(&aside, &meta).unwrap();
        assert_eq!(store.list("doc1", None, 0).await.unwrap(), original);
        assert_eq!(
            store.statistics("doc1").await.unwrap().unwrap().total_chunks,
            original.len()
        );
    }

    #[tokio::test]
    async fn test_failed_rename_removes_both_files() {
        let tmp = TempDir::new().unwrap();
        let store = FileChunkStore::open(tmp.path()).unwrap();
        store.save("doc1", &chunks("doc1")).await.unwrap();

        // The metadata is renamed second and cannot replace a directory.
        let metadata = tmp.path().join("chunk_metadata/doc1_metadata.json");
        std::fs::remove_file(&metadata).unwrap();
        std::fs::create_dir(&metadata).unwrap();

        let err = store.save("doc1", &chunks("doc1")).await.unwrap_err();
        assert_eq!(err.step(), Some(Step::ChunkSave));
        assert!(!tmp.path().join("chunks/doc1.json").exists());
        assert!(store.list("doc1", None, 0).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_reads_of_unknown_documents_leave_no_locks() {
        let tmp = TempDir::new().unwrap();
        let store = FileChunkStore::open(tmp.path()).unwrap();
        for i in 0..10 {
            let doc = format!("missing-{}", i);
            assert!(store.list(&doc, None, 0).await.unwrap_err().is_not_found());
            assert!(store.get(&doc, "c").await.unwrap_err().is_not_found());
        }
        assert!(store.list("../escape", None, 0).await.is_err());
        assert!(store.get(&"x".repeat(4096), "c").await.is_err());
        assert_eq!(store.locks.len(), 0);

        store.save("doc1", &chunks("doc1")).await.unwrap();
        assert!(store.delete("doc1").await.unwrap());
        assert_eq!(store.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_after_save() {
        let tmp = TempDir::new().unwrap();
        let store = FileChunkStore::open(tmp.path()).unwrap();
        store.save("doc1", &chunks("doc1")).await.unwrap();
        let leftovers = std::fs::read_dir(tmp.path().join("chunks"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .contains(".tmp-")
            })
            .count();
        assert_eq!(leftovers, 0);
    }
}
