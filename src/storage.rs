//! Filesystem helpers shared by the file-backed stores.
//!
//! # Layout
//!
//! ```text
//! {root}/
//!   chunks/{doc}.json                    ordered chunk array
//!   chunk_metadata/{doc}_metadata.json   chunk statistics
//!   indexes/{doc}.vidx                   vector index blob
//!   index_metadata/{doc}_mapping.json    slot → (embedding_id, chunk_id)
//!   index_metadata/{doc}_index.json      index summary
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;

/// Per-document reader/writer locks, created on first use.
#[derive(Default)]
pub struct DocumentLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, document_id: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(document_id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }

    /// Forget the lock for `document_id` if no caller still holds it.
    pub fn release(&self, document_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(document_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(document_id);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Temporary sibling path for an atomic write of `path`.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp-{}", uuid::Uuid::new_v4()));
    path.with_file_name(name)
}

/// Write `bytes` to a temporary file next to `path`, returning the
/// temporary path. The caller renames it into place.
pub async fn write_tmp(path: &Path, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let tmp = tmp_path(path);
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(tmp)
}

/// Remove `path`, returning whether it existed.
pub async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read `path`, mapping a missing file to `Ok(None)`.
pub async fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_tmp_and_remove() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("doc.json");
        let staged = write_tmp(&target, b"[]").await.unwrap();
        assert!(staged.file_name().unwrap().to_string_lossy().starts_with("doc.json.tmp-"));
        tokio::fs::rename(&staged, &target).await.unwrap();

        assert_eq!(read_optional(&target).await.unwrap().unwrap(), b"[]");
        assert!(remove_if_exists(&target).await.unwrap());
        assert!(!remove_if_exists(&target).await.unwrap());
        assert!(read_optional(&target).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_locks_are_shared_per_document() {
        let locks = DocumentLocks::new();
        let a = locks.get("a");
        let a2 = locks.get("a");
        assert!(Arc::ptr_eq(&a, &a2));
        let _write = a.write().await;
        assert!(a2.try_read().is_err());
        assert!(locks.get("b").try_read().is_ok());
    }

    #[tokio::test]
    async fn test_release_keeps_held_locks() {
        let locks = DocumentLocks::new();
        let held = locks.get("a");
        drop(locks.get("b"));
        assert_eq!(locks.len(), 2);

        locks.release("a");
        locks.release("b");
        locks.release("never-seen");
        assert_eq!(locks.len(), 1);
        assert!(Arc::ptr_eq(&held, &locks.get("a")));

        drop(held);
        locks.release("a");
        assert_eq!(locks.len(), 0);
    }
}
