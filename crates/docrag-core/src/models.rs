//! Core data models shared by the chunker, stores, indexes, and pipeline.
//!
//! Every type here is serializable: chunks and summaries are persisted as
//! JSON by the file-backed stores and returned verbatim by the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{InputKind, Result, RetrievalError};

/// A contiguous, bounded span of a document's text; the unit of retrieval.
///
/// Offsets are character (not byte) positions into the preprocessed text,
/// with `start_offset < end_offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub chunk_index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub metadata: ChunkMetadata,
}

/// Per-chunk bookkeeping produced by the chunker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Character length of the trimmed content.
    pub length: usize,
    /// The separator the cut landed on, or `"none"` for a hard cut.
    pub separator_used: String,
    /// SHA-256 of the content, hex encoded.
    pub content_hash: String,
}

/// Aggregate size statistics for one document's chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkStatistics {
    pub document_id: String,
    pub total_chunks: usize,
    pub total_characters: usize,
    pub average_chunk_size: f64,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub created_at: DateTime<Utc>,
}

impl ChunkStatistics {
    /// Compute statistics over `chunks`, stamped with the current time.
    pub fn from_chunks(document_id: &str, chunks: &[Chunk]) -> Self {
        let sizes: Vec<usize> = chunks.iter().map(|c| c.content.chars().count()).collect();
        let total: usize = sizes.iter().sum();
        Self {
            document_id: document_id.to_string(),
            total_chunks: sizes.len(),
            total_characters: total,
            average_chunk_size: if sizes.is_empty() {
                0.0
            } else {
                total as f64 / sizes.len() as f64
            },
            min_chunk_size: sizes.iter().copied().min().unwrap_or(0),
            max_chunk_size: sizes.iter().copied().max().unwrap_or(0),
            created_at: Utc::now(),
        }
    }
}

/// An embedding produced by the external provider for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub embedding_id: String,
    pub chunk_id: String,
    pub document_id: String,
    pub values: Vec<f32>,
    pub dimension: usize,
    pub model_identifier: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl EmbeddingVector {
    pub fn new(chunk: &Chunk, values: Vec<f32>, model_identifier: &str) -> Self {
        Self {
            embedding_id: uuid::Uuid::new_v4().to_string(),
            chunk_id: chunk.chunk_id.clone(),
            document_id: chunk.document_id.clone(),
            dimension: values.len(),
            values,
            model_identifier: model_identifier.to_string(),
            created_at: Utc::now(),
            metadata: serde_json::json!({ "chunk_index": chunk.chunk_index }),
        }
    }
}

/// Index structure used for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Brute-force scan over every vector; always exact.
    Exhaustive,
    /// Inverted lists over a k-means coarse quantizer.
    Clustered,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Exhaustive => "exhaustive",
            IndexKind::Clustered => "clustered",
        }
    }
}

/// Similarity metric. Scores are always "higher is better".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Dot product; cosine similarity when vectors are normalized.
    InnerProduct,
    /// Reported as `1 / (1 + squared_distance)`.
    Euclidean,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::InnerProduct => "inner_product",
            Metric::Euclidean => "euclidean",
        }
    }
}

/// Maps an internal index slot back to its embedding and chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMapping {
    pub embedding_id: String,
    pub chunk_id: String,
}

/// Summary metadata for one document's index, used for discovery
/// without loading the vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub document_id: String,
    pub vector_count: usize,
    pub dimension: usize,
    /// Structure actually built (after any small-batch fallback).
    pub kind: IndexKind,
    /// Structure the caller asked for.
    pub requested_kind: IndexKind,
    pub metric: Metric,
    pub normalized: bool,
    pub nlist: Option<usize>,
    pub nprobe: Option<usize>,
    #[serde(default)]
    pub model_identifier: Option<String>,
    pub size_bytes: u64,
    pub build_millis: u64,
    pub created_at: DateTime<Utc>,
}

/// A single ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub embedding_id: String,
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
    /// 1-based position in the result list.
    pub rank: usize,
}

/// A search hit resolved to chunk content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub content: String,
    pub score: f32,
    pub rank: usize,
}

/// Reject identifiers that cannot safely name on-disk artifacts.
///
/// Document ids become file names, so only ASCII alphanumerics, `-`, `_`
/// and `.` are accepted, and the id may not start with `.`.
pub fn validate_document_id(document_id: &str) -> Result<()> {
    let valid = !document_id.is_empty()
        && document_id.len() <= 128
        && !document_id.starts_with('.')
        && document_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RetrievalError::input(
            InputKind::InvalidIdentifier,
            format!("invalid document id: {:?}", document_id),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_document_id() {
        assert!(validate_document_id("3f2b-doc_1.v2").is_ok());
        assert!(validate_document_id("").is_err());
        assert!(validate_document_id("../etc").is_err());
        assert!(validate_document_id(".hidden").is_err());
        assert!(validate_document_id("a/b").is_err());
    }

    #[test]
    fn test_statistics_empty() {
        let stats = ChunkStatistics::from_chunks("doc", &[]);
        assert_eq!(stats.total_chunks, 0);
        assert_eq!(stats.average_chunk_size, 0.0);
        assert_eq!(stats.min_chunk_size, 0);
    }

    #[test]
    fn test_kind_serde_names() {
        assert_eq!(
            serde_json::to_string(&IndexKind::Clustered).unwrap(),
            "\"clustered\""
        );
        assert_eq!(
            serde_json::to_string(&Metric::InnerProduct).unwrap(),
            "\"inner_product\""
        );
    }
}
