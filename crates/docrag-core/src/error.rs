//! Error taxonomy shared by every retrieval component.
//!
//! Four families of failure are distinguished:
//!
//! | Variant | Meaning |
//! |---------|---------|
//! | [`RetrievalError::Input`] | Empty or malformed text, vector, dimension, or request field |
//! | [`RetrievalError::NotFound`] | No chunks or index exist for the given id |
//! | [`RetrievalError::Processing`] | A pipeline step failed; carries a [`Step`] tag |
//! | [`RetrievalError::UpstreamUnavailable`] | A collaborator (embedder, generator) could not be reached |
//!
//! `Io` and `Serialization` wrap plumbing errors raised by store
//! implementations; callers usually re-tag them with a [`Step`] via
//! [`RetrievalError::at_step`].

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Identifies the pipeline step in which a [`RetrievalError::Processing`]
/// failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    TextSplitting,
    ChunkSave,
    ChunkRetrieval,
    ChunkDeletion,
    DocumentListing,
    IndexCreation,
    IndexLoading,
    IndexDeletion,
    IndexListing,
    VectorSearch,
    EmbeddingGeneration,
    TextProcessingService,
    AnswerGeneration,
    Cancelled,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::TextSplitting => "text_splitting",
            Step::ChunkSave => "chunk_save",
            Step::ChunkRetrieval => "chunk_retrieval",
            Step::ChunkDeletion => "chunk_deletion",
            Step::DocumentListing => "document_listing",
            Step::IndexCreation => "index_creation",
            Step::IndexLoading => "index_loading",
            Step::IndexDeletion => "index_deletion",
            Step::IndexListing => "index_listing",
            Step::VectorSearch => "vector_search",
            Step::EmbeddingGeneration => "embedding_generation",
            Step::TextProcessingService => "text_processing_service",
            Step::AnswerGeneration => "answer_generation",
            Step::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-classification of [`RetrievalError::Input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    EmptyInput,
    InvalidConfig,
    InvalidIdentifier,
    LengthMismatch,
    DimensionMismatch,
    InvalidRequest,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::EmptyInput => "empty_input",
            InputKind::InvalidConfig => "invalid_config",
            InputKind::InvalidIdentifier => "invalid_identifier",
            InputKind::LengthMismatch => "length_mismatch",
            InputKind::DimensionMismatch => "dimension_mismatch",
            InputKind::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by chunking, storage, indexing, and the retrieval pipeline.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid input ({kind}): {message}")]
    Input { kind: InputKind, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{step} failed: {message}")]
    Processing { step: Step, message: String },

    #[error("{service} unavailable: {message}")]
    UpstreamUnavailable { service: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RetrievalError {
    pub fn input(kind: InputKind, message: impl Into<String>) -> Self {
        RetrievalError::Input {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        RetrievalError::NotFound(message.into())
    }

    pub fn processing(step: Step, message: impl Into<String>) -> Self {
        RetrievalError::Processing {
            step,
            message: message.into(),
        }
    }

    pub fn upstream(service: impl Into<String>, message: impl Into<String>) -> Self {
        RetrievalError::UpstreamUnavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RetrievalError::NotFound(_))
    }

    /// Re-tag plumbing failures (`Io`, `Serialization`) with a pipeline step.
    ///
    /// Input, not-found, and already-tagged processing errors pass through
    /// unchanged so that their classification survives propagation.
    pub fn at_step(self, step: Step) -> Self {
        match self {
            RetrievalError::Io(e) => RetrievalError::processing(step, e.to_string()),
            RetrievalError::Serialization(e) => RetrievalError::processing(step, e.to_string()),
            other => other,
        }
    }

    /// The step tag carried by this error, if any.
    pub fn step(&self) -> Option<Step> {
        match self {
            RetrievalError::Processing { step, .. } => Some(*step),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_step_retags_io() {
        let err = RetrievalError::Io(std::io::Error::other("disk full")).at_step(Step::ChunkSave);
        assert_eq!(err.step(), Some(Step::ChunkSave));
        assert!(err.to_string().contains("chunk_save"));
    }

    #[test]
    fn test_at_step_keeps_not_found() {
        let err = RetrievalError::not_found("doc").at_step(Step::VectorSearch);
        assert!(err.is_not_found());
    }

    #[test]
    fn test_display_includes_kind() {
        let err = RetrievalError::input(InputKind::DimensionMismatch, "expected 3, got 4");
        assert_eq!(
            err.to_string(),
            "invalid input (dimension_mismatch): expected 3, got 4"
        );
    }
}
