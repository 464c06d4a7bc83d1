//! # docrag core
//!
//! Pure retrieval logic for docrag: data models, the error taxonomy,
//! chunking, per-document vector indexes, store abstractions, the index
//! registry, and the retrieval pipeline.
//!
//! This crate contains no tokio runtime, filesystem I/O, or network
//! dependencies. Persistence and provider clients live in the `docrag`
//! app crate and plug in through the [`store`] and [`embedding`] traits.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod store;

pub use error::{InputKind, Result, RetrievalError, Step};
