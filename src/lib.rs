//! # docrag
//!
//! Document chunking, per-document vector indexes, and retrieval-augmented
//! answers, exposed through a CLI and a JSON HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────┐
//! │   Text   │──▶│   Chunker    │──▶│  Chunk Store  │
//! └──────────┘   └──────────────┘   └──────┬────────┘
//!                                          │ embed
//!                                          ▼
//!                ┌──────────────┐   ┌───────────────┐
//!                │   Registry   │◀──│  Index Store  │
//!                └──────┬───────┘   └───────────────┘
//!                       ▼
//!                ┌──────────────┐   ┌───────────────┐
//!                │ Orchestrator │──▶│   Generator   │
//!                └──────────────┘   └───────────────┘
//! ```
//!
//! The storage-independent pieces (chunker, vector index, orchestrator)
//! live in `docrag-core`; this crate adds the file stores, HTTP clients,
//! configuration, CLI, and server.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`storage`] | Per-document locks and atomic file writes |
//! | [`chunk_store`] | File-backed chunk store |
//! | [`index_store`] | File-backed vector index store with a load cache |
//! | [`embedding`] | Embedding provider clients |
//! | [`generation`] | Answer generator clients |
//! | [`services`] | Runtime wiring and request deadlines |
//! | [`ingest`] | Split → save → embed → index |
//! | [`commands`] | CLI command runners |
//! | [`server`] | HTTP API |

pub mod chunk_store;
pub mod commands;
pub mod config;
pub mod embedding;
pub mod generation;
pub mod index_store;
pub mod ingest;
pub mod server;
pub mod services;
pub mod storage;
