//! CLI command runners.
//!
//! Each `run_*` function backs one `docrag` subcommand. Results go to stdout
//! (as JSON with `--json`, otherwise as a short human-readable table); logs go
//! to stderr.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::io::Read;
use std::path::Path;

use docrag_core::chunk::split_text;
use docrag_core::embedding::EmbeddingRequest;
use docrag_core::error::Step;
use docrag_core::models::{ChunkStatistics, IndexSummary};
use docrag_core::pipeline::AnswerRequest;

use crate::ingest;
use crate::services::{self, run_cancellable, Services};

/// Read a document body from `path`, or from stdin when `path` is `-`.
pub fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Default document id for a file: its stem, or a fresh UUID for stdin.
pub fn document_id_for(path: &Path, explicit: Option<String>) -> String {
    explicit
        .or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .filter(|s| s != "-")
        })
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_stats(stats: &ChunkStatistics) {
    println!("  Document:    {}", stats.document_id);
    println!("  Chunks:      {}", stats.total_chunks);
    println!("  Characters:  {}", stats.total_characters);
    println!(
        "  Chunk size:  avg {:.1}, min {}, max {}",
        stats.average_chunk_size, stats.min_chunk_size, stats.max_chunk_size
    );
    println!("  Created:     {}", stats.created_at.to_rfc3339());
}

fn print_summary(summary: &IndexSummary) {
    println!(
        "  {:<36} {:>7} vectors  dim {:<5} {:?}/{:?}  {}",
        summary.document_id,
        summary.vector_count,
        summary.dimension,
        summary.kind,
        summary.metric,
        summary.model_identifier.as_deref().unwrap_or("-"),
    );
}

/// `docrag split`: chunk a file and store the chunks.
pub async fn run_split(services: &Services, path: &Path, document_id: String, json: bool) -> Result<()> {
    let text = read_input(path)?;
    let chunks = split_text(&document_id, &text, &services.config.chunking)?;
    let stats = services.chunks.save(&document_id, &chunks).await?;
    if json {
        return print_json(&stats);
    }
    println!("Split {} into {} chunks.", path.display(), stats.total_chunks);
    print_stats(&stats);
    Ok(())
}

/// `docrag chunks`: print a page of a document's chunks.
pub async fn run_chunks(
    services: &Services,
    document_id: &str,
    limit: Option<usize>,
    offset: usize,
    json: bool,
) -> Result<()> {
    let chunks = services.chunks.list(document_id, limit, offset).await?;
    if json {
        return print_json(&chunks);
    }
    for chunk in &chunks {
        println!(
            "#{} [{}..{}] sep={:?} {}",
            chunk.chunk_index,
            chunk.start_offset,
            chunk.end_offset,
            chunk.metadata.separator_used,
            chunk.chunk_id
        );
        println!("    {}", chunk.content.replace('\n', " "));
    }
    if chunks.is_empty() {
        println!("No chunks.");
    }
    Ok(())
}

/// `docrag embed`: (re)build a document's index from its stored chunks.
pub async fn run_embed(services: &Services, document_id: &str, json: bool) -> Result<()> {
    if !services.config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let summary = ingest::index_document(services, document_id).await?;
    if json {
        return print_json(&summary);
    }
    println!("Indexed {}:", document_id);
    print_summary(&summary);
    Ok(())
}

/// `docrag ingest`: split, store, embed, and index a file.
pub async fn run_ingest(services: &Services, path: &Path, document_id: String, json: bool) -> Result<()> {
    if !services.config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let text = read_input(path)?;
    let report = ingest::ingest_text(services, &document_id, &text).await?;
    if json {
        return print_json(&report);
    }
    println!("Ingested {} as {}.", path.display(), report.document_id);
    print_stats(&report.chunks);
    print_summary(&report.index);
    Ok(())
}

/// `docrag search`: similarity search over one document or all of them.
pub async fn run_search(
    services: &Services,
    query: &str,
    document_id: Option<&str>,
    top_k: usize,
    threshold: f32,
    json: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    let response = services
        .embedder
        .embed(&EmbeddingRequest {
            texts: vec![query.to_string()],
            model: None,
            normalize: services.config.retrieval.normalize_queries,
        })
        .await?;
    let vector = response
        .vectors
        .into_iter()
        .next()
        .context("Embedding provider returned no vector")?;

    let hits = match document_id {
        Some(doc) => services.indexes.search(doc, &vector, top_k, threshold).await?,
        None => services::global_search(services, vector, top_k, threshold).await?,
    };
    if json {
        return print_json(&hits);
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for hit in &hits {
        let content = services
            .chunks
            .get(&hit.document_id, &hit.chunk_id)
            .await
            .ok()
            .flatten()
            .map(|c| c.content)
            .unwrap_or_default();
        println!(
            "{}. [{:.3}] {} / {}",
            hit.rank, hit.score, hit.document_id, hit.chunk_id
        );
        if !content.is_empty() {
            println!("    {}", content.replace('\n', " "));
        }
    }
    Ok(())
}

/// `docrag ask`: retrieval-augmented answer.
pub async fn run_ask(services: &Services, request: AnswerRequest, json: bool) -> Result<()> {
    let pipeline = services.pipeline.clone();
    let response = run_cancellable(
        services.request_timeout(),
        Step::AnswerGeneration,
        move |flag| async move { pipeline.answer(&request, Some(flag.as_ref())).await },
    )
    .await?;
    if json {
        return print_json(&response);
    }
    println!("{}", response.answer);
    println!();
    println!("Confidence: {:.2}", response.confidence);
    for ctx in &response.contexts {
        println!(
            "  {}. [{:.3}] {} #{}",
            ctx.rank, ctx.score, ctx.document_id, ctx.chunk_index
        );
    }
    Ok(())
}

/// `docrag indexes`: list index summaries.
pub async fn run_indexes(services: &Services, json: bool) -> Result<()> {
    let summaries = services.registry.list().await?;
    if json {
        return print_json(&summaries);
    }
    if summaries.is_empty() {
        println!("No indexes.");
        return Ok(());
    }
    for summary in &summaries {
        print_summary(summary);
    }
    Ok(())
}

/// `docrag stats`: per-document statistics, or every document when no id
/// is given.
pub async fn run_stats(services: &Services, document_id: Option<&str>, json: bool) -> Result<()> {
    let documents = match document_id {
        Some(doc) => vec![services
            .chunks
            .statistics(doc)
            .await?
            .with_context(|| format!("No chunks for {}", doc))?],
        None => services.chunks.documents().await?,
    };
    if json {
        return print_json(&documents);
    }

    println!("docrag Storage Stats");
    println!("====================");
    println!();
    println!("  Root:        {}", services.config.storage.root.display());
    println!("  Documents:   {}", documents.len());
    for stats in &documents {
        println!();
        print_stats(stats);
        if let Some(index) = services.indexes.statistics(&stats.document_id).await? {
            println!(
                "  Index:       {} vectors, {} bytes",
                index.vector_count, index.size_bytes
            );
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct Deleted<'a> {
    document_id: &'a str,
    chunks_deleted: bool,
    index_deleted: bool,
}

/// `docrag delete`: remove a document's chunks and index.
pub async fn run_delete(services: &Services, document_id: &str, json: bool) -> Result<()> {
    let index_deleted = services.registry.delete(document_id).await?;
    let chunks_deleted = services.chunks.delete(document_id).await?;
    if json {
        return print_json(&Deleted {
            document_id,
            chunks_deleted,
            index_deleted,
        });
    }
    if !chunks_deleted && !index_deleted {
        println!("Nothing to delete for {}.", document_id);
    } else {
        println!(
            "Deleted {} (chunks: {}, index: {}).",
            document_id, chunks_deleted, index_deleted
        );
    }
    Ok(())
}
