//! Runtime wiring: stores, providers, registry, and pipeline built once
//! from [`Config`] and shared by the CLI commands and the HTTP server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use docrag_core::embedding::{AnswerGenerator, EmbeddingProvider};
use docrag_core::error::{RetrievalError, Step};
use docrag_core::models::SearchHit;
use docrag_core::pipeline::RetrievalPipeline;
use docrag_core::registry::IndexRegistry;
use docrag_core::store::{ChunkStore, IndexStore};

use crate::chunk_store::FileChunkStore;
use crate::config::Config;
use crate::embedding::create_provider;
use crate::generation::create_generator;
use crate::index_store::FileIndexStore;

#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub chunks: Arc<dyn ChunkStore>,
    pub indexes: Arc<dyn IndexStore>,
    pub registry: IndexRegistry,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub generator: Arc<dyn AnswerGenerator>,
    pub pipeline: RetrievalPipeline,
}

impl Services {
    /// Open file stores under `storage.root` and create the configured
    /// embedding provider and answer generator.
    pub fn from_config(config: Config) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        Self::with_providers(config, embedder, generator)
    }

    /// Like [`from_config`](Self::from_config) with caller-supplied providers.
    pub fn with_providers(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn AnswerGenerator>,
    ) -> Result<Self> {
        let root = &config.storage.root;
        let chunks: Arc<dyn ChunkStore> = Arc::new(
            FileChunkStore::open(root)
                .with_context(|| format!("Failed to open chunk store at {}", root.display()))?,
        );
        let indexes: Arc<dyn IndexStore> = Arc::new(
            FileIndexStore::open(root)
                .with_context(|| format!("Failed to open index store at {}", root.display()))?,
        );
        let registry = IndexRegistry::new(Arc::clone(&indexes));
        let pipeline = RetrievalPipeline::new(
            Arc::clone(&embedder),
            Arc::clone(&generator),
            Arc::clone(&chunks),
            registry.clone(),
            config.retrieval.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            chunks,
            indexes,
            registry,
            embedder,
            generator,
            pipeline,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.request_timeout_secs)
    }
}

/// Raises its flag when dropped, so work observing the flag stops once the
/// owning request goes away.
pub struct CancelOnDrop(pub Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Run `work` on a spawned task with a cancellation flag and a deadline.
///
/// If the deadline passes or the returned future is dropped, the flag is
/// raised: the task stops issuing new per-document work, and whatever it
/// was running completes and is discarded. A task that panics fails with
/// `Processing(step)`.
pub async fn run_cancellable<T, F, Fut>(
    timeout: Duration,
    step: Step,
    work: F,
) -> docrag_core::Result<T>
where
    T: Send + 'static,
    F: FnOnce(Arc<AtomicBool>) -> Fut,
    Fut: std::future::Future<Output = docrag_core::Result<T>> + Send + 'static,
{
    let flag = Arc::new(AtomicBool::new(false));
    let guard = CancelOnDrop(Arc::clone(&flag));
    let handle = tokio::spawn(work(Arc::clone(&flag)));

    let result = match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(RetrievalError::processing(
            step,
            format!("{} task failed: {}", step.as_str(), join_err),
        )),
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "request deadline exceeded");
            Err(RetrievalError::processing(
                Step::Cancelled,
                "deadline exceeded",
            ))
        }
    };
    drop(guard);
    result
}

/// Global search bounded by the server deadline.
pub async fn global_search(
    services: &Services,
    query: Vec<f32>,
    top_k: usize,
    threshold: f32,
) -> docrag_core::Result<Vec<SearchHit>> {
    let registry = services.registry.clone();
    run_cancellable(
        services.request_timeout(),
        Step::VectorSearch,
        move |flag| async move {
            registry
                .global_search(&query, top_k, threshold, Some(flag.as_ref()))
                .await
        },
    )
    .await
}
