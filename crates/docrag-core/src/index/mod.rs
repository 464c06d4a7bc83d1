//! Per-document vector index.
//!
//! A [`VectorIndex`] holds one document's chunk embeddings behind one of two
//! interchangeable structures:
//!
//! | Kind | Structure | Search |
//! |------|-----------|--------|
//! | [`IndexKind::Exhaustive`] | [`FlatIndex`] | Every slot scored; exact |
//! | [`IndexKind::Clustered`] | [`ClusteredIndex`] | `nprobe` nearest of `nlist` inverted lists |
//!
//! A clustered build over fewer than `nlist` vectors falls back to the
//! exhaustive structure. Slots are numbered in insertion order and map back
//! to `(embedding_id, chunk_id)` through [`SlotMapping`].
//!
//! Scores are "higher is better" for both metrics: the dot product for
//! [`Metric::InnerProduct`], and `1 / (1 + squared_distance)` for
//! [`Metric::Euclidean`].
//!
//! # Binary format
//!
//! [`VectorIndex::to_bytes`] writes a little-endian blob:
//!
//! ```text
//! magic "DRVX" | version u32 | kind u8 | metric u8 | normalized u8 | reserved u8
//! dimension u32 | count u32 | nlist u32 | nprobe u32
//! vectors   count × dimension × f32
//! centroids nlist × dimension × f32   (clustered only)
//! lists     count × u32               (clustered only)
//! ```
//!
//! The slot mapping is persisted separately as JSON.

pub mod clustered;
pub mod flat;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::embedding::{blob_to_vec, dot, l2_normalize, squared_distance, vec_to_blob};
use crate::error::{InputKind, Result, RetrievalError, Step};
use crate::models::{validate_document_id, IndexKind, IndexSummary, Metric, SearchHit, SlotMapping};

pub use clustered::ClusteredIndex;
pub use flat::FlatIndex;

const MAGIC: &[u8; 4] = b"DRVX";
const FORMAT_VERSION: u32 = 1;

/// Index build parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_kind")]
    pub kind: IndexKind,
    #[serde(default = "default_metric")]
    pub metric: Metric,
    /// Number of inverted lists for clustered indexes.
    #[serde(default = "default_nlist")]
    pub nlist: usize,
    /// Lists probed per clustered search.
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
    /// L2-normalize vectors (and queries) before use.
    #[serde(default = "default_normalize")]
    pub normalize: bool,
    /// Expected vector dimension; any dimension is accepted when unset.
    #[serde(default)]
    pub dimension: Option<usize>,
}

fn default_kind() -> IndexKind {
    IndexKind::Clustered
}
fn default_metric() -> Metric {
    Metric::InnerProduct
}
fn default_nlist() -> usize {
    100
}
fn default_nprobe() -> usize {
    10
}
fn default_normalize() -> bool {
    true
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            metric: default_metric(),
            nlist: default_nlist(),
            nprobe: default_nprobe(),
            normalize: default_normalize(),
            dimension: None,
        }
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nlist == 0 || self.nprobe == 0 {
            return Err(RetrievalError::input(
                InputKind::InvalidConfig,
                "nlist and nprobe must be > 0",
            ));
        }
        if self.dimension == Some(0) {
            return Err(RetrievalError::input(
                InputKind::InvalidConfig,
                "dimension must be > 0",
            ));
        }
        Ok(())
    }
}

/// Similarity of `a` and `b` under `metric`; higher is closer.
pub fn score(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::InnerProduct => dot(a, b),
        Metric::Euclidean => 1.0 / (1.0 + squared_distance(a, b)),
    }
}

/// Descending score, then ascending slot.
pub(crate) fn cmp_scores(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then(a.0.cmp(&b.0))
}

#[derive(Debug, Clone, PartialEq)]
enum Structure {
    Exhaustive(FlatIndex),
    Clustered(ClusteredIndex),
}

/// One document's searchable index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    document_id: String,
    metric: Metric,
    normalized: bool,
    requested_kind: IndexKind,
    nprobe_requested: usize,
    mapping: Vec<SlotMapping>,
    structure: Structure,
}

impl VectorIndex {
    /// Build an index from a batch of vectors.
    ///
    /// `vectors`, `embedding_ids`, and `chunk_ids` are parallel arrays; slot
    /// `i` maps to `(embedding_ids[i], chunk_ids[i])`.
    ///
    /// # Errors
    ///
    /// - `Input(empty_input)` for an empty batch or zero-length vectors.
    /// - `Input(length_mismatch)` when the three arrays differ in length.
    /// - `Input(dimension_mismatch)` when vectors disagree on dimension, or
    ///   with `config.dimension`.
    pub fn build(
        document_id: &str,
        mut vectors: Vec<Vec<f32>>,
        embedding_ids: Vec<String>,
        chunk_ids: Vec<String>,
        config: &IndexConfig,
    ) -> Result<Self> {
        validate_document_id(document_id)?;
        config.validate()?;

        if vectors.is_empty() {
            return Err(RetrievalError::input(
                InputKind::EmptyInput,
                "no vectors to index",
            ));
        }
        if vectors.len() != embedding_ids.len() || vectors.len() != chunk_ids.len() {
            return Err(RetrievalError::input(
                InputKind::LengthMismatch,
                format!(
                    "{} vectors, {} embedding ids, {} chunk ids",
                    vectors.len(),
                    embedding_ids.len(),
                    chunk_ids.len()
                ),
            ));
        }

        let dimension = vectors[0].len();
        if dimension == 0 {
            return Err(RetrievalError::input(
                InputKind::EmptyInput,
                "vectors must not be empty",
            ));
        }
        if let Some(expected) = config.dimension {
            if expected != dimension {
                return Err(dimension_mismatch(expected, dimension));
            }
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(dimension_mismatch(dimension, bad.len()));
        }

        if config.normalize {
            for v in vectors.iter_mut() {
                l2_normalize(v);
            }
        }

        let count = vectors.len();
        let structure = match config.kind {
            IndexKind::Clustered if count >= config.nlist => Structure::Clustered(
                ClusteredIndex::train(dimension, &vectors, config.nlist, config.nprobe, config.metric),
            ),
            IndexKind::Clustered => {
                warn!(
                    document_id,
                    vectors = count,
                    nlist = config.nlist,
                    "too few vectors for clustered index, using exhaustive"
                );
                Structure::Exhaustive(FlatIndex::new(dimension, &vectors))
            }
            IndexKind::Exhaustive => Structure::Exhaustive(FlatIndex::new(dimension, &vectors)),
        };

        let mapping = embedding_ids
            .into_iter()
            .zip(chunk_ids)
            .map(|(embedding_id, chunk_id)| SlotMapping {
                embedding_id,
                chunk_id,
            })
            .collect();

        Ok(Self {
            document_id: document_id.to_string(),
            metric: config.metric,
            normalized: config.normalize,
            requested_kind: config.kind,
            nprobe_requested: config.nprobe,
            mapping,
            structure,
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.flat().dimension()
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn normalized(&self) -> bool {
        self.normalized
    }

    /// The structure actually built.
    pub fn kind(&self) -> IndexKind {
        match self.structure {
            Structure::Exhaustive(_) => IndexKind::Exhaustive,
            Structure::Clustered(_) => IndexKind::Clustered,
        }
    }

    pub fn requested_kind(&self) -> IndexKind {
        self.requested_kind
    }

    pub fn mapping(&self) -> &[SlotMapping] {
        &self.mapping
    }

    fn flat(&self) -> &FlatIndex {
        match &self.structure {
            Structure::Exhaustive(flat) => flat,
            Structure::Clustered(c) => c.vectors(),
        }
    }

    /// Summary metadata for the registry.
    pub fn summary(
        &self,
        model_identifier: Option<String>,
        size_bytes: u64,
        build_millis: u64,
    ) -> IndexSummary {
        let (nlist, nprobe) = match &self.structure {
            Structure::Clustered(c) => (Some(c.nlist()), Some(c.nprobe())),
            Structure::Exhaustive(_) => (None, None),
        };
        IndexSummary {
            document_id: self.document_id.clone(),
            vector_count: self.len(),
            dimension: self.dimension(),
            kind: self.kind(),
            requested_kind: self.requested_kind,
            metric: self.metric,
            normalized: self.normalized,
            nlist,
            nprobe,
            model_identifier,
            size_bytes,
            build_millis,
            created_at: chrono::Utc::now(),
        }
    }

    /// Return up to `top_k` hits scoring strictly above `threshold`,
    /// ordered by descending score with ties broken by ascending slot.
    pub fn search(&self, query: &[f32], top_k: usize, threshold: f32) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Err(RetrievalError::input(
                InputKind::InvalidRequest,
                "top_k must be > 0",
            ));
        }
        if query.len() != self.dimension() {
            return Err(dimension_mismatch(self.dimension(), query.len()));
        }

        let mut q = query.to_vec();
        if self.normalized {
            l2_normalize(&mut q);
        }

        let mut scored = match &self.structure {
            Structure::Exhaustive(flat) => flat.scan(&q, self.metric),
            Structure::Clustered(c) => c.scan(&q, self.metric),
        };
        scored.retain(|&(_, s)| s > threshold);
        scored.sort_by(cmp_scores);
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (slot, score))| {
                let slot_map = &self.mapping[slot];
                SearchHit {
                    embedding_id: slot_map.embedding_id.clone(),
                    chunk_id: slot_map.chunk_id.clone(),
                    document_id: self.document_id.clone(),
                    score,
                    rank: i + 1,
                }
            })
            .collect())
    }

    /// Serialize the vectors and structure (not the mapping).
    pub fn to_bytes(&self) -> Vec<u8> {
        let flat = self.flat();
        let (kind, nlist, nprobe) = match &self.structure {
            Structure::Exhaustive(_) => (0u8, 0u32, self.nprobe_requested as u32),
            Structure::Clustered(c) => (1u8, c.nlist() as u32, c.nprobe() as u32),
        };
        let requested = match self.requested_kind {
            IndexKind::Exhaustive => 0u8,
            IndexKind::Clustered => 1u8,
        };

        let mut out = Vec::with_capacity(28 + flat.raw().len() * 4);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.push(kind);
        out.push(match self.metric {
            Metric::InnerProduct => 0,
            Metric::Euclidean => 1,
        });
        out.push(self.normalized as u8);
        out.push(requested);
        out.extend_from_slice(&(flat.dimension() as u32).to_le_bytes());
        out.extend_from_slice(&(self.len() as u32).to_le_bytes());
        out.extend_from_slice(&nlist.to_le_bytes());
        out.extend_from_slice(&nprobe.to_le_bytes());
        out.extend_from_slice(&vec_to_blob(flat.raw()));
        if let Structure::Clustered(c) = &self.structure {
            for centroid in c.centroids() {
                out.extend_from_slice(&vec_to_blob(centroid));
            }
            for &a in c.assignments() {
                out.extend_from_slice(&(a as u32).to_le_bytes());
            }
        }
        out
    }

    /// Rebuild an index from [`to_bytes`](Self::to_bytes) output and its
    /// slot mapping. Corrupt or inconsistent input fails with
    /// `Processing(index_loading)`.
    pub fn from_bytes(document_id: &str, bytes: &[u8], mapping: Vec<SlotMapping>) -> Result<Self> {
        let mut r = Reader::new(bytes);
        if r.take(4)? != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = r.u32()?;
        if version != FORMAT_VERSION {
            return Err(corrupt(&format!("unsupported format version {}", version)));
        }
        let kind = r.u8()?;
        let metric = match r.u8()? {
            0 => Metric::InnerProduct,
            1 => Metric::Euclidean,
            other => return Err(corrupt(&format!("unknown metric {}", other))),
        };
        let normalized = r.u8()? != 0;
        let requested_kind = match r.u8()? {
            0 => IndexKind::Exhaustive,
            _ => IndexKind::Clustered,
        };
        let dimension = r.u32()? as usize;
        let count = r.u32()? as usize;
        let nlist = r.u32()? as usize;
        let nprobe = r.u32()? as usize;

        if dimension == 0 {
            return Err(corrupt("zero dimension"));
        }
        if mapping.len() != count {
            return Err(corrupt(&format!(
                "mapping has {} entries, index has {} vectors",
                mapping.len(),
                count
            )));
        }

        let flat = FlatIndex::from_raw(dimension, r.f32s(count * dimension)?);
        let structure = match kind {
            0 => Structure::Exhaustive(flat),
            1 => {
                if nlist == 0 || nlist > count {
                    return Err(corrupt(&format!("invalid nlist {}", nlist)));
                }
                let centroids = r
                    .f32s(nlist * dimension)?
                    .chunks_exact(dimension)
                    .map(|c| c.to_vec())
                    .collect();
                let mut assignments = Vec::with_capacity(count);
                for _ in 0..count {
                    let a = r.u32()? as usize;
                    if a >= nlist {
                        return Err(corrupt(&format!("list assignment {} out of range", a)));
                    }
                    assignments.push(a);
                }
                Structure::Clustered(ClusteredIndex::from_parts(
                    flat,
                    centroids,
                    assignments,
                    nprobe,
                ))
            }
            other => return Err(corrupt(&format!("unknown index kind {}", other))),
        };
        if !r.is_done() {
            return Err(corrupt("trailing bytes"));
        }

        Ok(Self {
            document_id: document_id.to_string(),
            metric,
            normalized,
            requested_kind,
            nprobe_requested: nprobe,
            mapping,
            structure,
        })
    }
}

fn dimension_mismatch(expected: usize, got: usize) -> RetrievalError {
    RetrievalError::input(
        InputKind::DimensionMismatch,
        format!("expected dimension {}, got {}", expected, got),
    )
}

fn corrupt(message: &str) -> RetrievalError {
    RetrievalError::processing(Step::IndexLoading, format!("corrupt index: {}", message))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| corrupt("unexpected end of data"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32s(&mut self, n: usize) -> Result<Vec<f32>> {
        let len = n
            .checked_mul(4)
            .ok_or_else(|| corrupt("vector block too large"))?;
        Ok(blob_to_vec(self.take(len)?))
    }

    fn is_done(&self) -> bool {
        self.pos == self.buf.len()
    }
}
