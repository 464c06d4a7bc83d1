//! Clustered index: a k-means coarse quantizer over inverted lists.
//!
//! Training runs on the batch being indexed. Centroids are seeded from
//! evenly spaced vectors so the result is deterministic, then refined by
//! alternating assignment and mean recomputation until assignments settle
//! or [`MAX_ITERATIONS`] is reached. A final assignment pass guarantees that
//! every vector sits in the list of its highest-scoring centroid, which is
//! the first list probed when that vector is used as a query.

use crate::models::Metric;

use super::flat::FlatIndex;
use super::{cmp_scores, score};

pub const MAX_ITERATIONS: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct ClusteredIndex {
    vectors: FlatIndex,
    centroids: Vec<Vec<f32>>,
    assignments: Vec<usize>,
    lists: Vec<Vec<usize>>,
    nprobe: usize,
}

impl ClusteredIndex {
    /// Train `nlist` centroids on `vectors` and fill the inverted lists.
    ///
    /// Callers guarantee `1 <= nlist <= vectors.len()`.
    pub fn train(
        dimension: usize,
        vectors: &[Vec<f32>],
        nlist: usize,
        nprobe: usize,
        metric: Metric,
    ) -> Self {
        let (centroids, assignments) = k_means(vectors, dimension, nlist, metric);
        Self::from_parts(
            FlatIndex::new(dimension, vectors),
            centroids,
            assignments,
            nprobe,
        )
    }

    pub(crate) fn from_parts(
        vectors: FlatIndex,
        centroids: Vec<Vec<f32>>,
        assignments: Vec<usize>,
        nprobe: usize,
    ) -> Self {
        let mut lists = vec![Vec::new(); centroids.len()];
        for (slot, &list) in assignments.iter().enumerate() {
            lists[list].push(slot);
        }
        Self {
            vectors,
            nprobe: nprobe.clamp(1, centroids.len().max(1)),
            centroids,
            assignments,
            lists,
        }
    }

    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }

    pub fn nprobe(&self) -> usize {
        self.nprobe
    }

    pub fn vectors(&self) -> &FlatIndex {
        &self.vectors
    }

    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }

    pub fn assignments(&self) -> &[usize] {
        &self.assignments
    }

    /// Score `query` against the slots of the `nprobe` closest lists.
    pub fn scan(&self, query: &[f32], metric: Metric) -> Vec<(usize, f32)> {
        let mut ranked: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, score(metric, query, c)))
            .collect();
        ranked.sort_by(cmp_scores);

        let mut slots: Vec<usize> = ranked
            .iter()
            .take(self.nprobe)
            .flat_map(|&(list, _)| self.lists[list].iter().copied())
            .collect();
        slots.sort_unstable();

        self.vectors.scan_slots(query, metric, &slots)
    }
}

/// Index of the highest-scoring centroid; ties go to the lowest index.
fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>], metric: Metric) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let s = score(metric, vector, c);
        if s > best_score {
            best = i;
            best_score = s;
        }
    }
    best
}

fn k_means(
    vectors: &[Vec<f32>],
    dimension: usize,
    k: usize,
    metric: Metric,
) -> (Vec<Vec<f32>>, Vec<usize>) {
    let n = vectors.len();
    let k = k.clamp(1, n.max(1));

    let step = n / k;
    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|i| vectors[(i * step).min(n - 1)].clone())
        .collect();

    let mut assignments: Vec<usize> = vectors
        .iter()
        .map(|v| nearest_centroid(v, &centroids, metric))
        .collect();

    for _ in 0..MAX_ITERATIONS {
        let mut sums = vec![vec![0.0f32; dimension]; k];
        let mut counts = vec![0usize; k];
        for (v, &c) in vectors.iter().zip(assignments.iter()) {
            counts[c] += 1;
            for (acc, x) in sums[c].iter_mut().zip(v.iter()) {
                *acc += x;
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                for j in 0..dimension {
                    centroids[c][j] = sums[c][j] / counts[c] as f32;
                }
            }
        }

        let mut changed = false;
        for (i, v) in vectors.iter().enumerate() {
            let best = nearest_centroid(v, &centroids, metric);
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Settle on the final centroids so list membership matches probe order.
    for (i, v) in vectors.iter().enumerate() {
        assignments[i] = nearest_centroid(v, &centroids, metric);
    }

    (centroids, assignments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<Vec<f32>> {
        vec![
            vec![1.0, 0.0],
            vec![0.99, 0.14],
            vec![0.98, -0.2],
            vec![0.0, 1.0],
            vec![0.1, 0.99],
            vec![-0.15, 0.98],
        ]
    }

    #[test]
    fn test_k_means_separates_blobs() {
        let vectors = two_blobs();
        let (centroids, assignments) = k_means(&vectors, 2, 2, Metric::InnerProduct);
        assert_eq!(centroids.len(), 2);
        assert_eq!(assignments[0], assignments[1]);
        assert_eq!(assignments[1], assignments[2]);
        assert_eq!(assignments[3], assignments[4]);
        assert_eq!(assignments[4], assignments[5]);
        assert_ne!(assignments[0], assignments[3]);
    }

    #[test]
    fn test_every_slot_in_exactly_one_list() {
        let index = ClusteredIndex::train(2, &two_blobs(), 2, 1, Metric::InnerProduct);
        let total: usize = index.lists.iter().map(|l| l.len()).sum();
        assert_eq!(total, 6);
        assert_eq!(index.assignments().len(), 6);
    }

    #[test]
    fn test_single_probe_finds_self() {
        let vectors = two_blobs();
        let index = ClusteredIndex::train(2, &vectors, 2, 1, Metric::InnerProduct);
        for (slot, v) in vectors.iter().enumerate() {
            let hits = index.scan(v, Metric::InnerProduct);
            assert!(hits.iter().any(|&(s, _)| s == slot));
        }
    }

    #[test]
    fn test_nprobe_clamped_to_nlist() {
        let index = ClusteredIndex::train(2, &two_blobs(), 2, 10, Metric::Euclidean);
        assert_eq!(index.nprobe(), 2);
        assert_eq!(index.scan(&[1.0, 0.0], Metric::Euclidean).len(), 6);
    }
}
