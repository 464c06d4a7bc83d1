//! Exhaustive (brute-force) index: every slot is scored on every query.

use crate::models::Metric;

use super::score;

/// Row-major vector storage, one row per slot.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dimension: usize, vectors: &[Vec<f32>]) -> Self {
        let mut data = Vec::with_capacity(vectors.len() * dimension);
        for v in vectors {
            data.extend_from_slice(v);
        }
        Self { dimension, data }
    }

    pub(crate) fn from_raw(dimension: usize, data: Vec<f32>) -> Self {
        Self { dimension, data }
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// The stored vector at `slot`.
    pub fn vector(&self, slot: usize) -> &[f32] {
        &self.data[slot * self.dimension..(slot + 1) * self.dimension]
    }

    pub(crate) fn raw(&self) -> &[f32] {
        &self.data
    }

    /// Score `query` against every slot, in slot order.
    pub fn scan(&self, query: &[f32], metric: Metric) -> Vec<(usize, f32)> {
        (0..self.len())
            .map(|slot| (slot, score(metric, query, self.vector(slot))))
            .collect()
    }

    /// Score `query` against the given slots only.
    pub fn scan_slots(&self, query: &[f32], metric: Metric, slots: &[usize]) -> Vec<(usize, f32)> {
        slots
            .iter()
            .map(|&slot| (slot, score(metric, query, self.vector(slot))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_scores_every_slot() {
        let index = FlatIndex::new(2, &[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.6, 0.8]]);
        assert_eq!(index.len(), 3);
        let scores = index.scan(&[1.0, 0.0], Metric::InnerProduct);
        assert_eq!(scores.len(), 3);
        assert_eq!(scores[0], (0, 1.0));
        assert_eq!(scores[1], (1, 0.0));
        assert!((scores[2].1 - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_identity_scores_one() {
        let index = FlatIndex::new(2, &[vec![3.0, 4.0]]);
        let scores = index.scan(&[3.0, 4.0], Metric::Euclidean);
        assert_eq!(scores[0].1, 1.0);
        let far = index.scan(&[0.0, 0.0], Metric::Euclidean);
        assert!((far[0].1 - 1.0 / 26.0).abs() < 1e-6);
    }
}
