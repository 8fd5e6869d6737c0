//! Sparse per-batch gradient accumulation.
//!
//! A worker collects every gradient a batch produces into two
//! [`GradientAccumulator`]s (entities, relations) before merging them into
//! the shared matrices. Contributions are keyed by id and kept in first-touch
//! order, so merging is deterministic for a given batch.

use std::collections::HashMap;

/// Summed gradient for one id within one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientContribution {
    pub id: u64,
    /// Number of row contributions summed into `dimensions`.
    pub n: u32,
    /// Version stamp of the row when the scoring strategy first read it.
    pub seen_version: u64,
    pub dimensions: Vec<f32>,
}

impl GradientContribution {
    fn new(id: u64, seen_version: u64, dim: usize) -> Self {
        Self {
            id,
            n: 0,
            seen_version,
            dimensions: vec![0.0; dim],
        }
    }

    /// L2 norm of the accumulated gradient.
    pub fn norm(&self) -> f32 {
        self.dimensions.iter().map(|x| x * x).sum::<f32>().sqrt()
    }
}

/// Keyed collection of [`GradientContribution`]s, reused across batches.
#[derive(Debug, Clone, Default)]
pub struct GradientAccumulator {
    dim: usize,
    index: HashMap<u64, usize>,
    entries: Vec<GradientContribution>,
}

impl GradientAccumulator {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Add `scale * grad` to the contribution of `id`.
    ///
    /// `seen_version` is recorded only the first time `id` is touched in
    /// this batch.
    pub fn add(&mut self, id: u64, seen_version: u64, scale: f32, grad: &[f32]) {
        debug_assert_eq!(grad.len(), self.dim);
        let slot = match self.index.get(&id) {
            Some(&slot) => slot,
            None => {
                self.entries.push(GradientContribution::new(id, seen_version, self.dim));
                self.index.insert(id, self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        let entry = &mut self.entries[slot];
        entry.n += 1;
        for (acc, g) in entry.dimensions.iter_mut().zip(grad) {
            *acc += scale * g;
        }
    }

    pub fn get(&self, id: u64) -> Option<&GradientContribution> {
        self.index.get(&id).map(|&slot| &self.entries[slot])
    }

    pub fn iter(&self) -> impl Iterator<Item = &GradientContribution> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all contributions, keeping allocations.
    pub fn clear(&mut self) {
        self.index.clear();
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_sums_and_counts() {
        let mut acc = GradientAccumulator::new(2);
        acc.add(3, 7, 1.0, &[1.0, 2.0]);
        acc.add(3, 9, -1.0, &[0.5, 0.5]);
        acc.add(1, 0, 2.0, &[1.0, 0.0]);

        let c = acc.get(3).unwrap();
        assert_eq!(c.n, 2);
        assert_eq!(c.seen_version, 7);
        assert_eq!(c.dimensions, vec![0.5, 1.5]);
        assert_eq!(acc.get(1).unwrap().dimensions, vec![2.0, 0.0]);
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn test_iteration_is_first_touch_order() {
        let mut acc = GradientAccumulator::new(1);
        for id in [5, 2, 5, 9, 2] {
            acc.add(id, 0, 1.0, &[1.0]);
        }
        let ids: Vec<u64> = acc.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![5, 2, 9]);
    }

    #[test]
    fn test_clear() {
        let mut acc = GradientAccumulator::new(1);
        acc.add(0, 0, 1.0, &[1.0]);
        acc.clear();
        assert!(acc.is_empty());
        assert!(acc.get(0).is_none());
    }
}
