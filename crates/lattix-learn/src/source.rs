//! Batch sources: where training rows come from.
//!
//! The learner only knows the [`BatchSource`] trait. [`ShuffledBatcher`] is
//! the stock implementation: it walks a [`TripleSet`] in a fresh random order
//! every epoch and pairs each positive triple with one head and one tail
//! corruption drawn uniformly from all entities.

use crate::batch::{BatchRow, BatchUnit};
use crate::error::{Error, Result};
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Producer of training rows, driven by the orchestrator thread.
pub trait BatchSource: Send {
    /// Rewind for a new epoch. Epochs are numbered from 1.
    fn start_epoch(&mut self, epoch: u32);

    /// Append rows to `unit` until it is full or the epoch runs out.
    /// Returns `false` when no row could be added.
    fn fill(&mut self, unit: &mut BatchUnit) -> bool;

    /// Rows one epoch will produce, if known.
    fn rows_per_epoch(&self) -> Option<usize> {
        None
    }
}

/// A `(head, relation, tail)` fact with dense ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triple {
    pub head: u64,
    pub relation: u64,
    pub tail: u64,
}

impl Triple {
    pub fn new(head: u64, relation: u64, tail: u64) -> Self {
        Self { head, relation, tail }
    }
}

/// Id triples with known entity and relation counts.
#[derive(Debug, Clone, Default)]
pub struct TripleSet {
    triples: Vec<Triple>,
    ne: usize,
    nr: usize,
}

/// Result of [`TripleSet::split`].
#[derive(Debug, Clone)]
pub struct Split {
    pub train: TripleSet,
    pub valid: TripleSet,
    pub test: TripleSet,
}

impl TripleSet {
    /// Counts are taken as one past the largest id seen.
    pub fn new(triples: Vec<Triple>) -> Self {
        let ne = triples.iter().map(|t| t.head.max(t.tail) + 1).max().unwrap_or(0) as usize;
        let nr = triples.iter().map(|t| t.relation + 1).max().unwrap_or(0) as usize;
        Self { triples, ne, nr }
    }

    /// Declare the counts explicitly; every id must be in range.
    pub fn with_counts(triples: Vec<Triple>, ne: usize, nr: usize) -> Result<Self> {
        if let Some(t) = triples
            .iter()
            .find(|t| t.head as usize >= ne || t.tail as usize >= ne || t.relation as usize >= nr)
        {
            return Err(Error::Shape(format!(
                "triple ({}, {}, {}) out of range for ne={ne} nr={nr}",
                t.head, t.relation, t.tail
            )));
        }
        Ok(Self { triples, ne, nr })
    }

    pub fn triples(&self) -> &[Triple] {
        &self.triples
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    pub fn num_entities(&self) -> usize {
        self.ne
    }

    pub fn num_relations(&self) -> usize {
        self.nr
    }

    /// Shuffle with `seed` and hold out `valid` and `test` fractions.
    /// All three parts keep the full entity and relation counts.
    pub fn split(&self, valid: f32, test: f32, seed: u64) -> Result<Split> {
        if !(0.0..1.0).contains(&valid) || !(0.0..1.0).contains(&test) || valid + test >= 1.0 {
            return Err(Error::config(format!("invalid split valid={valid} test={test}")));
        }
        let mut shuffled = self.triples.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(seed));

        let n = shuffled.len();
        let n_valid = (n as f64 * f64::from(valid)).round() as usize;
        let n_test = (n as f64 * f64::from(test)).round() as usize;
        if n_valid + n_test >= n && n > 0 {
            return Err(Error::config(format!(
                "split leaves no training triples ({n} total, {n_valid} valid, {n_test} test)"
            )));
        }
        let test_part = shuffled.split_off(n - n_test);
        let valid_part = shuffled.split_off(n - n_test - n_valid);

        let part = |triples| TripleSet {
            triples,
            ne: self.ne,
            nr: self.nr,
        };
        Ok(Split {
            train: part(shuffled),
            valid: part(valid_part),
            test: part(test_part),
        })
    }
}

/// Uniform negative sampler over a shuffled triple set.
///
/// Each positive is emitted `numneg` times per epoch, every copy with a fresh
/// head corruption and tail corruption. Corruptions never repeat the entity
/// they replace unless there is only one entity.
pub struct ShuffledBatcher {
    triples: Vec<Triple>,
    ne: u64,
    numneg: usize,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl ShuffledBatcher {
    pub fn new(set: &TripleSet, numneg: usize, seed: u64) -> Self {
        Self {
            triples: set.triples.clone(),
            ne: set.ne as u64,
            numneg: numneg.max(1),
            order: (0..set.len()).collect(),
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn corrupt(&mut self, id: u64) -> u64 {
        if self.ne <= 1 {
            return id;
        }
        let c = self.rng.random_range(0..self.ne - 1);
        if c >= id {
            c + 1
        } else {
            c
        }
    }
}

impl BatchSource for ShuffledBatcher {
    fn start_epoch(&mut self, _epoch: u32) {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
    }

    fn fill(&mut self, unit: &mut BatchUnit) -> bool {
        let total = self.order.len() * self.numneg;
        let mut added = false;
        while !unit.is_full() && self.cursor < total {
            let t = self.triples[self.order[self.cursor / self.numneg]];
            let neg_head = self.corrupt(t.head);
            let neg_tail = self.corrupt(t.tail);
            unit.push(
                BatchRow::new(t.head, t.relation, t.tail)
                    .with_neg_head(neg_head)
                    .with_neg_tail(neg_tail),
            );
            self.cursor += 1;
            added = true;
        }
        added
    }

    fn rows_per_epoch(&self) -> Option<usize> {
        Some(self.triples.len() * self.numneg)
    }
}

/// Replays the same rows, in order, every epoch.
#[derive(Debug, Clone, Default)]
pub struct FixedRows {
    rows: Vec<BatchRow>,
    cursor: usize,
}

impl FixedRows {
    pub fn new(rows: Vec<BatchRow>) -> Self {
        Self { rows, cursor: 0 }
    }
}

impl BatchSource for FixedRows {
    fn start_epoch(&mut self, _epoch: u32) {
        self.cursor = 0;
    }

    fn fill(&mut self, unit: &mut BatchUnit) -> bool {
        let mut added = false;
        while self.cursor < self.rows.len() && unit.push(self.rows[self.cursor]) {
            self.cursor += 1;
            added = true;
        }
        added
    }

    fn rows_per_epoch(&self) -> Option<usize> {
        Some(self.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: u64) -> TripleSet {
        TripleSet::new((0..n).map(|i| Triple::new(i, i % 2, (i + 1) % n)).collect())
    }

    fn drain_epoch(source: &mut dyn BatchSource, epoch: u32, batch: usize) -> Vec<BatchRow> {
        source.start_epoch(epoch);
        let mut rows = Vec::new();
        let mut unit = BatchUnit::new(batch, 1);
        loop {
            unit.clear();
            if !source.fill(&mut unit) {
                break;
            }
            rows.extend_from_slice(unit.rows());
        }
        rows
    }

    #[test]
    fn test_counts_are_derived() {
        let set = chain(5);
        assert_eq!(set.num_entities(), 5);
        assert_eq!(set.num_relations(), 2);
        assert!(TripleSet::with_counts(set.triples().to_vec(), 4, 2).is_err());
    }

    #[test]
    fn test_split_partitions_everything() {
        let set = chain(100);
        let split = set.split(0.1, 0.2, 7).unwrap();
        assert_eq!(split.valid.len(), 10);
        assert_eq!(split.test.len(), 20);
        assert_eq!(split.train.len(), 70);
        assert_eq!(split.test.num_entities(), 100);

        let mut all: Vec<Triple> = split
            .train
            .triples()
            .iter()
            .chain(split.valid.triples())
            .chain(split.test.triples())
            .copied()
            .collect();
        all.sort_by_key(|t| t.head);
        assert_eq!(all, set.triples());
        assert!(set.split(0.5, 0.5, 1).is_err());
    }

    #[test]
    fn test_batcher_covers_each_positive_numneg_times() {
        let set = chain(7);
        let mut batcher = ShuffledBatcher::new(&set, 3, 11);
        assert_eq!(batcher.rows_per_epoch(), Some(21));

        let rows = drain_epoch(&mut batcher, 1, 4);
        assert_eq!(rows.len(), 21);
        for t in set.triples() {
            let copies = rows
                .iter()
                .filter(|r| r.head == t.head && r.relation == t.relation && r.tail == t.tail)
                .count();
            assert_eq!(copies, 3);
        }
        for r in &rows {
            assert_eq!(r.num_corruptions(), 2);
            assert_ne!(r.neg_head, Some(r.head));
            assert_ne!(r.neg_tail, Some(r.tail));
            assert!(r.neg_head.unwrap() < 7 && r.neg_tail.unwrap() < 7);
        }
        assert_eq!(drain_epoch(&mut batcher, 2, 4).len(), 21);
    }

    #[test]
    fn test_batcher_is_seeded() {
        let set = chain(20);
        let a = drain_epoch(&mut ShuffledBatcher::new(&set, 1, 3), 1, 8);
        let b = drain_epoch(&mut ShuffledBatcher::new(&set, 1, 3), 1, 8);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fixed_rows_replay() {
        let rows = vec![BatchRow::new(0, 0, 1).with_neg_tail(2); 5];
        let mut source = FixedRows::new(rows.clone());
        assert_eq!(drain_epoch(&mut source, 1, 2), rows);
        assert_eq!(drain_epoch(&mut source, 2, 3), rows);
    }
}
