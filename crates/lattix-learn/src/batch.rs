//! Reusable batch containers.
//!
//! A [`BatchUnit`] is allocated once per pipeline slot and recycled every
//! iteration: the batch source fills it, a worker consumes it, and it comes
//! back through the output queue to be [`cleared`](BatchUnit::clear) and
//! refilled. Its shape (`batch_size x dim`) never changes after construction.

use crate::error::{Error, Result};

/// One training row: a true triple plus up to two corruptions of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchRow {
    pub head: u64,
    pub relation: u64,
    pub tail: u64,
    /// Variant 1: `(neg_head, relation, tail)`.
    pub neg_head: Option<u64>,
    /// Variant 2: `(head, relation, neg_tail)`.
    pub neg_tail: Option<u64>,
}

impl BatchRow {
    pub fn new(head: u64, relation: u64, tail: u64) -> Self {
        Self {
            head,
            relation,
            tail,
            neg_head: None,
            neg_tail: None,
        }
    }

    pub fn with_neg_head(mut self, id: u64) -> Self {
        self.neg_head = Some(id);
        self
    }

    pub fn with_neg_tail(mut self, id: u64) -> Self {
        self.neg_tail = Some(id);
        self
    }

    /// Number of corrupted triples carried by this row.
    pub fn num_corruptions(&self) -> usize {
        self.neg_head.is_some() as usize + self.neg_tail.is_some() as usize
    }

    /// Check every id against `ne` entities and `nr` relations.
    pub fn check_ids(&self, ne: usize, nr: usize) -> Result<()> {
        let entities = [Some(self.head), Some(self.tail), self.neg_head, self.neg_tail];
        if let Some(id) = entities.into_iter().flatten().find(|&id| id >= ne as u64) {
            return Err(Error::Shape(format!("entity id {id} in row {self:?} is out of range 0..{ne}")));
        }
        if self.relation >= nr as u64 {
            return Err(Error::Shape(format!(
                "relation id {} in row {self:?} is out of range 0..{nr}",
                self.relation
            )));
        }
        Ok(())
    }
}

/// Fixed-shape, mutable-content batch.
///
/// The three sign buffers hold, per row, the derivative of the distance with
/// respect to `h + r - t` for the true triple and the two corruptions. Scoring
/// strategies write them; nothing else reads them after the batch is merged.
#[derive(Debug)]
pub struct BatchUnit {
    pub epoch: u32,
    batch_size: usize,
    dim: usize,
    rows: Vec<BatchRow>,
    pos_sign: Vec<f32>,
    neg1_sign: Vec<f32>,
    neg2_sign: Vec<f32>,
    /// Corrupted triples that violated the margin.
    pub violations: u64,
    /// Merged gradients whose row was concurrently rewritten.
    pub conflicts: u64,
}

impl BatchUnit {
    pub fn new(batch_size: usize, dim: usize) -> Self {
        Self {
            epoch: 0,
            batch_size,
            dim,
            rows: Vec::with_capacity(batch_size),
            pos_sign: vec![0.0; batch_size * dim],
            neg1_sign: vec![0.0; batch_size * dim],
            neg2_sign: vec![0.0; batch_size * dim],
            violations: 0,
            conflicts: 0,
        }
    }

    /// Reset counters, rows and sign buffers for reuse. Does not reallocate.
    pub fn clear(&mut self) {
        self.epoch = 0;
        self.violations = 0;
        self.conflicts = 0;
        self.rows.clear();
        self.pos_sign.fill(0.0);
        self.neg1_sign.fill(0.0);
        self.neg2_sign.fill(0.0);
    }

    pub fn capacity(&self) -> usize {
        self.batch_size
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Rows currently filled.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() == self.batch_size
    }

    /// Append a row. Returns `false` (and drops the row) when the unit is full.
    pub fn push(&mut self, row: BatchRow) -> bool {
        if self.is_full() {
            return false;
        }
        self.rows.push(row);
        true
    }

    pub fn rows(&self) -> &[BatchRow] {
        &self.rows
    }

    /// Corrupted triples in the filled rows.
    pub fn num_corruptions(&self) -> u64 {
        self.rows.iter().map(|r| r.num_corruptions() as u64).sum()
    }

    /// Row `i` together with its three sign buffers, mutably.
    pub fn row_with_signs(&mut self, i: usize) -> (BatchRow, &mut [f32], &mut [f32], &mut [f32]) {
        let range = i * self.dim..(i + 1) * self.dim;
        (
            self.rows[i],
            &mut self.pos_sign[range.clone()],
            &mut self.neg1_sign[range.clone()],
            &mut self.neg2_sign[range],
        )
    }

    pub fn pos_sign(&self, i: usize) -> &[f32] {
        &self.pos_sign[i * self.dim..(i + 1) * self.dim]
    }

    pub fn neg1_sign(&self, i: usize) -> &[f32] {
        &self.neg1_sign[i * self.dim..(i + 1) * self.dim]
    }

    pub fn neg2_sign(&self, i: usize) -> &[f32] {
        &self.neg2_sign[i * self.dim..(i + 1) * self.dim]
    }

    /// True when every counter is zero and every sign buffer is zero-filled.
    pub fn is_clean(&self) -> bool {
        self.violations == 0
            && self.conflicts == 0
            && self.rows.is_empty()
            && self.pos_sign.iter().chain(&self.neg1_sign).chain(&self.neg2_sign).all(|&v| v == 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_respects_capacity() {
        let mut unit = BatchUnit::new(2, 3);
        assert!(unit.push(BatchRow::new(0, 0, 1)));
        assert!(unit.push(BatchRow::new(1, 0, 2).with_neg_tail(0)));
        assert!(!unit.push(BatchRow::new(2, 0, 3)));
        assert_eq!(unit.len(), 2);
        assert!(unit.is_full());
        assert_eq!(unit.num_corruptions(), 1);
    }

    #[test]
    fn test_check_ids() {
        assert!(BatchRow::new(0, 1, 2).with_neg_tail(3).check_ids(4, 2).is_ok());
        assert!(matches!(BatchRow::new(0, 0, 4).check_ids(4, 1), Err(Error::Shape(_))));
        assert!(matches!(BatchRow::new(0, 0, 1).with_neg_head(9).check_ids(4, 1), Err(Error::Shape(_))));
        assert!(matches!(BatchRow::new(0, 1, 1).check_ids(4, 1), Err(Error::Shape(_))));
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut unit = BatchUnit::new(2, 2);
        unit.push(BatchRow::new(0, 0, 1).with_neg_head(1).with_neg_tail(0));
        {
            let (_, pos, n1, n2) = unit.row_with_signs(0);
            pos.fill(1.0);
            n1.fill(-1.0);
            n2[1] = 3.0;
        }
        unit.violations = 4;
        unit.conflicts = 2;
        unit.epoch = 9;
        assert!(!unit.is_clean());

        unit.clear();
        assert!(unit.is_clean());
        assert_eq!(unit.epoch, 0);
        assert_eq!(unit.capacity(), 2);
        assert_eq!(unit.pos_sign(1).len(), 2);
    }
}
