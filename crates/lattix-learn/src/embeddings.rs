//! Shared embedding matrices.
//!
//! An [`EmbeddingMatrix`] is a dense `count x dim` array of `f32` addressed by
//! a contiguous id. Training workers update it concurrently **without
//! locking** (Hogwild): every component is stored as an `AtomicU32` bit
//! pattern, so a single read or write of one component is never torn, but a
//! read-modify-write of a component by two workers may lose one of the two
//! updates. That loss is accepted; it is what makes sparse SGD scale.
//!
//! Each row also carries a version stamp. The stamp is bumped whenever a
//! worker merges a gradient into the row, which lets the worker notice that
//! someone else wrote the row between its read and its write (a *conflict*).

use crate::error::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Dense matrix of fixed-width float vectors, indexed by id `0..len()`.
#[derive(Debug)]
pub struct EmbeddingMatrix {
    count: usize,
    dim: usize,
    data: Box<[AtomicU32]>,
    versions: Box<[AtomicU64]>,
}

impl EmbeddingMatrix {
    /// Zero-filled matrix.
    pub fn new(count: usize, dim: usize) -> Self {
        let data = (0..count * dim).map(|_| AtomicU32::new(0)).collect();
        let versions = (0..count).map(|_| AtomicU64::new(0)).collect();
        Self {
            count,
            dim,
            data,
            versions,
        }
    }

    /// Build from row-major values.
    pub fn from_vec(count: usize, dim: usize, values: Vec<f32>) -> Result<Self> {
        if values.len() != count * dim {
            return Err(Error::Shape(format!(
                "expected {} values for {}x{}, got {}",
                count * dim,
                count,
                dim,
                values.len()
            )));
        }
        let data = values.into_iter().map(|v| AtomicU32::new(v.to_bits())).collect();
        let versions = (0..count).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            count,
            dim,
            data,
            versions,
        })
    }

    /// Fill with values drawn uniformly from `[-6/sqrt(dim), 6/sqrt(dim))`,
    /// the usual TransE initialization.
    pub fn init_uniform(&self, seed: u64) {
        let bound = 6.0 / (self.dim.max(1) as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        for cell in self.data.iter() {
            let v: f32 = rng.random_range(-bound..bound);
            cell.store(v.to_bits(), Ordering::Relaxed);
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Width of each row.
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    fn offset(&self, id: u64) -> usize {
        let id = id as usize;
        debug_assert!(id < self.count, "id {id} out of range 0..{}", self.count);
        id * self.dim
    }

    /// Copy row `id` into `out` (which must have length `dim`).
    #[inline]
    pub fn read(&self, id: u64, out: &mut [f32]) {
        let base = self.offset(id);
        for (j, slot) in out.iter_mut().enumerate().take(self.dim) {
            *slot = f32::from_bits(self.data[base + j].load(Ordering::Relaxed));
        }
    }

    /// Owned copy of row `id`.
    pub fn row(&self, id: u64) -> Vec<f32> {
        let mut out = vec![0.0; self.dim];
        self.read(id, &mut out);
        out
    }

    #[inline]
    pub fn get(&self, id: u64, j: usize) -> f32 {
        f32::from_bits(self.data[self.offset(id) + j].load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, id: u64, j: usize, value: f32) {
        self.data[self.offset(id) + j].store(value.to_bits(), Ordering::Relaxed);
    }

    /// Add `delta` to one component. Not atomic as a whole: concurrent adds
    /// to the same component may lose an update.
    #[inline]
    pub fn add(&self, id: u64, j: usize, delta: f32) {
        let cell = &self.data[self.offset(id) + j];
        let current = f32::from_bits(cell.load(Ordering::Relaxed));
        cell.store((current + delta).to_bits(), Ordering::Relaxed);
    }

    /// Add `delta` to one component with an atomic read-modify-write and
    /// return the updated value. Used for optimizer accumulators, which must
    /// never go backwards.
    #[inline]
    pub(crate) fn add_atomic(&self, id: u64, j: usize, delta: f32) -> f32 {
        let cell = &self.data[self.offset(id) + j];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + delta).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return f32::from_bits(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Overwrite row `id`.
    pub fn write_row(&self, id: u64, values: &[f32]) -> Result<()> {
        if values.len() != self.dim {
            return Err(Error::Shape(format!(
                "row of length {} written into matrix of dim {}",
                values.len(),
                self.dim
            )));
        }
        let base = self.offset(id);
        for (j, v) in values.iter().enumerate() {
            self.data[base + j].store(v.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Current version stamp of row `id`.
    #[inline]
    pub fn version(&self, id: u64) -> u64 {
        self.versions[id as usize].load(Ordering::Acquire)
    }

    /// Increment the version stamp of row `id` and return the previous value.
    #[inline]
    pub fn bump_version(&self, id: u64) -> u64 {
        self.versions[id as usize].fetch_add(1, Ordering::AcqRel)
    }

    /// Row-major copy of every value. Fuzzy under concurrent writers.
    pub fn snapshot(&self) -> Vec<f32> {
        self.data
            .iter()
            .map(|c| f32::from_bits(c.load(Ordering::Relaxed)))
            .collect()
    }

    /// Same shape and values (version stamps are reset).
    pub fn duplicate(&self) -> Self {
        Self {
            count: self.count,
            dim: self.dim,
            data: self.snapshot().into_iter().map(|v| AtomicU32::new(v.to_bits())).collect(),
            versions: (0..self.count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Bitwise equality of the stored values.
    pub fn same_values(&self, other: &Self) -> bool {
        self.count == other.count
            && self.dim == other.dim
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.load(Ordering::Relaxed) == b.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed() {
        let m = EmbeddingMatrix::new(3, 4);
        assert_eq!(m.len(), 3);
        assert_eq!(m.dim(), 4);
        assert!(m.snapshot().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_from_vec_checks_shape() {
        assert!(EmbeddingMatrix::from_vec(2, 2, vec![1.0; 3]).is_err());
        let m = EmbeddingMatrix::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(m.row(1), vec![3.0, 4.0]);
        assert_eq!(m.get(0, 1), 2.0);
    }

    #[test]
    fn test_init_uniform_is_bounded_and_seeded() {
        let a = EmbeddingMatrix::new(20, 16);
        let b = EmbeddingMatrix::new(20, 16);
        a.init_uniform(7);
        b.init_uniform(7);
        assert!(a.same_values(&b));

        let bound = 6.0 / 4.0;
        assert!(a.snapshot().iter().all(|v| v.abs() <= bound));

        let c = EmbeddingMatrix::new(20, 16);
        c.init_uniform(8);
        assert!(!a.same_values(&c));
    }

    #[test]
    fn test_add_and_write_row() {
        let m = EmbeddingMatrix::new(2, 3);
        m.write_row(1, &[1.0, 2.0, 3.0]).unwrap();
        m.add(1, 2, 0.5);
        assert_eq!(m.row(1), vec![1.0, 2.0, 3.5]);
        assert!(m.write_row(0, &[1.0]).is_err());
    }

    #[test]
    fn test_version_bump_returns_previous() {
        let m = EmbeddingMatrix::new(2, 1);
        assert_eq!(m.bump_version(1), 0);
        assert_eq!(m.bump_version(1), 1);
        assert_eq!(m.version(1), 2);
        assert_eq!(m.version(0), 0);
    }

    #[test]
    fn test_add_atomic_under_contention() {
        let m = EmbeddingMatrix::new(1, 1);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        m.add_atomic(0, 0, 1.0);
                    }
                });
            }
        });
        assert_eq!(m.get(0, 0), 4000.0);
    }
}
