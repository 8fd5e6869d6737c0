//! Validation hook and a raw link-prediction validator.
//!
//! For a held-out triple `(h, r, t)` the tail rank is one plus the number of
//! entities `e` with `d(h, r, e) < d(h, r, t)`; the head rank is defined the
//! same way over `(e, r, t)`. Ties count in favour of the true entity. No
//! filtering of other known triples is done (raw setting).

use crate::embeddings::EmbeddingMatrix;
use crate::error::{Error, Result};
use crate::scoring::ScoringStrategy;
use crate::source::Triple;
use rayon::prelude::*;
use std::time::{Duration, Instant};

/// Rank-based link prediction metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankMetrics {
    /// Mean Reciprocal Rank: E\[1/rank\]
    pub mrr: f64,
    /// Mean Rank: E\[rank\]
    pub mr: f64,
    pub hits_at_1: f64,
    pub hits_at_3: f64,
    pub hits_at_10: f64,
    /// Ranks averaged (two per triple when both sides are ranked).
    pub num_ranks: usize,
}

impl RankMetrics {
    /// Metrics over 1-based ranks.
    pub fn from_ranks(ranks: &[usize]) -> Self {
        if ranks.is_empty() {
            return Self::default();
        }
        let n = ranks.len() as f64;
        let hits = |k: usize| ranks.iter().filter(|&&r| r <= k).count() as f64 / n;
        Self {
            mrr: ranks.iter().map(|&r| 1.0 / r as f64).sum::<f64>() / n,
            mr: ranks.iter().map(|&r| r as f64).sum::<f64>() / n,
            hits_at_1: hits(1),
            hits_at_3: hits(3),
            hits_at_10: hits(10),
            num_ranks: ranks.len(),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "MRR: {:.4} | MR: {:.1} | H@1: {:.3} | H@3: {:.3} | H@10: {:.3} (n={})",
            self.mrr, self.mr, self.hits_at_1, self.hits_at_3, self.hits_at_10, self.num_ranks
        )
    }
}

/// What a validation pass produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub metrics: RankMetrics,
    pub elapsed: Duration,
}

/// Called by the learner every `evalits` epochs, between epochs.
pub trait Validator: Send {
    fn validate(
        &self,
        entities: &EmbeddingMatrix,
        relations: &EmbeddingMatrix,
        strategy: &dyn ScoringStrategy,
    ) -> Result<ValidationReport>;
}

/// Ranks held-out triples against every entity.
#[derive(Debug, Clone)]
pub struct RankValidator {
    triples: Vec<Triple>,
    rank_heads: bool,
}

impl RankValidator {
    pub fn new(triples: Vec<Triple>) -> Self {
        Self {
            triples,
            rank_heads: true,
        }
    }

    /// Rank only the tail side.
    pub fn tails_only(mut self) -> Self {
        self.rank_heads = false;
        self
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }
}

fn row(m: &[f32], dim: usize, id: u64) -> &[f32] {
    let start = id as usize * dim;
    &m[start..start + dim]
}

fn rank_of(true_distance: f32, candidates: impl Iterator<Item = f32>) -> usize {
    1 + candidates.filter(|&d| d < true_distance).count()
}

impl Validator for RankValidator {
    fn validate(
        &self,
        entities: &EmbeddingMatrix,
        relations: &EmbeddingMatrix,
        strategy: &dyn ScoringStrategy,
    ) -> Result<ValidationReport> {
        let started = Instant::now();
        let ne = entities.len();
        let nr = relations.len();
        if let Some(t) = self
            .triples
            .iter()
            .find(|t| t.head as usize >= ne || t.tail as usize >= ne || t.relation as usize >= nr)
        {
            return Err(Error::Validation(format!(
                "triple ({}, {}, {}) out of range for ne={ne} nr={nr}",
                t.head, t.relation, t.tail
            )));
        }

        let dim = entities.dim();
        let e = entities.snapshot();
        let r = relations.snapshot();
        let all: Vec<&[f32]> = e.chunks_exact(dim).collect();

        let ranks: Vec<usize> = self
            .triples
            .par_iter()
            .flat_map_iter(|t| {
                let (h, rel, tail) = (row(&e, dim, t.head), row(&r, dim, t.relation), row(&e, dim, t.tail));
                let truth = strategy.distance(h, rel, tail);
                let tail_rank = rank_of(truth, all.iter().map(|cand| strategy.distance(h, rel, cand)));
                let head_rank = self
                    .rank_heads
                    .then(|| rank_of(truth, all.iter().map(|cand| strategy.distance(cand, rel, tail))));
                std::iter::once(tail_rank).chain(head_rank)
            })
            .collect();

        Ok(ValidationReport {
            metrics: RankMetrics::from_ranks(&ranks),
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::TransE;

    #[test]
    fn test_from_ranks() {
        let m = RankMetrics::from_ranks(&[1, 2, 4, 20]);
        assert!((m.mrr - (1.0 + 0.5 + 0.25 + 0.05) / 4.0).abs() < 1e-12);
        assert!((m.mr - 6.75).abs() < 1e-12);
        assert_eq!(m.hits_at_1, 0.25);
        assert_eq!(m.hits_at_3, 0.5);
        assert_eq!(m.hits_at_10, 0.75);
        assert_eq!(m.num_ranks, 4);
        assert_eq!(RankMetrics::from_ranks(&[]), RankMetrics::default());
    }

    #[test]
    fn test_perfect_translation_ranks_first() {
        // e_i = i, r = 1: every (i, 0, i + 1) is an exact translation.
        let e = EmbeddingMatrix::from_vec(4, 1, vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let r = EmbeddingMatrix::from_vec(1, 1, vec![1.0]).unwrap();
        let v = RankValidator::new(vec![Triple::new(0, 0, 1), Triple::new(2, 0, 3)]);
        let report = v.validate(&e, &r, &TransE::l1()).unwrap();
        assert_eq!(report.metrics.num_ranks, 4);
        assert_eq!(report.metrics.hits_at_1, 1.0);
        assert_eq!(report.metrics.mrr, 1.0);
    }

    #[test]
    fn test_wrong_tail_is_ranked_down() {
        let e = EmbeddingMatrix::from_vec(3, 1, vec![0.0, 1.0, 5.0]).unwrap();
        let r = EmbeddingMatrix::from_vec(1, 1, vec![1.0]).unwrap();
        // d(0,0,2) = 4 while d(0,0,1) = 0 and d(0,0,0) = 1.
        let v = RankValidator::new(vec![Triple::new(0, 0, 2)]).tails_only();
        let report = v.validate(&e, &r, &TransE::l1()).unwrap();
        assert_eq!(report.metrics.mr, 3.0);
    }

    #[test]
    fn test_out_of_range_triple() {
        let e = EmbeddingMatrix::new(2, 1);
        let r = EmbeddingMatrix::new(1, 1);
        let v = RankValidator::new(vec![Triple::new(0, 0, 5)]);
        assert!(matches!(v.validate(&e, &r, &TransE::l1()), Err(Error::Validation(_))));
    }
}
