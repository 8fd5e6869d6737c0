//! Pluggable scoring strategies.
//!
//! A [`ScoringStrategy`] turns a filled [`BatchUnit`] into margin-violation
//! counts and sparse gradients. It only reads the shared matrices; merging
//! the gradients is the worker's job, so the worker is the single place where
//! concurrent writes (conflicts) can be observed.
//!
//! All strategies share the contract of margin-based ranking:
//!
//! ```text
//! lower distance = more plausible
//! violation  <=>  d(h, r, t) + margin > d(h', r, t')
//! L = max(0, margin + d(h, r, t) - d(h', r, t'))
//! ```
//!
//! # TransE
//!
//! TransE ([Bordes et al. 2013](https://papers.nips.cc/paper/2013/hash/1cecc7a77928ca8133fa24680a88d2f9-Abstract.html))
//! treats relations as translations, `h + r ≈ t`. With `x = h + r - t`:
//!
//! | Norm | d(x) | ∂d/∂x |
//! |------|------|-------|
//! | L1 | Σ\|xᵢ\| | sign(xᵢ) |
//! | squared L2 | Σ xᵢ² | 2xᵢ |
//!
//! For a violating pair the loss gradient is `+∂d/∂x` for `h` and `r` and
//! `-∂d/∂x` for `t` on the true triple, and the opposite signs on the
//! corrupted one.

use crate::batch::BatchUnit;
use crate::config::ModelKind;
use crate::embeddings::EmbeddingMatrix;
use crate::gradient::GradientAccumulator;

/// Model-specific score-and-gradient capability.
pub trait ScoringStrategy: Send + Sync {
    /// Short model name for logs.
    fn name(&self) -> &'static str;

    /// Distance of a single triple. Lower is more plausible.
    fn distance(&self, head: &[f32], relation: &[f32], tail: &[f32]) -> f32;

    /// Score every row of `io`, add violations to `io.violations`, and write
    /// the loss gradients into `ge` (entities) and `gr` (relations).
    ///
    /// Must not write to `entities` or `relations`.
    #[allow(clippy::too_many_arguments)]
    fn process_batch(
        &self,
        io: &mut BatchUnit,
        entities: &EmbeddingMatrix,
        relations: &EmbeddingMatrix,
        margin: f32,
        epoch: u32,
        ge: &mut GradientAccumulator,
        gr: &mut GradientAccumulator,
    );
}

/// Distance used by [`TransE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Norm {
    L1,
    SquaredL2,
}

impl Norm {
    /// Distance of `h + r - t`; writes ∂d/∂x into `slope`.
    #[inline]
    fn distance_and_slope(&self, h: &[f32], r: &[f32], t: &[f32], slope: &mut [f32]) -> f32 {
        let mut sum = 0.0;
        for i in 0..h.len() {
            let x = h[i] + r[i] - t[i];
            match self {
                Norm::L1 => {
                    sum += x.abs();
                    slope[i] = if x > 0.0 {
                        1.0
                    } else if x < 0.0 {
                        -1.0
                    } else {
                        0.0
                    };
                }
                Norm::SquaredL2 => {
                    sum += x * x;
                    slope[i] = 2.0 * x;
                }
            }
        }
        sum
    }

    #[inline]
    fn distance(&self, h: &[f32], r: &[f32], t: &[f32]) -> f32 {
        let mut sum = 0.0;
        for i in 0..h.len() {
            let x = h[i] + r[i] - t[i];
            sum += match self {
                Norm::L1 => x.abs(),
                Norm::SquaredL2 => x * x,
            };
        }
        sum
    }
}

/// TransE: relations as translations in embedding space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransE {
    norm: Norm,
}

impl TransE {
    pub fn new(norm: Norm) -> Self {
        Self { norm }
    }

    pub fn l1() -> Self {
        Self::new(Norm::L1)
    }

    pub fn squared_l2() -> Self {
        Self::new(Norm::SquaredL2)
    }
}

impl ScoringStrategy for TransE {
    fn name(&self) -> &'static str {
        match self.norm {
            Norm::L1 => "TransE-L1",
            Norm::SquaredL2 => "TransE-L2",
        }
    }

    fn distance(&self, head: &[f32], relation: &[f32], tail: &[f32]) -> f32 {
        self.norm.distance(head, relation, tail)
    }

    fn process_batch(
        &self,
        io: &mut BatchUnit,
        entities: &EmbeddingMatrix,
        relations: &EmbeddingMatrix,
        margin: f32,
        _epoch: u32,
        ge: &mut GradientAccumulator,
        gr: &mut GradientAccumulator,
    ) {
        let dim = entities.dim();
        let mut h = vec![0.0; dim];
        let mut r = vec![0.0; dim];
        let mut t = vec![0.0; dim];
        let mut corrupted = vec![0.0; dim];
        let mut violations = 0;

        for i in 0..io.len() {
            let (row, pos, neg1, neg2) = io.row_with_signs(i);

            // Read the stamp before the values so a concurrent merge is never missed.
            let vh = entities.version(row.head);
            let vr = relations.version(row.relation);
            let vt = entities.version(row.tail);
            entities.read(row.head, &mut h);
            relations.read(row.relation, &mut r);
            entities.read(row.tail, &mut t);

            let d_pos = self.norm.distance_and_slope(&h, &r, &t, pos);

            if let Some(nh) = row.neg_head {
                let vnh = entities.version(nh);
                entities.read(nh, &mut corrupted);
                let d_neg = self.norm.distance_and_slope(&corrupted, &r, &t, neg1);
                if d_pos + margin > d_neg {
                    violations += 1;
                    ge.add(row.head, vh, 1.0, pos);
                    gr.add(row.relation, vr, 1.0, pos);
                    ge.add(row.tail, vt, -1.0, pos);

                    ge.add(nh, vnh, -1.0, neg1);
                    gr.add(row.relation, vr, -1.0, neg1);
                    ge.add(row.tail, vt, 1.0, neg1);
                }
            }

            if let Some(nt) = row.neg_tail {
                let vnt = entities.version(nt);
                entities.read(nt, &mut corrupted);
                let d_neg = self.norm.distance_and_slope(&h, &r, &corrupted, neg2);
                if d_pos + margin > d_neg {
                    violations += 1;
                    ge.add(row.head, vh, 1.0, pos);
                    gr.add(row.relation, vr, 1.0, pos);
                    ge.add(row.tail, vt, -1.0, pos);

                    ge.add(row.head, vh, -1.0, neg2);
                    gr.add(row.relation, vr, -1.0, neg2);
                    ge.add(nt, vnt, 1.0, neg2);
                }
            }
        }

        io.violations += violations;
    }
}

/// Instantiate the strategy named by the configuration.
pub fn strategy_for(kind: ModelKind) -> Box<dyn ScoringStrategy> {
    match kind {
        ModelKind::TranseL1 => Box::new(TransE::l1()),
        ModelKind::TranseL2 => Box::new(TransE::squared_l2()),
    }
}
