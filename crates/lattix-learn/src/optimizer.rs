//! Update rules applied when a gradient is merged into a shared matrix.
//!
//! | Rule | Update |
//! |------|--------|
//! | SGD | `p -= lr * g` |
//! | AdaGrad | `acc += g^2; p -= lr * g / (sqrt(acc) + eps)` |
//!
//! AdaGrad (Duchi et al. 2011) keeps one accumulator per parameter component.
//! The accumulator is bumped with an atomic read-modify-write and the updated
//! value is the one used as the denominator, so under concurrent workers an
//! accumulator can only grow and the denominator is never stale or zero.

use crate::embeddings::EmbeddingMatrix;
use crate::error::{Error, Result};

/// How gradients are turned into parameter updates. Fixed for a whole run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateRule {
    Sgd { learning_rate: f32 },
    AdaGrad { learning_rate: f32, epsilon: f32 },
}

impl UpdateRule {
    pub fn learning_rate(&self) -> f32 {
        match *self {
            Self::Sgd { learning_rate } | Self::AdaGrad { learning_rate, .. } => learning_rate,
        }
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(self, Self::AdaGrad { .. })
    }

    /// Apply `grad` to row `id` of `params`.
    ///
    /// `accumulators` must be `Some` (and shaped like `params`) for AdaGrad;
    /// it is ignored for SGD.
    #[inline]
    pub fn apply(&self, params: &EmbeddingMatrix, accumulators: Option<&EmbeddingMatrix>, id: u64, grad: &[f32]) {
        match (*self, accumulators) {
            (Self::AdaGrad { learning_rate, epsilon }, Some(acc)) => {
                for (j, &g) in grad.iter().enumerate() {
                    if g == 0.0 {
                        continue;
                    }
                    let total = acc.add_atomic(id, j, g * g);
                    params.add(id, j, -learning_rate * g / (total.sqrt() + epsilon));
                }
            }
            (rule, _) => {
                let lr = rule.learning_rate();
                for (j, &g) in grad.iter().enumerate() {
                    if g != 0.0 {
                        params.add(id, j, -lr * g);
                    }
                }
            }
        }
    }
}

/// AdaGrad accumulators for the entity and relation matrices.
#[derive(Debug)]
pub struct OptimizerState {
    pub entities: EmbeddingMatrix,
    pub relations: EmbeddingMatrix,
}

impl OptimizerState {
    /// Zeroed accumulators shaped like the given matrices.
    pub fn zeros(ne: usize, nr: usize, dim: usize) -> Self {
        Self {
            entities: EmbeddingMatrix::new(ne, dim),
            relations: EmbeddingMatrix::new(nr, dim),
        }
    }

    /// Adopt previously accumulated values (warm start).
    pub fn from_matrices(entities: EmbeddingMatrix, relations: EmbeddingMatrix) -> Result<Self> {
        if entities.dim() != relations.dim() {
            return Err(Error::Shape(format!(
                "accumulator dims differ: entities {} vs relations {}",
                entities.dim(),
                relations.dim()
            )));
        }
        if entities.snapshot().iter().chain(relations.snapshot().iter()).any(|v| *v < 0.0 || !v.is_finite()) {
            return Err(Error::Format("AdaGrad accumulators must be finite and non-negative".into()));
        }
        Ok(Self { entities, relations })
    }

    pub fn check_shape(&self, ne: usize, nr: usize, dim: usize) -> Result<()> {
        let ok = self.entities.len() == ne
            && self.relations.len() == nr
            && self.entities.dim() == dim
            && self.relations.dim() == dim;
        if ok {
            Ok(())
        } else {
            Err(Error::Shape(format!(
                "optimizer state is {}x{} / {}x{}, expected {ne}x{dim} / {nr}x{dim}",
                self.entities.len(),
                self.entities.dim(),
                self.relations.len(),
                self.relations.dim()
            )))
        }
    }
}
