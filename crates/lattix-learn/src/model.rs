//! Trained model handed back by the learner or loaded from disk.

use crate::embeddings::EmbeddingMatrix;
use crate::error::{Error, Result};
use crate::optimizer::OptimizerState;
use crate::scoring::ScoringStrategy;

/// Entity and relation embeddings, plus AdaGrad state when it was kept.
#[derive(Debug)]
pub struct TrainedModel {
    pub entities: EmbeddingMatrix,
    pub relations: EmbeddingMatrix,
    pub optimizer: Option<OptimizerState>,
}

impl TrainedModel {
    pub fn new(entities: EmbeddingMatrix, relations: EmbeddingMatrix) -> Result<Self> {
        if entities.dim() != relations.dim() {
            return Err(Error::Shape(format!(
                "entity dim {} differs from relation dim {}",
                entities.dim(),
                relations.dim()
            )));
        }
        Ok(Self {
            entities,
            relations,
            optimizer: None,
        })
    }

    pub fn with_optimizer(mut self, state: OptimizerState) -> Result<Self> {
        state.check_shape(self.num_entities(), self.num_relations(), self.dim())?;
        self.optimizer = Some(state);
        Ok(self)
    }

    pub fn dim(&self) -> usize {
        self.entities.dim()
    }

    pub fn num_entities(&self) -> usize {
        self.entities.len()
    }

    pub fn num_relations(&self) -> usize {
        self.relations.len()
    }

    /// Distance of `(head, relation, tail)` under `strategy`.
    pub fn distance(&self, strategy: &dyn ScoringStrategy, head: u64, relation: u64, tail: u64) -> Result<f32> {
        if head as usize >= self.num_entities() || tail as usize >= self.num_entities() {
            return Err(Error::Shape(format!(
                "entity id out of range 0..{}",
                self.num_entities()
            )));
        }
        if relation as usize >= self.num_relations() {
            return Err(Error::Shape(format!(
                "relation id {relation} out of range 0..{}",
                self.num_relations()
            )));
        }
        Ok(strategy.distance(
            &self.entities.row(head),
            &self.relations.row(relation),
            &self.entities.row(tail),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::TransE;

    #[test]
    fn test_distance_checks_ids() {
        let e = EmbeddingMatrix::from_vec(2, 1, vec![0.0, 1.0]).unwrap();
        let r = EmbeddingMatrix::from_vec(1, 1, vec![1.0]).unwrap();
        let model = TrainedModel::new(e, r).unwrap();
        let s = TransE::l1();
        assert_eq!(model.distance(&s, 0, 0, 1).unwrap(), 0.0);
        assert!(model.distance(&s, 2, 0, 1).is_err());
        assert!(model.distance(&s, 0, 1, 1).is_err());
    }

    #[test]
    fn test_rejects_mismatched_dims() {
        let e = EmbeddingMatrix::new(2, 2);
        let r = EmbeddingMatrix::new(1, 3);
        assert!(TrainedModel::new(e, r).is_err());
    }
}
