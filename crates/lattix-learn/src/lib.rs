//! Concurrent trainer for knowledge graph embeddings.
//!
//! Entities and relations are dense vectors; a fact `(h, r, t)` is plausible
//! when its distance `d(h, r, t)` is small. Training pushes true triples
//! below corrupted ones by at least a margin:
//!
//! ```text
//! L = Σ max(0, margin + d(h, r, t) - d(h', r, t'))
//! ```
//!
//! ## Pipeline
//!
//! | Piece | Module |
//! |-------|--------|
//! | rows of true + corrupted triples | [`source`], [`batch`] |
//! | distance and gradients | [`scoring`] |
//! | per-id gradient sums | [`gradient`] |
//! | lock-free (Hogwild) parameter updates | [`worker`], [`optimizer`], [`embeddings`] |
//! | epochs, validation, early stop | [`learner`], [`validation`], [`feedback`] |
//! | background snapshots | [`checkpoint`], [`persistence`] |
//!
//! Workers update the shared matrices without locks. Two workers touching the
//! same row at once may lose one update; such overlaps are counted as
//! conflicts and reported per epoch next to the margin violations.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lattix_learn::{LearnParams, Learner, ShuffledBatcher, Triple, TripleSet};
//!
//! let set = TripleSet::new(vec![Triple::new(0, 0, 1), Triple::new(1, 0, 2)]);
//! let params = LearnParams::default()
//!     .with_shape(set.num_entities(), set.num_relations(), 32)
//!     .with_epochs(50)
//!     .with_threads(4, 2);
//! let mut source = ShuffledBatcher::new(&set, params.numneg, params.seed);
//! let (model, report) = Learner::new(params)?.train(&mut source)?;
//! println!("{} violations", report.total_violations());
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod embeddings;
mod error;
pub mod feedback;
pub mod gradient;
pub mod learner;
mod model;
pub mod optimizer;
pub mod persistence;
pub mod queue;
pub mod scoring;
pub mod source;
pub mod tracer;
pub mod validation;
pub mod worker;

pub use batch::{BatchRow, BatchUnit};
pub use checkpoint::{CheckpointManager, CheckpointReport, CheckpointRequest};
pub use config::{LearnParams, ModelKind};
pub use embeddings::EmbeddingMatrix;
pub use error::{Error, Result};
pub use learner::{EpochStats, Learner, Phase, StopReason, TrainingReport};
pub use model::TrainedModel;
pub use optimizer::{OptimizerState, UpdateRule};
pub use persistence::{load_model, ModelMeta};
pub use scoring::{ScoringStrategy, TransE};
pub use source::{BatchSource, FixedRows, ShuffledBatcher, Triple, TripleSet};
pub use tracer::{FileTracer, GradientTracer, MemoryTracer};
pub use validation::{RankMetrics, RankValidator, ValidationReport, Validator};
