//! Training configuration.
//!
//! [`LearnParams`] is an immutable snapshot of every hyperparameter the
//! trainer recognizes. It is built once (programmatically with the `with_*`
//! methods, or from a JSON file), validated, and then passed by reference to
//! every component. Nothing reads hyperparameters from global state.
//!
//! ```rust,ignore
//! use lattix_learn::LearnParams;
//!
//! let params = LearnParams::default()
//!     .with_shape(14_951, 1_345, 100)
//!     .with_epochs(500)
//!     .with_learning_rate(0.01)
//!     .with_adagrad(true)
//!     .with_threads(8, 2);
//! params.validate()?;
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which scoring strategy the trainer instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    /// TransE with L1 distance: sum |h + r - t|.
    #[default]
    TranseL1,
    /// TransE with squared L2 distance: sum (h + r - t)^2.
    TranseL2,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TranseL1 => "transe-l1",
            Self::TranseL2 => "transe-l2",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "transe-l1" | "transe" | "l1" => Ok(Self::TranseL1),
            "transe-l2" | "l2" => Ok(Self::TranseL2),
            other => Err(Error::config(format!("unknown model kind: {other}"))),
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnParams {
    /// Number of epochs (default: 100).
    pub epochs: u32,
    /// Number of entities.
    pub ne: usize,
    /// Number of relations.
    pub nr: usize,
    /// Embedding dimension (default: 50).
    pub dim: usize,
    /// Margin for the ranking loss (default: 1.0).
    pub margin: f32,
    /// Learning rate (default: 0.001).
    pub learning_rate: f32,
    /// Rows per batch unit (default: 100).
    pub batch_size: usize,
    /// Use AdaGrad instead of plain SGD.
    pub adagrad: bool,
    /// AdaGrad denominator epsilon (default: 1e-8).
    pub adagrad_epsilon: f32,
    /// Training worker threads (default: 1).
    pub nthreads: usize,
    /// Checkpoint store threads (default: 1).
    pub nstorethreads: usize,
    /// Validate every `evalits` epochs. 0 disables validation.
    pub evalits: u32,
    /// Checkpoint every `storeits` epochs. 0 disables periodic checkpoints.
    pub storeits: u32,
    /// Directory that receives checkpoints and the final model.
    pub storefolder: Option<PathBuf>,
    /// Gzip checkpoint shards.
    pub compress_storage: bool,
    /// CSV file receiving per-update gradient traces.
    pub filetrace: Option<PathBuf>,
    /// Fraction of triples held out for validation.
    pub valid: f32,
    /// Fraction of triples held out for testing.
    pub test: f32,
    /// Corrupted copies emitted per positive triple (default: 1).
    pub numneg: usize,
    /// Enable the violation-trend early stop.
    pub feedback: bool,
    /// Minimum per-epoch drop in violation rate required to keep training.
    pub feedback_threshold: f64,
    /// Epochs that always run before the early stop is consulted.
    pub feedback_min_full_epochs: u32,
    /// Scoring strategy.
    pub model: ModelKind,
    /// Seed for initialization and sampling (default: 42).
    pub seed: u64,
    /// Capacity of the worker input queue. 0 means `2 * nthreads`.
    pub queue_capacity: usize,
}

impl Default for LearnParams {
    fn default() -> Self {
        Self {
            epochs: 100,
            ne: 0,
            nr: 0,
            dim: 50,
            margin: 1.0,
            learning_rate: 0.001,
            batch_size: 100,
            adagrad: false,
            adagrad_epsilon: 1e-8,
            nthreads: 1,
            nstorethreads: 1,
            evalits: 0,
            storeits: 0,
            storefolder: None,
            compress_storage: false,
            filetrace: None,
            valid: 0.0,
            test: 0.0,
            numneg: 1,
            feedback: false,
            feedback_threshold: 0.0,
            feedback_min_full_epochs: 0,
            model: ModelKind::default(),
            seed: 42,
            queue_capacity: 0,
        }
    }
}

impl LearnParams {
    /// Load parameters from a JSON file. Missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let params: Self = serde_json::from_str(&text)?;
        Ok(params)
    }

    pub fn with_shape(mut self, ne: usize, nr: usize, dim: usize) -> Self {
        self.ne = ne;
        self.nr = nr;
        self.dim = dim;
        self
    }

    pub fn with_epochs(mut self, epochs: u32) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_margin(mut self, margin: f32) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_adagrad(mut self, adagrad: bool) -> Self {
        self.adagrad = adagrad;
        self
    }

    pub fn with_threads(mut self, nthreads: usize, nstorethreads: usize) -> Self {
        self.nthreads = nthreads;
        self.nstorethreads = nstorethreads;
        self
    }

    pub fn with_eval_every(mut self, evalits: u32) -> Self {
        self.evalits = evalits;
        self
    }

    pub fn with_storage(mut self, folder: impl Into<PathBuf>, storeits: u32, compress: bool) -> Self {
        self.storefolder = Some(folder.into());
        self.storeits = storeits;
        self.compress_storage = compress;
        self
    }

    pub fn with_filetrace(mut self, path: impl Into<PathBuf>) -> Self {
        self.filetrace = Some(path.into());
        self
    }

    pub fn with_split(mut self, valid: f32, test: f32) -> Self {
        self.valid = valid;
        self.test = test;
        self
    }

    pub fn with_negative_samples(mut self, numneg: usize) -> Self {
        self.numneg = numneg;
        self
    }

    pub fn with_feedback(mut self, threshold: f64, min_full_epochs: u32) -> Self {
        self.feedback = true;
        self.feedback_threshold = threshold;
        self.feedback_min_full_epochs = min_full_epochs;
        self
    }

    pub fn with_model(mut self, model: ModelKind) -> Self {
        self.model = model;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Effective capacity of the worker input queue.
    pub fn input_capacity(&self) -> usize {
        if self.queue_capacity == 0 {
            2 * self.nthreads.max(1)
        } else {
            self.queue_capacity
        }
    }

    /// Check every hyperparameter. Called by the learner before it starts any thread.
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(Error::config("dim must be at least 1"));
        }
        if self.ne == 0 {
            return Err(Error::config("ne (entity count) must be at least 1"));
        }
        if self.nr == 0 {
            return Err(Error::config("nr (relation count) must be at least 1"));
        }
        if self.epochs == 0 {
            return Err(Error::config("epochs must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        if self.nthreads == 0 {
            return Err(Error::config("nthreads must be at least 1"));
        }
        if self.nstorethreads == 0 {
            return Err(Error::config("nstorethreads must be at least 1"));
        }
        if self.numneg == 0 {
            return Err(Error::config("numneg must be at least 1"));
        }
        if !self.margin.is_finite() || self.margin < 0.0 {
            return Err(Error::config(format!("margin must be finite and >= 0, got {}", self.margin)));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(Error::config(format!(
                "learning_rate must be finite and > 0, got {}",
                self.learning_rate
            )));
        }
        if !(self.adagrad_epsilon.is_finite() && self.adagrad_epsilon > 0.0) {
            return Err(Error::config("adagrad_epsilon must be finite and > 0"));
        }
        for (name, frac) in [("valid", self.valid), ("test", self.test)] {
            if !(0.0..1.0).contains(&frac) {
                return Err(Error::config(format!("{name} fraction must be in [0, 1), got {frac}")));
            }
        }
        if self.valid + self.test >= 1.0 {
            return Err(Error::config("valid + test must leave some training triples"));
        }
        if !self.feedback_threshold.is_finite() {
            return Err(Error::config("feedback_threshold must be finite"));
        }
        if self.storeits > 0 && self.storefolder.is_none() {
            return Err(Error::config("storeits is set but storefolder is missing"));
        }
        Ok(())
    }
}

impl fmt::Display for LearnParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
        write!(
            f,
            "epochs={} ne={} nr={} dim={} margin={} learningrate={} batchsize={} adagrad={} \
             nthreads={} nstorethreads={} evalits={} storeits={} storefolder={} compressstorage={} \
             filetrace={} valid={} test={} numneg={} feedback={} feedback_threshold={} \
             feedback_minfullepochs={} model={} seed={}",
            self.epochs,
            self.ne,
            self.nr,
            self.dim,
            self.margin,
            self.learning_rate,
            self.batch_size,
            self.adagrad,
            self.nthreads,
            self.nstorethreads,
            self.evalits,
            self.storeits,
            path(&self.storefolder),
            self.compress_storage,
            path(&self.filetrace),
            self.valid,
            self.test,
            self.numneg,
            self.feedback,
            self.feedback_threshold,
            self.feedback_min_full_epochs,
            self.model,
            self.seed,
        )
    }
}
