use thiserror::Error;

/// Errors that can occur in lattix-learn.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Invalid or missing hyperparameter. Raised before any thread starts.
    #[error("Configuration error: {0}")]
    Config(String),
    /// Matrix or vector dimensions do not agree.
    #[error("Shape mismatch: {0}")]
    Shape(String),
    /// Stored model is malformed.
    #[error("Invalid model format: {0}")]
    Format(String),
    /// A checkpoint could not be written.
    #[error("Checkpoint failed: {0}")]
    Checkpoint(String),
    /// The validation hook failed.
    #[error("Validation error: {0}")]
    Validation(String),
    /// A training or store thread panicked.
    #[error("Worker thread panicked: {0}")]
    WorkerPanic(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result type alias for lattix-learn.
pub type Result<T> = std::result::Result<T, Error>;
