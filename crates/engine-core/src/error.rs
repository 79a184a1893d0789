use model::error::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Any filesystem failure under the work directory. Fatal: progress
    /// bookkeeping would be unreliable past this point.
    #[error("Work directory I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another live process holds this work directory.
    #[error("Work directory is in use by pid {pid} ({path})")]
    ConcurrentRun { pid: u32, path: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Model(#[from] ModelError),

    #[error("Failed to encode persisted state: {0}")]
    Json(#[from] serde_json::Error),
}
