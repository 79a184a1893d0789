use connectors::error::{ConnectorError, DbError};
use engine_core::error::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Connection error: {0}")]
    Connector(#[from] ConnectorError),

    /// An external tool (dumper or restorer) exited non-zero; its exit
    /// code propagates into ours.
    #[error("{program} failed with status {code:?}: {stderr}")]
    Subprocess {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Copy units exhausted their retries. The run drained the queue
    /// first so everything else is as far along as it can be.
    #[error("{failed} copy unit(s) failed permanently")]
    UnitsFailed { failed: usize },

    #[error("Index build failed for {index}: {source}")]
    IndexBuild {
        index: String,
        #[source]
        source: DbError,
    },

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Shutdown requested")]
    ShutdownRequested,
}
