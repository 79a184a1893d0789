use connectors::error::{ConnectorError, DbError, ReplicationError};
use engine_copy::error::CopyError;
use engine_core::error::CoreError;
use engine_follow::error::FollowError;
use thiserror::Error;

/// Top-level errors for one engine invocation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("{0}")]
    Copy(#[from] CopyError),

    #[error("{0}")]
    Follow(#[from] FollowError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Connection error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("{0}")]
    Replication(#[from] ReplicationError),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Shutdown requested")]
    ShutdownRequested,
}

impl RuntimeError {
    /// True when the failure is the operator's command line, not the run.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RuntimeError::Core(CoreError::Config(_))
                | RuntimeError::Core(CoreError::ConcurrentRun { .. })
        )
    }

    /// True when an endpoint could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        match self {
            RuntimeError::Connector(_) => true,
            RuntimeError::Replication(ReplicationError::Connect(_)) => true,
            RuntimeError::Copy(CopyError::Connector(_)) => true,
            RuntimeError::Follow(FollowError::Connector(_)) => true,
            _ => false,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            RuntimeError::ShutdownRequested
                | RuntimeError::Copy(CopyError::ShutdownRequested)
                | RuntimeError::Follow(FollowError::ShutdownRequested)
        )
    }
}
