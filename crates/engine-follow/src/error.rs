use connectors::error::{ConnectorError, DbError, ReplicationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FollowError {
    /// Write failure under the CDC subtree: fatal, the cursor would lie.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Connection error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("{0}")]
    Replication(#[from] ReplicationError),

    #[error("Failed to decode stream record: {0}")]
    Json(#[from] serde_json::Error),

    /// A replay script line the applier cannot interpret.
    #[error("Invalid replay line: {0}")]
    InvalidReplayLine(String),

    #[error("Shutdown requested")]
    ShutdownRequested,
}
