use std::string::FromUtf8Error;
use thiserror::Error;

/// All errors coming from the database/query layer.
#[derive(Debug, Error)]
pub enum DbError {
    /// Low-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any driver error.
    #[error("Pg error: {0}")]
    Pg(#[from] tokio_postgres::Error),

    /// UTF-8 decoding failed on some byte data.
    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] FromUtf8Error),

    /// The server answered with something the caller cannot use.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Errors happening during connection setup.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// An invalid database URL was provided.
    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),

    /// TLS configuration error.
    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] native_tls::Error),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(#[from] tokio_postgres::Error),
}

/// Errors on the logical-replication wire.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Replication connection failed: {0}")]
    Connect(String),

    /// A replication command did not yield the expected result.
    #[error("Replication command failed: {0}")]
    Command(String),

    /// Unexpected message shape on the wire. Fatal: the slot is left in
    /// place for human inspection.
    #[error("Replication protocol violation: {0}")]
    Protocol(String),

    #[error("{0}")]
    Model(#[from] model::error::ModelError),
}
