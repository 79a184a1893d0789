use connectors::error::ConnectorError;
use engine_core::error::CoreError;
use engine_runtime::error::RuntimeError;
use thiserror::Error;

/// Exit codes promised by the CLI contract.
pub const EXIT_OK: i32 = 0;
pub const EXIT_INTERNAL_ERROR: i32 = 12;
pub const EXIT_BAD_ARGS: i32 = 13;
pub const EXIT_UNREACHABLE: i32 = 14;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    #[error("Endpoint unreachable: {0}")]
    Unreachable(#[from] ConnectorError),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Shutdown requested")]
    ShutdownRequested,
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            // A clean quit after a signal still counts as success.
            CliError::ShutdownRequested => EXIT_OK,
            CliError::Config(_) => EXIT_BAD_ARGS,
            CliError::Core(CoreError::Config(_)) => EXIT_BAD_ARGS,
            CliError::Core(CoreError::ConcurrentRun { .. }) => EXIT_BAD_ARGS,
            CliError::Unreachable(_) | CliError::Postgres(_) => EXIT_UNREACHABLE,
            CliError::Runtime(err) if err.is_shutdown() => EXIT_OK,
            CliError::Runtime(err) if err.is_configuration() => EXIT_BAD_ARGS,
            CliError::Runtime(err) if err.is_connectivity() => EXIT_UNREACHABLE,
            _ => EXIT_INTERNAL_ERROR,
        }
    }
}
