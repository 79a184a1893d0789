use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    /// The textual LSN did not match the `hi/lo` hexadecimal form.
    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    /// A `pg_restore --list` line we could not make sense of.
    #[error("Invalid archive list line: {0}")]
    InvalidArchiveLine(String),
}
