use connectors::error::{ConnectorError, DbError};
use engine_core::retry::RetryDisposition;
use tokio_postgres::{Error as PgError, error::SqlState};

pub fn classify_connector_error(err: &ConnectorError) -> RetryDisposition {
    match err {
        ConnectorError::InvalidUrl(_) => RetryDisposition::Stop,
        ConnectorError::TlsConfig(_) => RetryDisposition::Retry,
        // Transient TCP and auth hiccups both deserve the bounded retries.
        ConnectorError::Connection(_) => RetryDisposition::Retry,
    }
}

pub fn classify_db_error(err: &DbError) -> RetryDisposition {
    match err {
        DbError::Io(_) => RetryDisposition::Retry,
        DbError::Pg(pg_err) => classify_pg_error(pg_err),
        DbError::Utf8(_) => RetryDisposition::Stop,
        DbError::Protocol(_) => RetryDisposition::Stop,
        DbError::Unknown(_) => RetryDisposition::Stop,
    }
}

pub fn classify_pg_error(err: &PgError) -> RetryDisposition {
    if err.is_closed() {
        return RetryDisposition::Retry;
    }

    if let Some(code) = err.code()
        && is_retryable_pg_code(code)
    {
        return RetryDisposition::Retry;
    }

    RetryDisposition::Stop
}

fn is_retryable_pg_code(code: &SqlState) -> bool {
    matches!(
        *code,
        SqlState::T_R_SERIALIZATION_FAILURE
            | SqlState::T_R_DEADLOCK_DETECTED
            | SqlState::LOCK_NOT_AVAILABLE
            | SqlState::TOO_MANY_CONNECTIONS
            | SqlState::ADMIN_SHUTDOWN
            | SqlState::CRASH_SHUTDOWN
            | SqlState::CANNOT_CONNECT_NOW
            | SqlState::CONNECTION_FAILURE
            | SqlState::CONNECTION_DOES_NOT_EXIST
            | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
            | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION
            | SqlState::CONNECTION_EXCEPTION
            | SqlState::OPERATOR_INTERVENTION
    )
}
