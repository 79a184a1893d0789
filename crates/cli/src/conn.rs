use crate::error::CliError;
use async_trait::async_trait;
use connectors::postgres::client;
use tracing::{error, info};

/// Trait for probing that an endpoint answers queries.
#[async_trait]
pub trait EndpointPinger {
    /// Attempts to ping; returns Err if unreachable.
    async fn ping(&self) -> Result<(), CliError>;
}

pub struct PostgresEndpointPinger {
    pub label: &'static str,
    pub conn_str: String,
}

#[async_trait]
impl EndpointPinger for PostgresEndpointPinger {
    async fn ping(&self) -> Result<(), CliError> {
        info!(endpoint = self.label, "pinging");

        let pg = client::connect(&self.conn_str).await.map_err(|e| {
            error!(endpoint = self.label, error = %e, "connection failed");
            CliError::Unreachable(e)
        })?;

        let row = pg.query_one("SELECT 1", &[]).await.map_err(|e| {
            error!(endpoint = self.label, error = %e, "ping query failed");
            CliError::Postgres(e)
        })?;

        let val: i32 = row.get(0);
        if val != 1 {
            return Err(CliError::Config(format!(
                "{} ping returned unexpected result: {val}",
                self.label
            )));
        }

        info!(endpoint = self.label, "ping succeeded");
        Ok(())
    }
}
