use crate::error::DbError;
use crate::postgres::client;
use tokio_postgres::Client;
use tracing::info;

/// A transactional snapshot held open on the source. Dropping the session
/// (or the process) releases the snapshot; keep it alive for as long as
/// any worker still attaches to it.
pub struct SnapshotSession {
    client: Client,
    snapshot_id: String,
}

impl SnapshotSession {
    /// Open a repeatable-read transaction and export its snapshot so other
    /// connections can attach to the same point in time.
    pub async fn begin(source_uri: &str) -> Result<Self, DbError> {
        let client = client::connect(source_uri)
            .await
            .map_err(|e| DbError::Unknown(e.to_string()))?;
        client
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .await?;
        let row = client.query_one("SELECT pg_export_snapshot()", &[]).await?;
        let snapshot_id: String = row.get(0);
        info!(snapshot = %snapshot_id, "snapshot exported");
        Ok(SnapshotSession { client, snapshot_id })
    }

    /// Wrap an externally exported snapshot (from atomic slot creation);
    /// the given connection is what holds it open, the caller keeps that
    /// connection alive elsewhere.
    pub fn from_exported(client: Client, snapshot_id: String) -> Self {
        SnapshotSession { client, snapshot_id }
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    /// End the holding transaction. The snapshot becomes unusable for new
    /// attachments from here on.
    pub async fn release(self) -> Result<(), DbError> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

/// Attach a worker connection to the exported snapshot. Must be the first
/// thing the transaction does.
pub async fn set_transaction_snapshot(client: &Client, snapshot_id: &str) -> Result<(), DbError> {
    client
        .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ, READ ONLY")
        .await?;
    client
        .batch_execute(&format!(
            "SET TRANSACTION SNAPSHOT {}",
            model::idents::quote_literal(snapshot_id)
        ))
        .await?;
    Ok(())
}
