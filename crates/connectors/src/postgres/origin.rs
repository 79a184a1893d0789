use crate::error::DbError;
use model::lsn::Lsn;
use tokio_postgres::{Client, types::PgLsn};
use tracing::{debug, info};

/// Target-side replication-origin bookkeeping. The origin's `remote_lsn`
/// is the crash-consistent record of how far replay has progressed.
pub struct OriginStore<'a> {
    client: &'a Client,
    name: String,
}

impl<'a> OriginStore<'a> {
    pub fn new(client: &'a Client, name: impl Into<String>) -> Self {
        OriginStore { client, name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn exists(&self) -> Result<bool, DbError> {
        let row = self
            .client
            .query_one(
                "select exists (select 1 from pg_replication_origin where roname = $1)",
                &[&self.name],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Create the origin when missing. Idempotent.
    pub async fn ensure(&self) -> Result<(), DbError> {
        if !self.exists().await? {
            self.client
                .execute("select pg_replication_origin_create($1)", &[&self.name])
                .await?;
            info!(origin = %self.name, "replication origin created");
        }
        Ok(())
    }

    pub async fn drop(&self) -> Result<(), DbError> {
        if self.exists().await? {
            self.client
                .execute("select pg_replication_origin_drop($1)", &[&self.name])
                .await?;
            info!(origin = %self.name, "replication origin dropped");
        }
        Ok(())
    }

    /// Last LSN recorded for this origin, `None` before any replay.
    pub async fn progress(&self) -> Result<Option<Lsn>, DbError> {
        if !self.exists().await? {
            return Ok(None);
        }
        let row = self
            .client
            .query_one(
                "select pg_replication_origin_progress($1, false)",
                &[&self.name],
            )
            .await?;
        let progress: Option<PgLsn> = row.get(0);
        Ok(progress.map(|lsn| Lsn(u64::from(lsn))))
    }

    /// Bind this session to the origin so transactional
    /// `pg_replication_origin_xact_setup` calls are accepted.
    pub async fn session_setup(&self) -> Result<(), DbError> {
        self.client
            .execute("select pg_replication_origin_session_setup($1)", &[&self.name])
            .await?;
        debug!(origin = %self.name, "origin session bound");
        Ok(())
    }

    pub async fn session_reset(&self) -> Result<(), DbError> {
        self.client
            .batch_execute("select pg_replication_origin_session_reset()")
            .await?;
        Ok(())
    }
}
