use crate::error::DbError;
use model::{lsn::Lsn, sentinel::SentinelRow};
use tokio_postgres::{Client, Row, types::PgLsn};
use tracing::debug;

const CREATE_SENTINEL: &str = "
create schema if not exists pgcopydb;
create table if not exists pgcopydb.sentinel (
    startpos pg_lsn not null default '0/0',
    endpos pg_lsn not null default '0/0',
    apply bool not null default false,
    write_lsn pg_lsn not null default '0/0',
    flush_lsn pg_lsn not null default '0/0',
    replay_lsn pg_lsn not null default '0/0'
);
";

const SENTINEL_COLUMNS: &str = "startpos, endpos, apply, write_lsn, flush_lsn, replay_lsn";

/// The single-row control table on the source, shared between the
/// receiver and the applier. Every write returns the post-write row in
/// the same round trip.
pub struct SentinelStore<'a> {
    client: &'a Client,
}

impl<'a> SentinelStore<'a> {
    pub fn new(client: &'a Client) -> Self {
        SentinelStore { client }
    }

    /// Create the table when missing and reset it to exactly one row with
    /// the given coordinates.
    pub async fn setup(&self, startpos: Lsn, endpos: Lsn) -> Result<SentinelRow, DbError> {
        self.client.batch_execute(CREATE_SENTINEL).await?;
        self.client.batch_execute("truncate pgcopydb.sentinel").await?;
        let row = self
            .client
            .query_one(
                &format!(
                    "insert into pgcopydb.sentinel (startpos, endpos, write_lsn, flush_lsn, replay_lsn)
                     values ($1, $2, $1, $1, $1)
                     returning {SENTINEL_COLUMNS}"
                ),
                &[&PgLsn::from(startpos.0), &PgLsn::from(endpos.0)],
            )
            .await?;
        debug!(%startpos, %endpos, "sentinel initialized");
        Ok(decode(&row))
    }

    pub async fn get(&self) -> Result<SentinelRow, DbError> {
        let row = self
            .client
            .query_one(
                &format!("select {SENTINEL_COLUMNS} from pgcopydb.sentinel"),
                &[],
            )
            .await?;
        Ok(decode(&row))
    }

    pub async fn update_apply(&self, apply: bool) -> Result<SentinelRow, DbError> {
        let row = self
            .client
            .query_one(
                &format!(
                    "update pgcopydb.sentinel set apply = $1 returning {SENTINEL_COLUMNS}"
                ),
                &[&apply],
            )
            .await?;
        Ok(decode(&row))
    }

    pub async fn update_endpos(&self, endpos: Lsn) -> Result<SentinelRow, DbError> {
        let row = self
            .client
            .query_one(
                &format!(
                    "update pgcopydb.sentinel set endpos = $1 returning {SENTINEL_COLUMNS}"
                ),
                &[&PgLsn::from(endpos.0)],
            )
            .await?;
        Ok(decode(&row))
    }

    pub async fn update_replay(&self, replay_lsn: Lsn) -> Result<SentinelRow, DbError> {
        let row = self
            .client
            .query_one(
                &format!(
                    "update pgcopydb.sentinel set replay_lsn = $1 returning {SENTINEL_COLUMNS}"
                ),
                &[&PgLsn::from(replay_lsn.0)],
            )
            .await?;
        Ok(decode(&row))
    }

    /// Receiver-side progress: what was written to segment files and what
    /// was durably flushed.
    pub async fn update_write_flush(
        &self,
        write_lsn: Lsn,
        flush_lsn: Lsn,
    ) -> Result<SentinelRow, DbError> {
        let row = self
            .client
            .query_one(
                &format!(
                    "update pgcopydb.sentinel set write_lsn = $1, flush_lsn = $2
                     returning {SENTINEL_COLUMNS}"
                ),
                &[&PgLsn::from(write_lsn.0), &PgLsn::from(flush_lsn.0)],
            )
            .await?;
        Ok(decode(&row))
    }

    /// Drop the control schema; part of stream cleanup.
    pub async fn teardown(&self) -> Result<(), DbError> {
        self.client
            .batch_execute("drop schema if exists pgcopydb cascade")
            .await?;
        Ok(())
    }
}

fn decode(row: &Row) -> SentinelRow {
    let lsn = |idx: usize| -> Lsn { Lsn(u64::from(row.get::<_, PgLsn>(idx))) };
    SentinelRow {
        startpos: lsn(0),
        endpos: lsn(1),
        apply: row.get(2),
        write_lsn: lsn(3),
        flush_lsn: lsn(4),
        replay_lsn: lsn(5),
    }
}
