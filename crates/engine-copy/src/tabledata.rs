use crate::classify::{classify_connector_error, classify_db_error};
use crate::error::CopyError;
use connectors::{
    error::DbError,
    postgres::{client, copy::stream_copy, snapshot::set_transaction_snapshot},
};
use engine_core::{
    config::RunOptions,
    markers::{DoneKey, DoneMarkers},
    retry::RetryPolicy,
    workdir::WorkDir,
};
use model::{
    catalog::{Catalog, CopyPartitioning, SourceTable},
    idents::{quote_ident, quote_qualified},
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default number of retries per copy unit after the initial attempt.
pub const DEFAULT_UNIT_RETRIES: usize = 2;

/// One schedulable slice of table data: the whole relation, a ctid page
/// range of it, or one leaf partition.
#[derive(Debug, Clone)]
pub struct CopyUnit {
    pub table_oid: u32,
    pub unit_index: usize,
    pub label: String,
    pub out_sql: String,
    pub in_sql: String,
}

/// Build the copy units for one table, in unit-index order.
pub fn plan_table_units(table: &SourceTable) -> Vec<CopyUnit> {
    let columns = column_list(table);
    let qualified = table.qualified_name();

    match &table.partitioning {
        CopyPartitioning::Whole => vec![CopyUnit {
            table_oid: table.oid,
            unit_index: 0,
            label: table.filter_name(),
            out_sql: format!("COPY {qualified} ({columns}) TO STDOUT (FORMAT binary)"),
            in_sql: format!("COPY {qualified} ({columns}) FROM STDIN (FORMAT binary)"),
        }],
        CopyPartitioning::CtidRange(ranges) => ranges
            .iter()
            .enumerate()
            .map(|(unit_index, range)| {
                let lower = format!("ctid >= '({},0)'::tid", range.start_page);
                let bounds = match range.end_page {
                    Some(end) => format!("{lower} and ctid < '({end},0)'::tid"),
                    None => lower,
                };
                CopyUnit {
                    table_oid: table.oid,
                    unit_index,
                    label: format!("{} [{unit_index}]", table.filter_name()),
                    out_sql: format!(
                        "COPY (SELECT {columns} FROM ONLY {qualified} WHERE {bounds}) \
                         TO STDOUT (FORMAT binary)"
                    ),
                    in_sql: format!("COPY {qualified} ({columns}) FROM STDIN (FORMAT binary)"),
                }
            })
            .collect(),
        CopyPartitioning::ByPartition(partitions) => partitions
            .iter()
            .enumerate()
            .map(|(unit_index, partition)| {
                let part = quote_qualified(&partition.nspname, &partition.relname);
                CopyUnit {
                    table_oid: table.oid,
                    unit_index,
                    label: format!("{}.{}", partition.nspname, partition.relname),
                    out_sql: format!("COPY {part} ({columns}) TO STDOUT (FORMAT binary)"),
                    in_sql: format!("COPY {part} ({columns}) FROM STDIN (FORMAT binary)"),
                }
            })
            .collect(),
    }
}

fn column_list(table: &SourceTable) -> String {
    table
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Default, Clone)]
pub struct CopySummary {
    pub tables_total: usize,
    pub tables_skipped: usize,
    pub units_copied: usize,
    pub units_failed: usize,
    pub rows_copied: u64,
    pub bytes_copied: u64,
}

struct SharedState {
    queue: Mutex<VecDeque<CopyUnit>>,
    /// Units left per table; a table is removed on unit failure so its
    /// marker can never be written by the surviving units.
    remaining: Mutex<HashMap<u32, usize>>,
    units_copied: AtomicUsize,
    units_failed: AtomicUsize,
    rows_copied: AtomicU64,
    bytes_copied: AtomicU64,
}

/// Parallel worker pool streaming table data from source to target under
/// the shared snapshot. Longest tables are queued first.
pub struct TableDataCopier {
    source_uri: String,
    target_uri: String,
    jobs: usize,
    retries: usize,
    markers: DoneMarkers,
}

impl TableDataCopier {
    pub fn new(options: &RunOptions, workdir: &WorkDir) -> Self {
        TableDataCopier {
            source_uri: options.source_uri.clone(),
            target_uri: options.target_uri.clone(),
            jobs: options.table_jobs,
            retries: DEFAULT_UNIT_RETRIES,
            markers: DoneMarkers::new(workdir),
        }
    }

    /// Copy every table that does not yet have a done marker. Finished
    /// table OIDs are announced on `tables_done_tx` as they complete so
    /// the index builder can start on them immediately.
    pub async fn run(
        &self,
        catalog: &Catalog,
        snapshot: Option<String>,
        tables_done_tx: mpsc::UnboundedSender<u32>,
        cancel: CancellationToken,
    ) -> Result<CopySummary, CopyError> {
        let mut queue = VecDeque::new();
        let mut remaining = HashMap::new();
        let mut tables_skipped = 0usize;

        for table in catalog.tables_by_size_desc() {
            if self.markers.is_done(DoneKey::Table(table.oid)) {
                tables_skipped += 1;
                let _ = tables_done_tx.send(table.oid);
                continue;
            }
            let units = plan_table_units(table);
            remaining.insert(table.oid, units.len());
            queue.extend(units);
        }

        let tables_total = catalog.tables.len();
        info!(
            tables = tables_total,
            skipped = tables_skipped,
            units = queue.len(),
            jobs = self.jobs,
            "table-data copy starting"
        );

        let shared = Arc::new(SharedState {
            queue: Mutex::new(queue),
            remaining: Mutex::new(remaining),
            units_copied: AtomicUsize::new(0),
            units_failed: AtomicUsize::new(0),
            rows_copied: AtomicU64::new(0),
            bytes_copied: AtomicU64::new(0),
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..self.jobs {
            workers.spawn(copy_worker(CopyWorkerContext {
                worker_id,
                source_uri: self.source_uri.clone(),
                target_uri: self.target_uri.clone(),
                snapshot: snapshot.clone(),
                retries: self.retries,
                markers: self.markers.clone(),
                shared: shared.clone(),
                tables_done_tx: tables_done_tx.clone(),
                cancel: cancel.clone(),
            }));
        }
        drop(tables_done_tx);

        while let Some(result) = workers.join_next().await {
            result??;
        }

        let summary = CopySummary {
            tables_total,
            tables_skipped,
            units_copied: shared.units_copied.load(Ordering::SeqCst),
            units_failed: shared.units_failed.load(Ordering::SeqCst),
            rows_copied: shared.rows_copied.load(Ordering::SeqCst),
            bytes_copied: shared.bytes_copied.load(Ordering::SeqCst),
        };

        if cancel.is_cancelled() {
            return Err(CopyError::ShutdownRequested);
        }
        if summary.units_failed > 0 {
            return Err(CopyError::UnitsFailed { failed: summary.units_failed });
        }

        info!(
            units = summary.units_copied,
            rows = summary.rows_copied,
            bytes = summary.bytes_copied,
            "table-data copy complete"
        );
        Ok(summary)
    }
}

struct CopyWorkerContext {
    worker_id: usize,
    source_uri: String,
    target_uri: String,
    snapshot: Option<String>,
    retries: usize,
    markers: DoneMarkers,
    shared: Arc<SharedState>,
    tables_done_tx: mpsc::UnboundedSender<u32>,
    cancel: CancellationToken,
}

async fn copy_worker(ctx: CopyWorkerContext) -> Result<(), CopyError> {
    if ctx.shared.queue.lock().await.is_empty() {
        return Ok(());
    }

    let connect_policy = RetryPolicy::for_connectivity();
    let source = connect_policy
        .run(|| client::connect(&ctx.source_uri), classify_connector_error)
        .await
        .map_err(|e| CopyError::Connector(e.into_inner()))?;
    let target = connect_policy
        .run(|| client::connect(&ctx.target_uri), classify_connector_error)
        .await
        .map_err(|e| CopyError::Connector(e.into_inner()))?;

    let unit_policy = RetryPolicy::for_copy_unit(ctx.retries);

    loop {
        // Cooperative cancellation: finish nothing new once asked to stop.
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }

        let unit = ctx.shared.queue.lock().await.pop_front();
        let Some(unit) = unit else {
            return Ok(());
        };

        let unit_key = DoneKey::TableUnit(unit.table_oid, unit.unit_index);
        if ctx.markers.is_done(unit_key) {
            finish_unit(&ctx, unit.table_oid).await?;
            continue;
        }

        let result = unit_policy
            .run(
                || copy_one_unit(&source, &target, &unit, ctx.snapshot.as_deref()),
                classify_db_error,
            )
            .await;

        match result {
            Ok((rows, bytes)) => {
                ctx.shared.units_copied.fetch_add(1, Ordering::SeqCst);
                ctx.shared.rows_copied.fetch_add(rows, Ordering::SeqCst);
                ctx.shared.bytes_copied.fetch_add(bytes, Ordering::SeqCst);
                ctx.markers.mark_done(unit_key)?;
                info!(worker = ctx.worker_id, unit = %unit.label, rows, "copy unit done");
                finish_unit(&ctx, unit.table_oid).await?;
            }
            Err(err) => {
                let err = err.into_inner();
                ctx.shared.units_failed.fetch_add(1, Ordering::SeqCst);
                // The table can no longer complete; drop it so its marker
                // is never written, and let the queue drain.
                ctx.shared.remaining.lock().await.remove(&unit.table_oid);
                warn!(worker = ctx.worker_id, unit = %unit.label, error = %err, "copy unit failed permanently");
            }
        }
    }
}

async fn finish_unit(ctx: &CopyWorkerContext, table_oid: u32) -> Result<(), CopyError> {
    let mut remaining = ctx.shared.remaining.lock().await;
    if let Some(count) = remaining.get_mut(&table_oid) {
        *count -= 1;
        if *count == 0 {
            remaining.remove(&table_oid);
            drop(remaining);
            ctx.markers.mark_done(DoneKey::Table(table_oid))?;
            let _ = ctx.tables_done_tx.send(table_oid);
        }
    }
    Ok(())
}

async fn copy_one_unit(
    source: &Client,
    target: &Client,
    unit: &CopyUnit,
    snapshot: Option<&str>,
) -> Result<(u64, u64), DbError> {
    match snapshot {
        Some(snapshot) => set_transaction_snapshot(source, snapshot).await?,
        None => {
            source
                .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ, READ ONLY")
                .await?
        }
    }

    let result = stream_copy(source, target, &unit.out_sql, &unit.in_sql).await;
    // The source side was read-only either way.
    let _ = source.batch_execute("ROLLBACK").await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::catalog::{PageRange, TableColumn, TablePartition};

    fn table(partitioning: CopyPartitioning) -> SourceTable {
        SourceTable {
            oid: 16386,
            nspname: "public".into(),
            relname: "events".into(),
            estimated_row_count: 1000,
            bytes: 1 << 20,
            relpages: 128,
            columns: vec![
                TableColumn { attnum: 1, name: "id".into(), type_name: "bigint".into() },
                TableColumn { attnum: 2, name: "payload".into(), type_name: "jsonb".into() },
            ],
            partition_key: None,
            partitioning,
        }
    }

    #[test]
    fn whole_table_is_one_binary_copy() {
        let units = plan_table_units(&table(CopyPartitioning::Whole));
        assert_eq!(units.len(), 1);
        assert_eq!(
            units[0].out_sql,
            "COPY \"public\".\"events\" (\"id\", \"payload\") TO STDOUT (FORMAT binary)"
        );
        assert_eq!(
            units[0].in_sql,
            "COPY \"public\".\"events\" (\"id\", \"payload\") FROM STDIN (FORMAT binary)"
        );
    }

    #[test]
    fn ctid_ranges_bound_the_scan() {
        let units = plan_table_units(&table(CopyPartitioning::CtidRange(vec![
            PageRange { start_page: 0, end_page: Some(64) },
            PageRange { start_page: 64, end_page: None },
        ])));
        assert_eq!(units.len(), 2);
        assert!(units[0].out_sql.contains("ctid >= '(0,0)'::tid and ctid < '(64,0)'::tid"));
        assert!(units[0].out_sql.contains("FROM ONLY"));
        // Last range is open-ended.
        assert!(units[1].out_sql.contains("ctid >= '(64,0)'::tid"));
        assert!(!units[1].out_sql.contains("ctid <"));
        assert_eq!(units[1].unit_index, 1);
    }

    #[test]
    fn partitions_copy_leaf_to_leaf() {
        let units = plan_table_units(&table(CopyPartitioning::ByPartition(vec![
            TablePartition { oid: 1, nspname: "public".into(), relname: "events_2024".into() },
            TablePartition { oid: 2, nspname: "public".into(), relname: "events_2025".into() },
        ])));
        assert_eq!(units.len(), 2);
        assert!(units[0].out_sql.contains("\"public\".\"events_2024\""));
        assert!(units[1].in_sql.contains("\"public\".\"events_2025\""));
    }
}
