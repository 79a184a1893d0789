use crate::error::RuntimeError;
use crate::slots::SlotHolder;
use crate::supervisor::{self, FollowPhase};
use connectors::postgres::{
    catalog::CatalogLoader,
    client,
    origin::OriginStore,
    sentinel::SentinelStore,
    snapshot::{SnapshotSession, set_transaction_snapshot},
};
use engine_copy::{
    schema::SchemaDriver,
    sequences::reset_sequences,
    tabledata::CopySummary,
};
use engine_core::{config::RunOptions, error::CoreError, workdir::{DumpPass, WorkDir}};
use engine_follow::segments::scan_segments;
use model::{lsn::Lsn, sentinel::SentinelRow, slot::SlotDescriptor};
use std::sync::Arc;
use tokio_postgres::{Client, error::SqlState, types::PgLsn};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// `pgcopydb snapshot`: export a snapshot (and, with `--follow`, create
/// the replication slot atomically with it), then hold everything open
/// until killed so other invocations can attach.
pub async fn snapshot(options: RunOptions, cancel: CancellationToken) -> Result<(), RuntimeError> {
    let workdir = WorkDir::for_target(&options.target_uri)?;
    workdir.ensure_layout()?;
    workdir.acquire_pid()?;

    let result = snapshot_inner(&options, &workdir, cancel).await;
    workdir.release_pid();
    result
}

async fn snapshot_inner(
    options: &RunOptions,
    workdir: &WorkDir,
    cancel: CancellationToken,
) -> Result<(), RuntimeError> {
    if options.follow {
        let (slot, mut holder) = SlotHolder::create(
            options.source_uri.clone(),
            options.slot_name.clone(),
            options.plugin,
        )
        .await?;
        workdir.save_slot(&slot)?;
        info!(
            slot = %slot.slot_name,
            lsn = %slot.consistent_lsn,
            snapshot = slot.snapshot_name.as_deref().unwrap_or("-"),
            "snapshot exported with replication slot; holding until killed"
        );
        cancel.cancelled().await;
        holder.release();
    } else {
        let session = SnapshotSession::begin(&options.source_uri).await?;
        info!(snapshot = session.snapshot_id(), "snapshot exported; holding until killed");
        cancel.cancelled().await;
        session.release().await?;
    }
    Ok(())
}

/// `pgcopydb copy table-data`: the bulk phase. Schema, data, indexes,
/// constraints, extension config and sequences, all under one snapshot,
/// with crash-safe resumability throughout.
pub async fn copy_table_data(
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<CopySummary, RuntimeError> {
    let workdir = prepare_workdir(&options, true)?;
    let result = copy_inner(&options, &workdir, cancel).await;
    workdir.release_pid();
    result
}

async fn copy_inner(
    options: &RunOptions,
    workdir: &WorkDir,
    cancel: CancellationToken,
) -> Result<CopySummary, RuntimeError> {
    // Snapshot first; with --follow the slot is created in the same
    // command so snapshot and slot agree on the start position.
    let mut slot_holder: Option<SlotHolder> = None;
    let mut snapshot_session: Option<SnapshotSession> = None;
    let mut slot: Option<SlotDescriptor> = None;

    let snapshot_id = if options.follow {
        let (descriptor, holder) = ensure_slot(options, workdir).await?;
        let snapshot_name = descriptor.snapshot_name.clone();
        slot = Some(descriptor);
        match (holder, snapshot_name) {
            (Some(holder), Some(name)) => {
                slot_holder = Some(holder);
                name
            }
            // Reusing an existing slot: its exported snapshot is long
            // gone, so the copy gets its own consistent view.
            _ => {
                let session = SnapshotSession::begin(&options.source_uri).await?;
                let id = session.snapshot_id().to_string();
                snapshot_session = Some(session);
                id
            }
        }
    } else {
        let session = SnapshotSession::begin(&options.source_uri).await?;
        let id = session.snapshot_id().to_string();
        snapshot_session = Some(session);
        id
    };

    // Load the catalog under the same snapshot the workers will use.
    let catalog_client = client::connect(&options.source_uri).await?;
    set_transaction_snapshot(&catalog_client, &snapshot_id).await?;
    let catalog = CatalogLoader::new(
        &catalog_client,
        options.filters.clone(),
        options.split_tables_larger_than,
    )
    .load()
    .await?;
    catalog_client
        .batch_execute("ROLLBACK")
        .await
        .map_err(connectors::error::DbError::Pg)?;

    info!(
        bytes = catalog.total_bytes(),
        rows_estimate = catalog.total_row_estimate(),
        "bulk copy scheduling totals"
    );

    let target_client = client::connect(&options.target_uri).await?;
    let driver = SchemaDriver::new(options, workdir);

    driver.dump(DumpPass::PreData, Some(&snapshot_id)).await?;
    driver.restore(DumpPass::PreData, &catalog, &target_client).await?;

    let summary = supervisor::run_copy_phase(
        options,
        workdir,
        Arc::new(catalog.clone()),
        Some(snapshot_id.clone()),
        cancel.clone(),
    )
    .await?;

    driver.dump(DumpPass::PostData, Some(&snapshot_id)).await?;
    driver.restore(DumpPass::PostData, &catalog, &target_client).await?;

    reset_sequences(&catalog, &target_client).await?;

    // The snapshot did its job; release before flipping the sentinel.
    if let Some(session) = snapshot_session.take() {
        session.release().await?;
    }
    if let Some(mut holder) = slot_holder.take() {
        holder.release();
    }

    if options.follow {
        if let Some(slot) = slot {
            let sentinel_client = client::connect(&options.source_uri).await?;
            let store = SentinelStore::new(&sentinel_client);
            store
                .setup(slot.consistent_lsn, options.endpos.unwrap_or(Lsn::INVALID))
                .await?;
            // Bulk data is on the target: replay may begin.
            store.update_apply(true).await?;
        }
    }

    Ok(summary)
}

/// `pgcopydb follow`: stream, transform and apply changes until the end
/// position is reached (or until stopped).
pub async fn follow(options: RunOptions, cancel: CancellationToken) -> Result<Lsn, RuntimeError> {
    let workdir = prepare_workdir(&options, false)?;
    let result = follow_inner(&options, &workdir, cancel).await;
    workdir.release_pid();
    result
}

async fn follow_inner(
    options: &RunOptions,
    workdir: &WorkDir,
    cancel: CancellationToken,
) -> Result<Lsn, RuntimeError> {
    let (slot, holder) = ensure_slot(options, workdir).await?;
    // A slot created right now has no bulk copy to synchronize with; the
    // exported snapshot is simply not used.
    drop(holder);

    let sentinel_client = client::connect(&options.source_uri).await?;
    let row = ensure_sentinel(&sentinel_client, &slot, options).await?;

    if let Some(endpos) = options.endpos {
        SentinelStore::new(&sentinel_client).update_endpos(endpos).await?;
    }

    workdir.save_origin(&options.origin)?;

    let scan = scan_segments(&workdir.cdc_dir())?;
    let start_lsn = slot
        .consistent_lsn
        .max(row.flush_lsn)
        .max(scan.last_commit_lsn.unwrap_or(Lsn::INVALID));

    info!(
        slot = %slot.slot_name,
        start = %start_lsn,
        backlog = scan.complete.len(),
        "follow starting"
    );

    supervisor::run_follow_phase(
        FollowPhase {
            options: options.clone(),
            workdir: workdir.clone(),
            slot_name: slot.slot_name.clone(),
            start_lsn,
            backlog: scan.complete,
        },
        cancel,
    )
    .await
}

/// `pgcopydb stream cleanup`: drop the replication slot and the origin,
/// drop the sentinel schema, and clear the work directory.
pub async fn stream_cleanup(options: RunOptions) -> Result<(), RuntimeError> {
    let workdir = WorkDir::for_target(&options.target_uri)?;
    workdir.ensure_layout()?;
    workdir.acquire_pid()?;

    let result = cleanup_inner(&options, &workdir).await;
    workdir.release_pid();
    result
}

async fn cleanup_inner(options: &RunOptions, workdir: &WorkDir) -> Result<(), RuntimeError> {
    let source = client::connect(&options.source_uri).await?;
    let dropped = source
        .execute(
            "select pg_drop_replication_slot(slot_name)
               from pg_replication_slots where slot_name = $1",
            &[&options.slot_name],
        )
        .await
        .map_err(connectors::error::DbError::Pg)?;
    if dropped > 0 {
        info!(slot = %options.slot_name, "replication slot dropped");
    }

    SentinelStore::new(&source).teardown().await?;

    let target = client::connect(&options.target_uri).await?;
    OriginStore::new(&target, options.origin.clone()).drop().await?;

    workdir.remove_all()?;
    info!("stream cleanup complete");
    Ok(())
}

/// Resolve the work directory and enforce the single-writer and
/// resume/restart rules. The previous-state gate only applies to the
/// bulk phase; `follow` resumes by nature.
fn prepare_workdir(options: &RunOptions, gate_previous_state: bool) -> Result<WorkDir, RuntimeError> {
    let workdir = WorkDir::for_target(&options.target_uri)?;
    if options.restart {
        warn!(root = %workdir.root().display(), "restart requested, clearing work directory");
        workdir.remove_all()?;
    }
    workdir.ensure_layout()?;

    if gate_previous_state
        && !options.resume
        && !options.restart
        && workdir.has_previous_state()
    {
        return Err(CoreError::Config(format!(
            "work directory {} contains state from a previous run; \
             use --resume to continue it or --restart to start over",
            workdir.root().display()
        ))
        .into());
    }

    workdir.acquire_pid()?;
    Ok(workdir)
}

/// Slot policy: reuse only a slot this tool created (descriptor on disk,
/// plugin matching); anything else is a configuration error. Creation
/// returns the holder keeping the exported snapshot alive.
async fn ensure_slot(
    options: &RunOptions,
    workdir: &WorkDir,
) -> Result<(SlotDescriptor, Option<SlotHolder>), RuntimeError> {
    let source = client::connect(&options.source_uri).await?;
    let existing = source
        .query_opt(
            "select plugin, confirmed_flush_lsn
               from pg_replication_slots where slot_name = $1",
            &[&options.slot_name],
        )
        .await
        .map_err(connectors::error::DbError::Pg)?;
    let persisted = workdir.load_slot()?;

    match (persisted, existing) {
        (Some(descriptor), Some(row)) => {
            let plugin: String = row.get(0);
            if plugin != descriptor.plugin {
                return Err(CoreError::Config(format!(
                    "replication slot {} exists with plugin {plugin}, expected {}",
                    options.slot_name, descriptor.plugin
                ))
                .into());
            }
            let confirmed: Option<PgLsn> = row.get(1);
            let confirmed = confirmed.map(|lsn| Lsn(u64::from(lsn)));
            info!(
                slot = %descriptor.slot_name,
                confirmed = %confirmed.unwrap_or(Lsn::INVALID),
                "reusing replication slot"
            );
            Ok((descriptor, None))
        }
        (None, Some(_)) => Err(CoreError::Config(format!(
            "replication slot {} already exists on the source but was not created \
             by this work directory; drop it with `stream cleanup` or pick another slot",
            options.slot_name
        ))
        .into()),
        (Some(descriptor), None) => Err(CoreError::Config(format!(
            "replication slot {} is recorded in the work directory but missing on \
             the source; the stream cannot resume safely",
            descriptor.slot_name
        ))
        .into()),
        (None, None) => {
            let (slot, holder) = SlotHolder::create(
                options.source_uri.clone(),
                options.slot_name.clone(),
                options.plugin,
            )
            .await?;
            workdir.save_slot(&slot)?;
            Ok((slot, Some(holder)))
        }
    }
}

/// Make sure the sentinel row exists; first creation marks apply=true
/// because a standalone `follow` has no bulk copy to wait for.
async fn ensure_sentinel(
    client: &Client,
    slot: &SlotDescriptor,
    options: &RunOptions,
) -> Result<SentinelRow, RuntimeError> {
    let store = SentinelStore::new(client);
    match store.get().await {
        Ok(row) => Ok(row),
        Err(connectors::error::DbError::Pg(err))
            if err.code() == Some(&SqlState::UNDEFINED_TABLE) =>
        {
            store
                .setup(slot.consistent_lsn, options.endpos.unwrap_or(Lsn::INVALID))
                .await?;
            Ok(store.update_apply(true).await?)
        }
        Err(err) => Err(err.into()),
    }
}
