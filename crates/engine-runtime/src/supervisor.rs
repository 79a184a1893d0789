use crate::error::RuntimeError;
use connectors::postgres::{client, sentinel::SentinelStore};
use engine_copy::{
    extensions::ExtensionConfigCopier,
    indexes::IndexBuilder,
    tabledata::{CopySummary, TableDataCopier},
};
use engine_core::{config::RunOptions, workdir::WorkDir};
use engine_follow::{
    apply::{ApplierConfig, StreamApplier},
    progress::FollowProgress,
    receiver::{ReceiverConfig, StreamReceiver},
    transform::StreamTransformer,
};
use model::{catalog::Catalog, lsn::Lsn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SENTINEL_BRIDGE_INTERVAL: Duration = Duration::from_secs(1);

/// Run the bulk-copy workers side by side: the table-data copier feeds
/// finished table OIDs to the index builder, and the extension-config
/// copier rides along. The first failure cancels the rest.
pub async fn run_copy_phase(
    options: &RunOptions,
    workdir: &WorkDir,
    catalog: Arc<Catalog>,
    snapshot: Option<String>,
    cancel: CancellationToken,
) -> Result<CopySummary, RuntimeError> {
    let (tables_done_tx, tables_done_rx) = mpsc::unbounded_channel();

    let copier = TableDataCopier::new(options, workdir);
    let copier_catalog = catalog.clone();
    let copier_cancel = cancel.clone();
    let copier_snapshot = snapshot.clone();
    let copier_handle = tokio::spawn(async move {
        copier
            .run(&copier_catalog, copier_snapshot, tables_done_tx, copier_cancel)
            .await
    });

    let builder = IndexBuilder::new(options, workdir);
    let builder_catalog = catalog.clone();
    let builder_cancel = cancel.clone();
    let builder_handle = tokio::spawn(async move {
        builder.run(&builder_catalog, tables_done_rx, builder_cancel).await
    });

    let extensions_handle = if options.skip_extensions {
        None
    } else {
        let copier = ExtensionConfigCopier::new(options, workdir);
        let ext_catalog = catalog.clone();
        let ext_snapshot = snapshot.clone();
        Some(tokio::spawn(async move {
            copier.run(&ext_catalog, ext_snapshot.as_deref()).await
        }))
    };

    // The copier is the pacemaker; collect it first, then the rest. Any
    // failure cancels whatever is still running.
    let summary = match copier_handle.await? {
        Ok(summary) => summary,
        Err(err) => {
            cancel.cancel();
            let _ = builder_handle.await;
            if let Some(handle) = extensions_handle {
                let _ = handle.await;
            }
            return Err(err.into());
        }
    };

    match builder_handle.await? {
        Ok(built) => info!(indexes = built, "index builder finished"),
        Err(err) => {
            cancel.cancel();
            if let Some(handle) = extensions_handle {
                let _ = handle.await;
            }
            return Err(err.into());
        }
    }

    if let Some(handle) = extensions_handle {
        handle.await??;
    }

    Ok(summary)
}

pub struct FollowPhase {
    pub options: RunOptions,
    pub workdir: WorkDir,
    pub slot_name: String,
    pub start_lsn: Lsn,
    /// Complete segments from a previous run, replayed through the
    /// transformer before live streaming output.
    pub backlog: Vec<PathBuf>,
}

/// Wire up and run the three-stage streaming pipeline plus the sentinel
/// bridge. Transformer and applier run at parallelism one, which is what
/// preserves source commit order on the target.
pub async fn run_follow_phase(
    phase: FollowPhase,
    cancel: CancellationToken,
) -> Result<Lsn, RuntimeError> {
    let progress = Arc::new(FollowProgress::new());

    // Prime the cached endpos/apply before anything starts moving.
    {
        let sentinel_client = client::connect(&phase.options.source_uri).await?;
        let row = SentinelStore::new(&sentinel_client).get().await?;
        if !row.is_consistent() {
            warn!(?row, "sentinel row coordinates are inconsistent");
        }
        progress.set_endpos(row.endpos);
        progress.set_replay_lsn(row.replay_lsn);
    }

    let (segment_tx, segment_rx) = mpsc::unbounded_channel();
    let (script_tx, script_rx) = mpsc::unbounded_channel();

    for segment in &phase.backlog {
        let _ = segment_tx.send(segment.clone());
    }

    let receiver = StreamReceiver::new(
        ReceiverConfig {
            source_uri: phase.options.source_uri.clone(),
            slot_name: phase.slot_name.clone(),
            plugin: phase.options.plugin,
            start_lsn: phase.start_lsn,
            cdc_dir: phase.workdir.cdc_dir(),
            wal_segment_size: model::lsn::DEFAULT_WAL_SEGMENT_SIZE,
        },
        progress.clone(),
        segment_tx,
    );
    let receiver_handle = tokio::task::spawn_blocking(move || receiver.run());

    let transformer_handle = tokio::spawn(
        StreamTransformer::new().run(segment_rx, script_tx, cancel.clone()),
    );

    let applier = StreamApplier::new(
        ApplierConfig {
            source_uri: phase.options.source_uri.clone(),
            target_uri: phase.options.target_uri.clone(),
            origin: phase.options.origin.clone(),
        },
        progress.clone(),
    );
    let applier_handle = tokio::spawn(applier.run(script_rx, cancel.clone()));

    let bridge_handle = tokio::spawn(sentinel_bridge(
        phase.options.source_uri.clone(),
        progress.clone(),
        cancel.clone(),
    ));

    // Cancellation must reach the blocking receiver through the shared
    // stop flag; it has no async suspension points.
    let stop_on_cancel = {
        let progress = progress.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            progress.request_stop();
        })
    };

    let applier_result = applier_handle.await?;
    progress.request_stop();

    let receiver_result = receiver_handle.await?;
    let transformer_result = transformer_handle.await?;
    let _ = bridge_handle.await;
    stop_on_cancel.abort();

    // The applier's verdict is the run's verdict; the other stages only
    // trump it when it succeeded.
    let replayed = applier_result?;
    receiver_result?;
    transformer_result?;

    if cancel.is_cancelled() {
        return Err(RuntimeError::ShutdownRequested);
    }

    info!(replayed = %replayed, "follow phase complete");
    Ok(replayed)
}

/// Once per tick: push the receiver's write/flush coordinates into the
/// sentinel row and pull the operator-controlled `apply`/`endpos` back
/// out. Sentinel values are never cached longer than one tick.
async fn sentinel_bridge(
    source_uri: String,
    progress: Arc<FollowProgress>,
    cancel: CancellationToken,
) {
    let client = match client::connect(&source_uri).await {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "sentinel bridge could not connect");
            return;
        }
    };
    let store = SentinelStore::new(&client);

    while !progress.stop_requested() && !cancel.is_cancelled() {
        let write = progress.write_lsn();
        let flush = progress.flush_lsn();
        if write.is_valid() {
            if let Err(err) = store.update_write_flush(write, flush).await {
                warn!(error = %err, "sentinel write/flush update failed");
            }
        }

        match store.get().await {
            Ok(row) => {
                progress.set_endpos(row.endpos);
                if row.endpos_reached() {
                    debug!(endpos = %row.endpos, "sentinel reports end position replayed");
                }
            }
            Err(err) => warn!(error = %err, "sentinel read failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(SENTINEL_BRIDGE_INTERVAL) => {}
        }
    }
}
