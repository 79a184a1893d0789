use crate::error::FollowError;
use crate::progress::FollowProgress;
use crate::script::{LsnMarker, ReplayLine, TxnMarker};
use connectors::postgres::{client, origin::OriginStore, sentinel::SentinelStore};
use model::lsn::Lsn;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SENTINEL_POLL_INTERVAL: Duration = Duration::from_secs(1);
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Applier lifecycle. Replay only starts once the sentinel's `apply` flag
/// goes up, and ends at the end position or on an unrecoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    WaitingForSentinel,
    Ready,
    InTxn,
    Idle,
    Stopped,
}

/// Replay bookkeeping threaded through every script line.
pub struct ApplyMachine {
    pub state: ApplierState,
    /// Last commit LSN applied on the target (the origin's `remote_lsn`).
    pub previous_lsn: Lsn,
    /// True while inside a transaction being skipped as a duplicate.
    skipping: bool,
}

impl ApplyMachine {
    pub fn new(previous_lsn: Lsn) -> Self {
        ApplyMachine { state: ApplierState::Ready, previous_lsn, skipping: false }
    }

    /// Pure transition for one script line. Returns the SQL to execute on
    /// the target, if any; the caller reports errors and progress.
    pub fn step(&mut self, line: &ReplayLine, endpos: Lsn) -> Result<Option<String>, FollowError> {
        match line {
            ReplayLine::Begin(marker) => self.on_begin(*marker, endpos),
            ReplayLine::Statement(sql) => {
                if self.skipping {
                    Ok(None)
                } else if self.state == ApplierState::InTxn {
                    Ok(Some(sql.clone()))
                } else {
                    // Progress comments and stray statements outside a
                    // transaction have nothing to apply.
                    Ok(None)
                }
            }
            ReplayLine::Commit(marker) => self.on_commit(*marker, endpos),
            ReplayLine::Keepalive(marker) => self.on_keepalive(*marker, endpos),
            ReplayLine::Switch(_) | ReplayLine::Endpos(_) => Ok(None),
        }
    }

    fn on_begin(&mut self, marker: TxnMarker, endpos: Lsn) -> Result<Option<String>, FollowError> {
        if self.state == ApplierState::InTxn {
            return Err(FollowError::InvalidReplayLine(format!(
                "BEGIN inside open transaction (xid {})",
                marker.xid
            )));
        }

        // The cut-over happens before any transaction committing past the
        // end position ever starts.
        if endpos.is_valid() && marker.commit_lsn > endpos {
            info!(commit = %marker.commit_lsn, %endpos, "transaction past end position, stopping");
            self.state = ApplierState::Stopped;
            return Ok(None);
        }

        if marker.commit_lsn <= self.previous_lsn {
            debug!(commit = %marker.commit_lsn, xid = marker.xid, "duplicate transaction, skipping");
            self.skipping = true;
            self.state = ApplierState::InTxn;
            return Ok(None);
        }

        self.state = ApplierState::InTxn;
        Ok(Some("BEGIN".to_string()))
    }

    fn on_commit(&mut self, marker: TxnMarker, endpos: Lsn) -> Result<Option<String>, FollowError> {
        if self.state != ApplierState::InTxn {
            debug!(commit = %marker.commit_lsn, "commit without open transaction, ignoring");
            return Ok(None);
        }

        let was_skipping = self.skipping;
        self.skipping = false;
        self.previous_lsn = self.previous_lsn.max(marker.commit_lsn);

        if endpos.is_valid() && marker.commit_lsn >= endpos {
            self.state = ApplierState::Stopped;
        } else {
            self.state = ApplierState::Idle;
        }

        Ok((!was_skipping).then(|| "COMMIT".to_string()))
    }

    fn on_keepalive(&mut self, marker: LsnMarker, endpos: Lsn) -> Result<Option<String>, FollowError> {
        debug!(lsn = %marker.lsn, "keepalive");
        // A reduced end position takes effect at the next progress point.
        if endpos.is_valid() && self.previous_lsn >= endpos && self.state != ApplierState::InTxn {
            self.state = ApplierState::Stopped;
        }
        Ok(None)
    }
}

pub struct ApplierConfig {
    pub source_uri: String,
    pub target_uri: String,
    pub origin: String,
}

/// Replays transformed scripts on the target in commit order, advancing
/// the replication origin inside each transaction and reporting
/// `replay_lsn` back to the source's sentinel row.
pub struct StreamApplier {
    config: ApplierConfig,
    progress: Arc<FollowProgress>,
}

impl StreamApplier {
    pub fn new(config: ApplierConfig, progress: Arc<FollowProgress>) -> Self {
        StreamApplier { config, progress }
    }

    /// Consume scripts until the channel closes, the end position is
    /// reached, or cancellation. Returns the last applied commit LSN.
    /// A final synchronous sentinel update happens on every exit path.
    pub async fn run(
        self,
        mut script_rx: mpsc::UnboundedReceiver<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<Lsn, FollowError> {
        let target = client::connect(&self.config.target_uri).await?;
        let origin = OriginStore::new(&target, self.config.origin.clone());
        origin.ensure().await?;
        origin.session_setup().await?;

        let sentinel_client = Arc::new(client::connect(&self.config.source_uri).await?);

        self.wait_for_sentinel(&sentinel_client, &cancel).await?;

        let previous_lsn = origin.progress().await?.unwrap_or(Lsn::INVALID);
        self.progress.set_replay_lsn(previous_lsn);
        info!(origin = %self.config.origin, replayed = %previous_lsn, "applier ready");

        let mut machine = ApplyMachine::new(previous_lsn);
        let mut reporter = ProgressReporter::new(sentinel_client.clone());

        // Already past a (reduced) end position: report and leave.
        let endpos = self.progress.endpos();
        if endpos.is_valid() && previous_lsn >= endpos {
            info!(%endpos, replayed = %previous_lsn, "end position already replayed");
            machine.state = ApplierState::Stopped;
        }

        let mut result = Ok(());
        while machine.state != ApplierState::Stopped {
            let script = tokio::select! {
                _ = cancel.cancelled() => break,
                script = script_rx.recv() => script,
            };
            let Some(script) = script else { break };

            result = self
                .apply_script(&script, &target, &mut machine, &mut reporter)
                .await;
            if result.is_err() {
                break;
            }
        }

        let _ = origin.session_reset().await;

        // Mandatory final synchronous update, after the final COMMIT and
        // regardless of how the loop ended.
        reporter.drain().await;
        let final_lsn = machine.previous_lsn;
        let final_sync = SentinelStore::new(&sentinel_client)
            .update_replay(final_lsn)
            .await;

        if machine.state == ApplierState::Stopped {
            self.progress.request_stop();
        }

        match (result, final_sync) {
            (Err(err), _) => Err(err),
            (Ok(()), Err(err)) => Err(err.into()),
            (Ok(()), Ok(_)) => Ok(final_lsn),
        }
    }

    /// Block in `WAITING_FOR_SENTINEL` until `apply` goes true.
    async fn wait_for_sentinel(
        &self,
        sentinel_client: &Client,
        cancel: &CancellationToken,
    ) -> Result<(), FollowError> {
        let store = SentinelStore::new(sentinel_client);
        loop {
            let row = store.get().await?;
            self.progress.set_endpos(row.endpos);
            if row.apply {
                return Ok(());
            }
            debug!("waiting for sentinel apply flag");
            tokio::select! {
                _ = cancel.cancelled() => return Err(FollowError::ShutdownRequested),
                _ = tokio::time::sleep(SENTINEL_POLL_INTERVAL) => {}
            }
        }
    }

    async fn apply_script(
        &self,
        script: &Path,
        target: &Client,
        machine: &mut ApplyMachine,
        reporter: &mut ProgressReporter,
    ) -> Result<(), FollowError> {
        debug!(script = %script.display(), "applying script");
        let content = tokio::fs::read_to_string(script).await?;

        for raw_line in content.lines() {
            let Some(line) = ReplayLine::parse(raw_line)? else { continue };
            let is_commit = matches!(line, ReplayLine::Commit(_));
            let is_progress_point = is_commit || matches!(line, ReplayLine::Keepalive(_));

            let endpos = self.progress.endpos();
            if let Some(sql) = machine.step(&line, endpos)? {
                if let Err(err) = target.batch_execute(&sql).await {
                    // Failed mid-transaction: roll back so the final
                    // sentinel update is not blocked by an aborted txn.
                    let _ = target.batch_execute("ROLLBACK").await;
                    return Err(connectors::error::DbError::Pg(err).into());
                }
            }

            if is_commit {
                self.progress.set_replay_lsn(machine.previous_lsn);
            }
            if is_progress_point {
                reporter.report(machine.previous_lsn).await;
            }
            if machine.state == ApplierState::Stopped {
                info!(replayed = %machine.previous_lsn, "applier reached end position");
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Asynchronous `replay_lsn` reporting: at most one update per second,
/// and never more than one in flight. The previous update is drained
/// before the next is issued.
struct ProgressReporter {
    client: Arc<Client>,
    in_flight: Option<JoinHandle<()>>,
    last_report: Option<Instant>,
}

impl ProgressReporter {
    fn new(client: Arc<Client>) -> Self {
        ProgressReporter { client, in_flight: None, last_report: None }
    }

    async fn report(&mut self, replay_lsn: Lsn) {
        if let Some(last) = self.last_report {
            if last.elapsed() < REPORT_INTERVAL {
                return;
            }
        }

        if let Some(handle) = self.in_flight.take() {
            let _ = handle.await;
        }

        let client = self.client.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let store = SentinelStore::new(&client);
            if let Err(err) = store.update_replay(replay_lsn).await {
                warn!(error = %err, "sentinel replay update failed");
            }
        }));
        self.last_report = Some(Instant::now());
    }

    async fn drain(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin(commit_lsn: u64) -> ReplayLine {
        ReplayLine::Begin(TxnMarker { xid: 1, commit_lsn: Lsn(commit_lsn) })
    }

    fn commit(commit_lsn: u64) -> ReplayLine {
        ReplayLine::Commit(TxnMarker { xid: 1, commit_lsn: Lsn(commit_lsn) })
    }

    #[test]
    fn applies_new_transaction() {
        let mut machine = ApplyMachine::new(Lsn(0x100));

        let sql = machine.step(&begin(0x200), Lsn::INVALID).unwrap();
        assert_eq!(sql.as_deref(), Some("BEGIN"));
        assert_eq!(machine.state, ApplierState::InTxn);

        let sql = machine
            .step(&ReplayLine::Statement("INSERT INTO t VALUES (1);".into()), Lsn::INVALID)
            .unwrap();
        assert_eq!(sql.as_deref(), Some("INSERT INTO t VALUES (1);"));

        let sql = machine.step(&commit(0x200), Lsn::INVALID).unwrap();
        assert_eq!(sql.as_deref(), Some("COMMIT"));
        assert_eq!(machine.state, ApplierState::Idle);
        assert_eq!(machine.previous_lsn, Lsn(0x200));
    }

    #[test]
    fn duplicate_transaction_is_skipped_entirely() {
        let mut machine = ApplyMachine::new(Lsn(0x300));

        assert!(machine.step(&begin(0x200), Lsn::INVALID).unwrap().is_none());
        assert!(
            machine
                .step(&ReplayLine::Statement("INSERT INTO t VALUES (1);".into()), Lsn::INVALID)
                .unwrap()
                .is_none()
        );
        assert!(machine.step(&commit(0x200), Lsn::INVALID).unwrap().is_none());
        assert_eq!(machine.state, ApplierState::Idle);
        // Progress never went backwards.
        assert_eq!(machine.previous_lsn, Lsn(0x300));
    }

    #[test]
    fn stops_after_greatest_commit_at_or_below_endpos() {
        let endpos = Lsn(0x200);
        let mut machine = ApplyMachine::new(Lsn::INVALID);

        machine.step(&begin(0x200), endpos).unwrap();
        machine.step(&commit(0x200), endpos).unwrap();
        assert_eq!(machine.state, ApplierState::Stopped);
        assert_eq!(machine.previous_lsn, Lsn(0x200));
    }

    #[test]
    fn transaction_past_endpos_never_starts() {
        let endpos = Lsn(0x200);
        let mut machine = ApplyMachine::new(Lsn(0x150));

        let sql = machine.step(&begin(0x250), endpos).unwrap();
        assert!(sql.is_none());
        assert_eq!(machine.state, ApplierState::Stopped);
        assert_eq!(machine.previous_lsn, Lsn(0x150));
    }

    #[test]
    fn reduced_endpos_stops_at_next_keepalive() {
        let mut machine = ApplyMachine::new(Lsn(0x500));
        machine.state = ApplierState::Idle;

        machine
            .step(&ReplayLine::Keepalive(LsnMarker { lsn: Lsn(0x600) }), Lsn(0x400))
            .unwrap();
        assert_eq!(machine.state, ApplierState::Stopped);
    }

    #[test]
    fn begin_inside_transaction_is_a_protocol_error() {
        let mut machine = ApplyMachine::new(Lsn::INVALID);
        machine.step(&begin(0x100), Lsn::INVALID).unwrap();
        assert!(machine.step(&begin(0x110), Lsn::INVALID).is_err());
    }
}
