use crate::error::FollowError;
use crate::progress::FollowProgress;
use crate::segments::SegmentWriter;
use connectors::replication::{
    ReplicationSession,
    message::{WireMessage, XLogData},
};
use engine_core::config::OutputPlugin;
use model::lsn::Lsn;
use model::stream::{StreamAction, StreamRecord, TupleColumn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Decoding-plugin options requested at `START_REPLICATION`.
fn plugin_options(plugin: OutputPlugin) -> Vec<(&'static str, &'static str)> {
    match plugin {
        OutputPlugin::Wal2Json => vec![
            ("format-version", "2"),
            ("include-xids", "true"),
            ("include-timestamp", "true"),
            ("include-lsn", "true"),
        ],
        // These plugins produce shapes the transformer records verbatim.
        OutputPlugin::TestDecoding | OutputPlugin::PgOutput => vec![],
    }
}

pub struct ReceiverConfig {
    pub source_uri: String,
    pub slot_name: String,
    pub plugin: OutputPlugin,
    pub start_lsn: Lsn,
    pub cdc_dir: PathBuf,
    pub wal_segment_size: u64,
}

/// Consumes the logical-decoding stream and lays it down as JSON segment
/// files. Runs a blocking loop (the wire client blocks); the supervisor
/// hosts it on a blocking task.
pub struct StreamReceiver {
    config: ReceiverConfig,
    progress: Arc<FollowProgress>,
    segment_tx: mpsc::UnboundedSender<PathBuf>,
}

impl StreamReceiver {
    pub fn new(
        config: ReceiverConfig,
        progress: Arc<FollowProgress>,
        segment_tx: mpsc::UnboundedSender<PathBuf>,
    ) -> Self {
        StreamReceiver { config, progress, segment_tx }
    }

    pub fn run(self) -> Result<(), FollowError> {
        let session = ReplicationSession::connect(&self.config.source_uri)?;
        let identity = session.identify_system()?;

        session.start_replication(
            &self.config.slot_name,
            self.config.start_lsn,
            &plugin_options(self.config.plugin),
        )?;
        info!(
            slot = %self.config.slot_name,
            start = %self.config.start_lsn,
            timeline = identity.timeline,
            "receiving logical stream"
        );

        let mut writer = SegmentWriter::new(
            self.config.cdc_dir.clone(),
            identity.timeline,
            self.config.wal_segment_size,
        );
        let mut last_status = Instant::now();
        let mut endpos_written = false;

        let result = loop {
            if self.progress.stop_requested() {
                info!("stop requested, closing stream");
                break Ok(());
            }

            let endpos = self.progress.endpos();
            match session.receive() {
                Ok(Some(WireMessage::XLogData(data))) => {
                    let record = decode_payload(&data);
                    let record_lsn = record.lsn;
                    self.append(&mut writer, &record)?;
                    self.progress.set_write_lsn(data.wal_end.max(record_lsn));

                    if endpos.is_valid() && record_lsn >= endpos {
                        self.append(
                            &mut writer,
                            &StreamRecord::marker(StreamAction::Endpos, record_lsn),
                        )?;
                        endpos_written = true;
                        info!(%endpos, last = %record_lsn, "end position reached");
                        break Ok(());
                    }
                }
                Ok(Some(WireMessage::Keepalive(keepalive))) => {
                    let record =
                        StreamRecord::marker(StreamAction::Keepalive, keepalive.wal_end);
                    self.append(&mut writer, &record)?;
                    self.progress.set_write_lsn(keepalive.wal_end);

                    if keepalive.reply_requested {
                        self.send_status(&session)?;
                        last_status = Instant::now();
                    }

                    if endpos.is_valid() && keepalive.wal_end >= endpos {
                        self.append(
                            &mut writer,
                            &StreamRecord::marker(StreamAction::Endpos, keepalive.wal_end),
                        )?;
                        endpos_written = true;
                        info!(%endpos, "end position reached at keepalive");
                        break Ok(());
                    }
                }
                Ok(None) => {
                    warn!("copy stream ended by the server");
                    break Ok(());
                }
                Err(err) => break Err(FollowError::from(err)),
            }

            if last_status.elapsed() >= STATUS_INTERVAL {
                self.send_status(&session)?;
                last_status = Instant::now();
            }
        };

        if let Some(finished) = writer.finalize()? {
            self.progress.set_flush_lsn(self.progress.write_lsn());
            let _ = self.segment_tx.send(finished);
        }
        // One last acknowledgment so the source trims WAL it may trim.
        let _ = self.send_status(&session);

        if endpos_written {
            // Nothing more will arrive; the applier stops on its own.
            self.progress.request_stop();
        }
        result
    }

    fn append(&self, writer: &mut SegmentWriter, record: &StreamRecord) -> Result<(), FollowError> {
        if let Some(finished) = writer.write_record(record)? {
            // The finalized file is durable: flush catches up to what was
            // written before the rotation.
            self.progress.set_flush_lsn(self.progress.write_lsn());
            let _ = self.segment_tx.send(finished);
        }
        Ok(())
    }

    fn send_status(&self, session: &ReplicationSession) -> Result<(), FollowError> {
        session.send_status_update(
            self.progress.write_lsn(),
            self.progress.flush_lsn(),
            self.progress.replay_lsn(),
            false,
        )?;
        Ok(())
    }
}

/// Decode one XLogData payload into a stream record, augmenting the
/// plugin record with wire metadata. Payloads that do not parse as the
/// documented record shape are preserved verbatim as MESSAGE records.
pub fn decode_payload(data: &XLogData) -> StreamRecord {
    let wire_lsn = data.wal_start;

    let value: serde_json::Value = match serde_json::from_slice(&data.payload) {
        Ok(value) => value,
        Err(_) => return opaque_record(data, wire_lsn),
    };
    let Some(action_code) = value.get("action").and_then(|a| a.as_str()) else {
        return opaque_record(data, wire_lsn);
    };

    let action = match action_code {
        "B" => StreamAction::Begin,
        "C" => StreamAction::Commit,
        "I" => StreamAction::Insert,
        "U" => StreamAction::Update,
        "D" => StreamAction::Delete,
        "T" => StreamAction::Truncate,
        "M" => StreamAction::Message,
        _ => return opaque_record(data, wire_lsn),
    };

    let lsn = value
        .get("lsn")
        .and_then(|l| l.as_str())
        .and_then(|l| l.parse::<Lsn>().ok())
        .unwrap_or(wire_lsn);

    let tuples = |key: &str| -> Option<Vec<TupleColumn>> {
        value
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    };

    StreamRecord {
        action,
        xid: value.get("xid").and_then(|x| x.as_u64()).map(|x| x as u32),
        lsn,
        commit_lsn: (action == StreamAction::Commit).then_some(lsn),
        timestamp: value
            .get("timestamp")
            .and_then(|t| t.as_str())
            .map(str::to_string),
        schema: value.get("schema").and_then(|s| s.as_str()).map(str::to_string),
        table: value.get("table").and_then(|t| t.as_str()).map(str::to_string),
        columns: tuples("columns"),
        identity: tuples("identity"),
        message: (action == StreamAction::Message).then(|| value.clone()),
    }
}

fn opaque_record(data: &XLogData, lsn: Lsn) -> StreamRecord {
    let mut record = StreamRecord::marker(StreamAction::Message, lsn);
    record.message = Some(serde_json::Value::String(
        String::from_utf8_lossy(&data.payload).into_owned(),
    ));
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xlogdata(payload: &str, wal_start: u64) -> XLogData {
        XLogData {
            wal_start: Lsn(wal_start),
            wal_end: Lsn(wal_start + 8),
            server_clock_us: 0,
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn decodes_insert_record() {
        let payload = r#"{"action":"I","xid":771,"lsn":"0/24E1218","schema":"public","table":"t",
            "columns":[{"name":"id","type":"integer","value":1}]}"#;
        let record = decode_payload(&xlogdata(payload, 0x24E1218));
        assert_eq!(record.action, StreamAction::Insert);
        assert_eq!(record.xid, Some(771));
        assert_eq!(record.lsn.to_string(), "0/24E1218");
        assert_eq!(record.columns.as_ref().unwrap().len(), 1);
        assert!(record.commit_lsn.is_none());
    }

    #[test]
    fn commit_record_carries_commit_lsn() {
        let payload = r#"{"action":"C","lsn":"0/24E1260","timestamp":"2026-08-01 12:00:00+00"}"#;
        let record = decode_payload(&xlogdata(payload, 0x24E1250));
        assert_eq!(record.action, StreamAction::Commit);
        assert_eq!(record.commit_lsn, Some(Lsn(0x24E1260)));
        assert_eq!(record.timestamp.as_deref(), Some("2026-08-01 12:00:00+00"));
    }

    #[test]
    fn wire_lsn_is_the_fallback() {
        let payload = r#"{"action":"B","xid":9}"#;
        let record = decode_payload(&xlogdata(payload, 0x5000));
        assert_eq!(record.lsn, Lsn(0x5000));
    }

    #[test]
    fn unknown_payloads_become_message_records() {
        let record = decode_payload(&xlogdata("table public.t: INSERT: id[integer]:1", 0x100));
        assert_eq!(record.action, StreamAction::Message);
        assert!(record.message.is_some());

        let record = decode_payload(&xlogdata(r#"{"event":"new-style"}"#, 0x100));
        assert_eq!(record.action, StreamAction::Message);
    }

    #[test]
    fn wal2json_plugin_requests_v2_format() {
        let options = plugin_options(OutputPlugin::Wal2Json);
        assert!(options.contains(&("format-version", "2")));
        assert!(plugin_options(OutputPlugin::PgOutput).is_empty());
    }
}
