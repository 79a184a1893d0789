use crate::error::FollowError;
use crate::script::{LsnMarker, ReplayLine, TxnMarker};
use model::idents::{quote_literal, quote_qualified};
use model::stream::{StreamAction, StreamRecord, TupleColumn};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct PendingTxn {
    xid: u32,
    timestamp: Option<String>,
    statements: Vec<String>,
}

/// Turns segment files of stream records into replayable SQL scripts,
/// one transaction at a time. A transaction is held back until its
/// COMMIT arrives, so a transaction straddling segment files lands
/// complete in the file where it commits.
pub struct StreamTransformer {
    pending: Option<PendingTxn>,
    skipped_records: u64,
}

impl Default for StreamTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTransformer {
    pub fn new() -> Self {
        StreamTransformer { pending: None, skipped_records: 0 }
    }

    /// Transform one record into zero or more script lines.
    pub fn transform_record(
        &mut self,
        record: &StreamRecord,
    ) -> Result<Vec<ReplayLine>, FollowError> {
        match record.action {
            StreamAction::Begin => {
                self.pending = Some(PendingTxn {
                    xid: record.xid.unwrap_or(0),
                    timestamp: record.timestamp.clone(),
                    statements: Vec::new(),
                });
                Ok(vec![])
            }

            StreamAction::Insert
            | StreamAction::Update
            | StreamAction::Delete
            | StreamAction::Truncate => {
                match statement_sql(record) {
                    Some(sql) => match self.pending.as_mut() {
                        Some(txn) => txn.statements.push(sql),
                        None => {
                            // Data outside a transaction is a shape we do
                            // not understand; keep the count visible.
                            self.skip(record);
                        }
                    },
                    None => self.skip(record),
                }
                Ok(vec![])
            }

            StreamAction::Message => {
                let rendered = record
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_default();
                if let Some(txn) = self.pending.as_mut() {
                    txn.statements.push(format!("-- message: {rendered}"));
                }
                Ok(vec![])
            }

            StreamAction::Commit => {
                let commit_lsn = record.commit_lsn.unwrap_or(record.lsn);
                let Some(txn) = self.pending.take() else {
                    debug!(lsn = %record.lsn, "commit without begin, already flushed");
                    return Ok(vec![]);
                };

                let marker = TxnMarker { xid: txn.xid, commit_lsn };
                let timestamp = record
                    .timestamp
                    .clone()
                    .or(txn.timestamp)
                    .map(|t| quote_literal(&t))
                    .unwrap_or_else(|| "now()".to_string());

                let mut lines = Vec::with_capacity(txn.statements.len() + 3);
                lines.push(ReplayLine::Begin(marker));
                lines.extend(txn.statements.into_iter().map(ReplayLine::Statement));
                // Advancing the origin inside the transaction is what makes
                // replay progress crash-consistent with the data.
                lines.push(ReplayLine::Statement(format!(
                    "SELECT pg_replication_origin_xact_setup('{commit_lsn}', {timestamp});"
                )));
                lines.push(ReplayLine::Commit(marker));
                Ok(lines)
            }

            StreamAction::Keepalive => {
                Ok(vec![ReplayLine::Keepalive(LsnMarker { lsn: record.lsn })])
            }
            StreamAction::Switch => Ok(vec![ReplayLine::Switch(LsnMarker { lsn: record.lsn })]),
            StreamAction::Endpos => Ok(vec![ReplayLine::Endpos(LsnMarker { lsn: record.lsn })]),
        }
    }

    fn skip(&mut self, record: &StreamRecord) {
        self.skipped_records += 1;
        warn!(
            action = ?record.action,
            lsn = %record.lsn,
            skipped = self.skipped_records,
            "record shape not understood, skipped"
        );
    }

    pub fn has_pending_transaction(&self) -> bool {
        self.pending.is_some()
    }

    /// Transform one `.json` segment into its `.sql` sibling. The script
    /// is written under a partial name and renamed once complete.
    pub fn transform_file(&mut self, segment_path: &Path) -> Result<PathBuf, FollowError> {
        let sql_path = script_path(segment_path);
        let partial_path = sql_path.with_extension("sql.partial");

        let reader = BufReader::new(File::open(segment_path)?);
        let mut writer = BufWriter::new(File::create(&partial_path)?);

        let mut lines_written = 0usize;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: StreamRecord = serde_json::from_str(&line)?;
            for replay_line in self.transform_record(&record)? {
                writer.write_all(replay_line.render()?.as_bytes())?;
                writer.write_all(b"\n")?;
                lines_written += 1;
            }
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&partial_path, &sql_path)?;

        info!(
            script = %sql_path.display(),
            lines = lines_written,
            pending_txn = self.has_pending_transaction(),
            "segment transformed"
        );
        Ok(sql_path)
    }

    /// Pipeline stage: transform segments as the receiver finishes them,
    /// handing each script to the applier. Runs at parallelism one; that
    /// is what preserves commit order.
    pub async fn run(
        mut self,
        mut segment_rx: mpsc::UnboundedReceiver<PathBuf>,
        script_tx: mpsc::UnboundedSender<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<(), FollowError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                segment = segment_rx.recv() => {
                    match segment {
                        Some(path) => {
                            let script = self.transform_file(&path)?;
                            if script_tx.send(script).is_err() {
                                // Applier is gone; stopping is orderly.
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

/// `<walseg>.json` → `<walseg>.sql`.
pub fn script_path(segment_path: &Path) -> PathBuf {
    segment_path.with_extension("sql")
}

fn statement_sql(record: &StreamRecord) -> Option<String> {
    let schema = record.schema.as_deref()?;
    let table = record.table.as_deref()?;
    let qualified = quote_qualified(schema, table);

    match record.action {
        StreamAction::Insert => {
            let columns = record.columns.as_ref()?;
            if columns.is_empty() {
                return None;
            }
            let names: Vec<String> = columns
                .iter()
                .map(|c| model::idents::quote_ident(&c.name))
                .collect();
            let values: Vec<String> = columns.iter().map(|c| literal(&c.value)).collect();
            Some(format!(
                "INSERT INTO {qualified} ({}) VALUES ({});",
                names.join(", "),
                values.join(", ")
            ))
        }
        StreamAction::Update => {
            let columns = record.columns.as_ref()?;
            let identity = record.identity.as_ref()?;
            if columns.is_empty() || identity.is_empty() {
                return None;
            }
            let assignments: Vec<String> = columns
                .iter()
                .map(|c| format!("{} = {}", model::idents::quote_ident(&c.name), literal(&c.value)))
                .collect();
            Some(format!(
                "UPDATE {qualified} SET {} WHERE {};",
                assignments.join(", "),
                where_clause(identity)
            ))
        }
        StreamAction::Delete => {
            let identity = record.identity.as_ref()?;
            if identity.is_empty() {
                return None;
            }
            Some(format!("DELETE FROM {qualified} WHERE {};", where_clause(identity)))
        }
        StreamAction::Truncate => Some(format!("TRUNCATE ONLY {qualified};")),
        _ => None,
    }
}

fn where_clause(identity: &[TupleColumn]) -> String {
    identity
        .iter()
        .map(|c| {
            let name = model::idents::quote_ident(&c.name);
            if c.value.is_null() {
                format!("{name} IS NULL")
            } else {
                format!("{name} = {}", literal(&c.value))
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Render a decoded column value as a SQL literal. Strings are always
/// quoted; the server casts them to the column type on apply.
fn literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => quote_literal(s),
        other => quote_literal(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::lsn::Lsn;
    use serde_json::json;

    fn tuple(name: &str, type_name: &str, value: serde_json::Value) -> TupleColumn {
        TupleColumn { name: name.into(), type_name: type_name.into(), value }
    }

    fn dml(action: StreamAction, lsn: u64) -> StreamRecord {
        let mut record = StreamRecord::marker(action, Lsn(lsn));
        record.schema = Some("public".into());
        record.table = Some("t".into());
        record
    }

    #[test]
    fn insert_renders_quoted_literals() {
        let mut record = dml(StreamAction::Insert, 0x100);
        record.columns = Some(vec![
            tuple("id", "integer", json!(1)),
            tuple("v", "text", json!("o'brien")),
            tuple("deleted", "boolean", json!(false)),
            tuple("note", "text", serde_json::Value::Null),
        ]);
        assert_eq!(
            statement_sql(&record).unwrap(),
            "INSERT INTO \"public\".\"t\" (\"id\", \"v\", \"deleted\", \"note\") \
             VALUES (1, 'o''brien', false, NULL);"
        );
    }

    #[test]
    fn update_uses_identity_for_where() {
        let mut record = dml(StreamAction::Update, 0x100);
        record.columns = Some(vec![tuple("v", "text", json!("new"))]);
        record.identity = Some(vec![tuple("id", "integer", json!(7))]);
        assert_eq!(
            statement_sql(&record).unwrap(),
            "UPDATE \"public\".\"t\" SET \"v\" = 'new' WHERE \"id\" = 7;"
        );
    }

    #[test]
    fn delete_with_null_identity_uses_is_null() {
        let mut record = dml(StreamAction::Delete, 0x100);
        record.identity = Some(vec![
            tuple("id", "integer", json!(7)),
            tuple("shard", "text", serde_json::Value::Null),
        ]);
        assert_eq!(
            statement_sql(&record).unwrap(),
            "DELETE FROM \"public\".\"t\" WHERE \"id\" = 7 AND \"shard\" IS NULL;"
        );
    }

    #[test]
    fn transaction_is_emitted_atomically_on_commit() {
        let mut transformer = StreamTransformer::new();

        let mut begin = StreamRecord::marker(StreamAction::Begin, Lsn(0x100));
        begin.xid = Some(771);
        assert!(transformer.transform_record(&begin).unwrap().is_empty());

        let mut insert = dml(StreamAction::Insert, 0x110);
        insert.columns = Some(vec![tuple("id", "integer", json!(1))]);
        assert!(transformer.transform_record(&insert).unwrap().is_empty());
        assert!(transformer.has_pending_transaction());

        let mut commit = StreamRecord::marker(StreamAction::Commit, Lsn(0x180));
        commit.commit_lsn = Some(Lsn(0x180));
        commit.timestamp = Some("2026-08-01 12:00:00+00".into());
        let lines = transformer.transform_record(&commit).unwrap();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], ReplayLine::Begin(TxnMarker { xid: 771, commit_lsn: Lsn(0x180) }));
        assert!(matches!(&lines[1], ReplayLine::Statement(sql) if sql.starts_with("INSERT")));
        assert!(matches!(
            &lines[2],
            ReplayLine::Statement(sql)
                if sql == "SELECT pg_replication_origin_xact_setup('0/180', '2026-08-01 12:00:00+00');"
        ));
        assert_eq!(lines[3], ReplayLine::Commit(TxnMarker { xid: 771, commit_lsn: Lsn(0x180) }));
        assert!(!transformer.has_pending_transaction());
    }

    #[test]
    fn keepalive_passes_through_outside_transactions() {
        let mut transformer = StreamTransformer::new();
        let lines = transformer
            .transform_record(&StreamRecord::marker(StreamAction::Keepalive, Lsn(0x42)))
            .unwrap();
        assert_eq!(lines, vec![ReplayLine::Keepalive(LsnMarker { lsn: Lsn(0x42) })]);
    }

    #[test]
    fn straddling_transaction_survives_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let seg_a = dir.path().join("000000010000000000000000.json");
        let seg_b = dir.path().join("000000010000000000000001.json");

        let mut begin = StreamRecord::marker(StreamAction::Begin, Lsn(0x100));
        begin.xid = Some(9);
        let mut insert = dml(StreamAction::Insert, 0x110);
        insert.columns = Some(vec![tuple("id", "integer", json!(1))]);
        let mut commit = StreamRecord::marker(StreamAction::Commit, Lsn(0x100_0010));
        commit.commit_lsn = Some(Lsn(0x100_0010));

        let write = |path: &Path, records: &[&StreamRecord]| {
            let mut content = String::new();
            for r in records {
                content.push_str(&serde_json::to_string(r).unwrap());
                content.push('\n');
            }
            fs::write(path, content).unwrap();
        };
        write(&seg_a, &[&begin, &insert]);
        write(&seg_b, &[&commit]);

        let mut transformer = StreamTransformer::new();
        let sql_a = transformer.transform_file(&seg_a).unwrap();
        assert!(transformer.has_pending_transaction());
        // Nothing emitted yet: the transaction is buffered.
        assert_eq!(fs::read_to_string(&sql_a).unwrap(), "");

        let sql_b = transformer.transform_file(&seg_b).unwrap();
        let script = fs::read_to_string(&sql_b).unwrap();
        assert!(script.starts_with("BEGIN; -- "));
        assert!(script.contains("INSERT INTO"));
        assert!(script.trim_end().lines().last().unwrap().starts_with("COMMIT; -- "));
    }
}
