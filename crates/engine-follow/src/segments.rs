use crate::error::FollowError;
use model::lsn::Lsn;
use model::stream::{StreamAction, StreamRecord};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SEGMENT_SUFFIX: &str = ".json";
pub const PARTIAL_SUFFIX: &str = ".json.partial";

struct OpenSegment {
    name: String,
    partial_path: PathBuf,
    writer: BufWriter<File>,
}

/// Writes stream records into per-WAL-segment JSON files. A segment is
/// `<walseg>.json.partial` while open; on switch it is flushed, fsynced
/// and renamed to its final name, and the next file starts with a SWITCH
/// record. Partial files do not survive a restart.
pub struct SegmentWriter {
    cdc_dir: PathBuf,
    timeline: u32,
    wal_segment_size: u64,
    current: Option<OpenSegment>,
}

impl SegmentWriter {
    pub fn new(cdc_dir: impl Into<PathBuf>, timeline: u32, wal_segment_size: u64) -> Self {
        SegmentWriter {
            cdc_dir: cdc_dir.into(),
            timeline,
            wal_segment_size,
            current: None,
        }
    }

    /// Append one record, rotating first when its LSN belongs to a new
    /// WAL segment. Returns the finalized segment path on rotation.
    pub fn write_record(&mut self, record: &StreamRecord) -> Result<Option<PathBuf>, FollowError> {
        let segment_name = record.lsn.segment_name(self.timeline, self.wal_segment_size);

        let mut finalized = None;
        let needs_rotation = match &self.current {
            Some(open) => open.name != segment_name,
            None => true,
        };
        if needs_rotation {
            finalized = self.finalize()?;
            self.open_segment(&segment_name)?;
            if finalized.is_some() {
                // First line of the new file marks the switch.
                let switch = StreamRecord::marker(StreamAction::Switch, record.lsn);
                self.append_line(&switch)?;
            }
        }

        self.append_line(record)?;
        Ok(finalized)
    }

    fn open_segment(&mut self, name: &str) -> Result<(), FollowError> {
        let partial_path = self.cdc_dir.join(format!("{name}{PARTIAL_SUFFIX}"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&partial_path)?;
        debug!(segment = name, "segment opened");
        self.current = Some(OpenSegment {
            name: name.to_string(),
            partial_path,
            writer: BufWriter::new(file),
        });
        Ok(())
    }

    fn append_line(&mut self, record: &StreamRecord) -> Result<(), FollowError> {
        let Some(open) = self.current.as_mut() else {
            return Ok(());
        };
        let line = serde_json::to_string(record)?;
        open.writer.write_all(line.as_bytes())?;
        open.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Flush the open segment to durable storage under its partial name.
    pub fn sync(&mut self) -> Result<(), FollowError> {
        if let Some(open) = self.current.as_mut() {
            open.writer.flush()?;
            open.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Close the open segment: flush, fsync, rename to the final name.
    /// Returns the final path when a segment was actually closed.
    pub fn finalize(&mut self) -> Result<Option<PathBuf>, FollowError> {
        let Some(mut open) = self.current.take() else {
            return Ok(None);
        };
        open.writer.flush()?;
        open.writer.get_ref().sync_all()?;
        drop(open.writer);

        let final_path = self.cdc_dir.join(format!("{}{SEGMENT_SUFFIX}", open.name));
        fs::rename(&open.partial_path, &final_path)?;
        File::open(&self.cdc_dir)?.sync_all()?;
        info!(segment = %final_path.display(), "segment finalized");
        Ok(Some(final_path))
    }
}

/// What a restart finds in the CDC subtree.
#[derive(Debug, Default)]
pub struct SegmentScan {
    /// Complete segment files, in WAL order.
    pub complete: Vec<PathBuf>,
    /// Last commit LSN recorded in the highest complete segment.
    pub last_commit_lsn: Option<Lsn>,
}

/// Scan the CDC directory for crash recovery: drop partial segments (the
/// source re-sends), list complete ones, and read the resume position
/// from the highest segment's last COMMIT record.
pub fn scan_segments(cdc_dir: &Path) -> Result<SegmentScan, FollowError> {
    let mut complete = Vec::new();

    for entry in fs::read_dir(cdc_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(PARTIAL_SUFFIX) {
            warn!(segment = %name, "discarding partial segment from interrupted run");
            fs::remove_file(entry.path())?;
        } else if name.ends_with(SEGMENT_SUFFIX) {
            complete.push(entry.path());
        }
    }

    // Hex segment names sort lexicographically in WAL order.
    complete.sort();

    let last_commit_lsn = match complete.last() {
        Some(path) => last_commit_in_segment(path)?,
        None => None,
    };

    Ok(SegmentScan { complete, last_commit_lsn })
}

fn last_commit_in_segment(path: &Path) -> Result<Option<Lsn>, FollowError> {
    let reader = BufReader::new(File::open(path)?);
    let mut last_commit = None;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: StreamRecord = serde_json::from_str(&line)?;
        if record.action == StreamAction::Commit {
            last_commit = Some(record.commit_lsn.unwrap_or(record.lsn));
        }
    }

    Ok(last_commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::lsn::DEFAULT_WAL_SEGMENT_SIZE;
    use tempfile::tempdir;

    fn record(action: StreamAction, lsn: u64) -> StreamRecord {
        let mut record = StreamRecord::marker(action, Lsn(lsn));
        if action == StreamAction::Commit {
            record.commit_lsn = Some(Lsn(lsn));
        }
        record
    }

    #[test]
    fn rotation_renames_and_marks_switch() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::new(dir.path(), 1, DEFAULT_WAL_SEGMENT_SIZE);

        // Two records in segment 0, one in segment 1.
        writer.write_record(&record(StreamAction::Begin, 0x100)).unwrap();
        writer.write_record(&record(StreamAction::Commit, 0x200)).unwrap();
        let finalized = writer
            .write_record(&record(StreamAction::Begin, 0x100_0100))
            .unwrap();

        let finalized = finalized.expect("first segment should finalize on switch");
        assert!(finalized.ends_with("000000010000000000000000.json"));
        assert!(finalized.exists());

        writer.finalize().unwrap();
        let second = dir.path().join("000000010000000000000001.json");
        let content = fs::read_to_string(&second).unwrap();
        let first_line: StreamRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first_line.action, StreamAction::Switch);
    }

    #[test]
    fn scan_discards_partials_and_finds_resume_point() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::new(dir.path(), 1, DEFAULT_WAL_SEGMENT_SIZE);
        writer.write_record(&record(StreamAction::Begin, 0x100)).unwrap();
        writer.write_record(&record(StreamAction::Commit, 0x180)).unwrap();
        writer.write_record(&record(StreamAction::Begin, 0x200)).unwrap();
        writer.write_record(&record(StreamAction::Commit, 0x280)).unwrap();
        writer.finalize().unwrap();

        // An interrupted segment that never finalized.
        fs::write(dir.path().join("000000010000000000000001.json.partial"), "{}").unwrap();

        let scan = scan_segments(dir.path()).unwrap();
        assert_eq!(scan.complete.len(), 1);
        assert_eq!(scan.last_commit_lsn, Some(Lsn(0x280)));
        assert!(!dir.path().join("000000010000000000000001.json.partial").exists());
    }

    #[test]
    fn scan_of_empty_directory() {
        let dir = tempdir().unwrap();
        let scan = scan_segments(dir.path()).unwrap();
        assert!(scan.complete.is_empty());
        assert!(scan.last_commit_lsn.is_none());
    }
}
