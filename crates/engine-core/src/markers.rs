use crate::error::CoreError;
use crate::workdir::WorkDir;
use std::fs::{self, File};
use std::path::PathBuf;
use tracing::debug;

/// Key of one unit of work. The fixed vocabulary covers the schema passes;
/// object units are keyed by their source OID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DoneKey {
    PreDataDump,
    PostDataDump,
    PreDataRestore,
    PostDataRestore,
    Table(u32),
    /// One copy unit of a split table.
    TableUnit(u32, usize),
    Index(u32),
}

impl DoneKey {
    fn relative_path(&self) -> PathBuf {
        match self {
            DoneKey::PreDataDump => PathBuf::from("pre-data-dump.done"),
            DoneKey::PostDataDump => PathBuf::from("post-data-dump.done"),
            DoneKey::PreDataRestore => PathBuf::from("pre-data-restore.done"),
            DoneKey::PostDataRestore => PathBuf::from("post-data-restore.done"),
            DoneKey::Table(oid) => ["objects", "tables", &format!("{oid}.done")].iter().collect(),
            DoneKey::TableUnit(oid, unit) => {
                ["objects", "tables", &format!("{oid}.u{unit}.done")].iter().collect()
            }
            DoneKey::Index(oid) => ["objects", "indexes", &format!("{oid}.done")].iter().collect(),
        }
    }
}

/// Sentinel files proving units of work completed. Markers are zero-byte
/// and create-only; existence is the whole contract.
///
/// No locking: callers guarantee at most one writer per key.
#[derive(Debug, Clone)]
pub struct DoneMarkers {
    root: PathBuf,
}

impl DoneMarkers {
    pub fn new(workdir: &WorkDir) -> Self {
        DoneMarkers { root: workdir.root().to_path_buf() }
    }

    pub fn is_done(&self, key: DoneKey) -> bool {
        self.root.join(key.relative_path()).exists()
    }

    /// Durably create the marker. A crash mid-way leaves either no file or
    /// the complete (empty) file, never a half state: the temp file is
    /// fsynced before the atomic rename, and the parent directory after.
    pub fn mark_done(&self, key: DoneKey) -> Result<(), CoreError> {
        let path = self.root.join(key.relative_path());
        let parent = path
            .parent()
            .ok_or_else(|| CoreError::Config(format!("marker path has no parent: {}", path.display())))?;
        fs::create_dir_all(parent)?;

        let tmp = path.with_extension("done.tmp");
        let file = File::create(&tmp)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        File::open(parent)?.sync_all()?;

        debug!(marker = %path.display(), "unit of work recorded done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn markers() -> (tempfile::TempDir, DoneMarkers) {
        let dir = tempdir().unwrap();
        let workdir = WorkDir::at(dir.path().join("run"));
        workdir.ensure_layout().unwrap();
        let markers = DoneMarkers::new(&workdir);
        (dir, markers)
    }

    #[test]
    fn marker_round_trip() {
        let (_dir, markers) = markers();
        assert!(!markers.is_done(DoneKey::PreDataDump));
        markers.mark_done(DoneKey::PreDataDump).unwrap();
        assert!(markers.is_done(DoneKey::PreDataDump));
        // Marking twice is harmless.
        markers.mark_done(DoneKey::PreDataDump).unwrap();
    }

    #[test]
    fn object_keys_are_disjoint() {
        let (_dir, markers) = markers();
        markers.mark_done(DoneKey::Table(16386)).unwrap();
        assert!(markers.is_done(DoneKey::Table(16386)));
        assert!(!markers.is_done(DoneKey::Index(16386)));
        assert!(!markers.is_done(DoneKey::Table(16387)));
    }

    #[test]
    fn unit_markers_are_per_unit() {
        let (_dir, markers) = markers();
        markers.mark_done(DoneKey::TableUnit(42, 0)).unwrap();
        assert!(markers.is_done(DoneKey::TableUnit(42, 0)));
        assert!(!markers.is_done(DoneKey::TableUnit(42, 1)));
        assert!(!markers.is_done(DoneKey::Table(42)));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let (_dir, markers) = markers();
        markers.mark_done(DoneKey::Index(7)).unwrap();
        let dir = markers.root.join("objects").join("indexes");
        let leftovers: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
