use crate::error::CoreError;
use model::slot::SlotDescriptor;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Schema dump passes. Pre-data carries everything needed before table
/// data lands; post-data carries indexes, constraints, triggers and rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpPass {
    PreData,
    PostData,
}

impl DumpPass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DumpPass::PreData => "pre-data",
            DumpPass::PostData => "post-data",
        }
    }
}

/// Filesystem tree holding everything a run persists: done markers, dump
/// artifacts, CDC segments, the slot descriptor and the origin name.
///
/// The root is derived from the target URI so two runs against the same
/// target land on the same tree, which is what makes resumption work.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Resolve the per-target work directory under `$XDG_DATA_HOME/pgcopydb`
    /// (or the platform data dir when unset).
    pub fn for_target(target_uri: &str) -> Result<Self, CoreError> {
        let base = match std::env::var_os("XDG_DATA_HOME") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::data_dir()
                .ok_or_else(|| CoreError::Config("Could not determine a data directory".into()))?,
        };
        Ok(Self::at(base.join("pgcopydb").join(target_id(target_uri))))
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        WorkDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the full directory layout. Idempotent.
    pub fn ensure_layout(&self) -> Result<(), CoreError> {
        for dir in [
            self.root.clone(),
            self.schema_dir(),
            self.tables_dir(),
            self.indexes_dir(),
            self.cdc_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        debug!(root = %self.root.display(), "work directory ready");
        Ok(())
    }

    pub fn schema_dir(&self) -> PathBuf {
        self.root.join("schema")
    }

    pub fn tables_dir(&self) -> PathBuf {
        self.root.join("objects").join("tables")
    }

    pub fn indexes_dir(&self) -> PathBuf {
        self.root.join("objects").join("indexes")
    }

    pub fn cdc_dir(&self) -> PathBuf {
        self.root.join("cdc")
    }

    pub fn dump_path(&self, pass: DumpPass) -> PathBuf {
        match pass {
            DumpPass::PreData => self.schema_dir().join("pre.dump"),
            DumpPass::PostData => self.schema_dir().join("post.dump"),
        }
    }

    pub fn list_path(&self, pass: DumpPass) -> PathBuf {
        match pass {
            DumpPass::PreData => self.schema_dir().join("pre.list"),
            DumpPass::PostData => self.schema_dir().join("post.list"),
        }
    }

    fn pid_path(&self) -> PathBuf {
        self.root.join("run.pid")
    }

    fn slot_path(&self) -> PathBuf {
        self.root.join("slot")
    }

    fn origin_path(&self) -> PathBuf {
        self.root.join("origin")
    }

    /// Record this process as the single writer of the tree. Fails when a
    /// live process already holds it; a stale file is replaced.
    pub fn acquire_pid(&self) -> Result<(), CoreError> {
        let path = self.pid_path();
        if let Ok(content) = fs::read_to_string(&path) {
            if let Ok(pid) = content.trim().parse::<u32>() {
                if pid != std::process::id() && process_is_alive(pid) {
                    return Err(CoreError::ConcurrentRun {
                        pid,
                        path: path.display().to_string(),
                    });
                }
                warn!(pid, "replacing stale pid file");
            }
        }
        fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(())
    }

    pub fn release_pid(&self) {
        // Best effort: a leftover pid file is detected as stale next run.
        let _ = fs::remove_file(self.pid_path());
    }

    pub fn save_slot(&self, slot: &SlotDescriptor) -> Result<(), CoreError> {
        let json = serde_json::to_string_pretty(slot)?;
        fs::write(self.slot_path(), json)?;
        Ok(())
    }

    pub fn load_slot(&self) -> Result<Option<SlotDescriptor>, CoreError> {
        match fs::read_to_string(self.slot_path()) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save_origin(&self, origin: &str) -> Result<(), CoreError> {
        fs::write(self.origin_path(), origin)?;
        Ok(())
    }

    /// Remove the whole tree. Used by `--restart` and by stream cleanup.
    pub fn remove_all(&self) -> Result<(), CoreError> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    /// True when a previous run left any state behind.
    pub fn has_previous_state(&self) -> bool {
        for dir in [self.schema_dir(), self.tables_dir(), self.indexes_dir(), self.cdc_dir()] {
            if let Ok(mut entries) = fs::read_dir(dir) {
                if entries.next().is_some() {
                    return true;
                }
            }
        }
        false
    }
}

/// Deterministic short identifier for a target URI.
fn target_id(target_uri: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target_uri.trim().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..12].to_string()
}

#[cfg(target_os = "linux")]
fn process_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_is_alive(_pid: u32) -> bool {
    // No portable liveness probe; err on the side of assuming stale.
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::lsn::Lsn;
    use tempfile::tempdir;

    #[test]
    fn target_id_is_deterministic() {
        let a = target_id("postgres://host/db");
        let b = target_id("postgres://host/db");
        let c = target_id("postgres://host/other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn layout_and_slot_round_trip() {
        let dir = tempdir().unwrap();
        let workdir = WorkDir::at(dir.path().join("run"));
        workdir.ensure_layout().unwrap();
        assert!(workdir.cdc_dir().is_dir());
        assert!(workdir.tables_dir().is_dir());

        assert!(workdir.load_slot().unwrap().is_none());
        let slot = SlotDescriptor {
            slot_name: "pgcopydb".into(),
            plugin: "wal2json".into(),
            consistent_lsn: Lsn(0x1000),
            snapshot_name: None,
        };
        workdir.save_slot(&slot).unwrap();
        assert_eq!(workdir.load_slot().unwrap().unwrap(), slot);
    }

    #[test]
    fn pid_file_blocks_second_live_writer() {
        let dir = tempdir().unwrap();
        let workdir = WorkDir::at(dir.path().join("run"));
        workdir.ensure_layout().unwrap();

        workdir.acquire_pid().unwrap();
        // Same process re-acquiring is fine.
        workdir.acquire_pid().unwrap();

        workdir.release_pid();
        workdir.acquire_pid().unwrap();
    }

    #[test]
    fn previous_state_detection() {
        let dir = tempdir().unwrap();
        let workdir = WorkDir::at(dir.path().join("run"));
        workdir.ensure_layout().unwrap();
        assert!(!workdir.has_previous_state());

        std::fs::write(workdir.cdc_dir().join("seg.json"), "{}").unwrap();
        assert!(workdir.has_previous_state());
    }
}
