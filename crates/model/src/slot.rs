use crate::lsn::Lsn;
use serde::{Deserialize, Serialize};

/// Replication-slot descriptor returned by slot creation and persisted in
/// the work directory; a later run only reuses a slot it finds recorded
/// there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDescriptor {
    pub slot_name: String,
    pub plugin: String,
    pub consistent_lsn: Lsn,
    /// Snapshot exported atomically with the slot; valid only while the
    /// creating connection stays open.
    pub snapshot_name: Option<String>,
}
