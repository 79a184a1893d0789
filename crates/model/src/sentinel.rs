use crate::lsn::Lsn;
use serde::{Deserialize, Serialize};

/// The single control row shared by receiver and applier. Lives on the
/// source so both ends observe the same cut-over coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelRow {
    pub startpos: Lsn,
    /// Zero means "no end position": stream until asked to stop.
    pub endpos: Lsn,
    pub apply: bool,
    pub write_lsn: Lsn,
    pub flush_lsn: Lsn,
    pub replay_lsn: Lsn,
}

impl SentinelRow {
    /// `startpos ≤ write ≤ flush ≤ replay`, and `replay ≤ endpos` when an
    /// end position is set. Violations indicate a corrupted control row.
    pub fn is_consistent(&self) -> bool {
        let ordered = self.startpos <= self.write_lsn
            && self.write_lsn <= self.flush_lsn
            && self.flush_lsn <= self.replay_lsn;
        let bounded = !self.endpos.is_valid() || self.replay_lsn <= self.endpos;
        ordered && bounded
    }

    /// True once replay has caught up to a configured end position.
    pub fn endpos_reached(&self) -> bool {
        self.endpos.is_valid() && self.replay_lsn >= self.endpos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_row_is_consistent() {
        assert!(SentinelRow::default().is_consistent());
    }

    #[test]
    fn detects_ordering_violations() {
        let row = SentinelRow {
            startpos: Lsn(100),
            write_lsn: Lsn(50),
            ..Default::default()
        };
        assert!(!row.is_consistent());

        let row = SentinelRow {
            endpos: Lsn(100),
            replay_lsn: Lsn(200),
            write_lsn: Lsn(200),
            flush_lsn: Lsn(200),
            ..Default::default()
        };
        assert!(!row.is_consistent());
    }

    #[test]
    fn endpos_zero_never_reached() {
        let row = SentinelRow {
            replay_lsn: Lsn(u64::MAX),
            write_lsn: Lsn(u64::MAX),
            flush_lsn: Lsn(u64::MAX),
            ..Default::default()
        };
        assert!(!row.endpos_reached());

        let row = SentinelRow {
            endpos: Lsn(100),
            write_lsn: Lsn(100),
            flush_lsn: Lsn(100),
            replay_lsn: Lsn(100),
            ..Default::default()
        };
        assert!(row.endpos_reached());
    }
}
