use model::lsn::Lsn;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Lock-free view of the pipeline's coordinates, shared between the
/// blocking receiver, the async applier, and the sentinel bridge. The
/// sentinel row on the source stays the durable copy; this is the
/// in-process cache refreshed every scheduler tick.
#[derive(Debug, Default)]
pub struct FollowProgress {
    write_lsn: AtomicU64,
    flush_lsn: AtomicU64,
    replay_lsn: AtomicU64,
    endpos: AtomicU64,
    stop: AtomicBool,
}

impl FollowProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_lsn(&self) -> Lsn {
        Lsn(self.write_lsn.load(Ordering::SeqCst))
    }

    pub fn set_write_lsn(&self, lsn: Lsn) {
        self.write_lsn.fetch_max(lsn.0, Ordering::SeqCst);
    }

    pub fn flush_lsn(&self) -> Lsn {
        Lsn(self.flush_lsn.load(Ordering::SeqCst))
    }

    pub fn set_flush_lsn(&self, lsn: Lsn) {
        self.flush_lsn.fetch_max(lsn.0, Ordering::SeqCst);
    }

    pub fn replay_lsn(&self) -> Lsn {
        Lsn(self.replay_lsn.load(Ordering::SeqCst))
    }

    pub fn set_replay_lsn(&self, lsn: Lsn) {
        self.replay_lsn.fetch_max(lsn.0, Ordering::SeqCst);
    }

    /// Zero means no end position is set.
    pub fn endpos(&self) -> Lsn {
        Lsn(self.endpos.load(Ordering::SeqCst))
    }

    /// Unlike the progress positions, endpos may move both ways.
    pub fn set_endpos(&self, lsn: Lsn) {
        self.endpos.store(lsn.0, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_only_move_forward() {
        let progress = FollowProgress::new();
        progress.set_write_lsn(Lsn(100));
        progress.set_write_lsn(Lsn(50));
        assert_eq!(progress.write_lsn(), Lsn(100));
    }

    #[test]
    fn endpos_can_be_reduced() {
        let progress = FollowProgress::new();
        progress.set_endpos(Lsn(100));
        progress.set_endpos(Lsn(50));
        assert_eq!(progress.endpos(), Lsn(50));
    }
}
