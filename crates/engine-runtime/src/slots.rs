use crate::error::RuntimeError;
use connectors::error::ReplicationError;
use connectors::replication::ReplicationSession;
use engine_core::config::OutputPlugin;
use model::slot::SlotDescriptor;
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::oneshot;
use tracing::debug;

/// Creates the logical slot with its exported snapshot and keeps the
/// creating connection alive until released. The wire client is not
/// thread-mobile, so the whole session lives on one dedicated thread and
/// the holder just signals it.
pub struct SlotHolder {
    release_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SlotHolder {
    /// Connect, create the slot, and park. Returns the descriptor (with
    /// the exported snapshot name) once the slot exists.
    pub async fn create(
        source_uri: String,
        slot_name: String,
        plugin: OutputPlugin,
    ) -> Result<(SlotDescriptor, SlotHolder), RuntimeError> {
        let (slot_tx, slot_rx) = oneshot::channel();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();

        let thread = thread::spawn(move || {
            let outcome = ReplicationSession::connect(&source_uri)
                .and_then(|session| {
                    session
                        .create_slot(&slot_name, plugin.as_str())
                        .map(|slot| (session, slot))
                });

            match outcome {
                Ok((session, slot)) => {
                    if slot_tx.send(Ok(slot)).is_err() {
                        return;
                    }
                    // Hold the connection (and with it the exported
                    // snapshot) until the holder is released or dropped.
                    let _ = release_rx.recv();
                    drop(session);
                    debug!("slot-holding connection closed");
                }
                Err(err) => {
                    let _ = slot_tx.send(Err(err));
                }
            }
        });

        let slot = slot_rx
            .await
            .map_err(|_| {
                RuntimeError::Replication(ReplicationError::Connect(
                    "slot creation thread died".into(),
                ))
            })??;

        Ok((
            slot,
            SlotHolder { release_tx: Some(release_tx), thread: Some(thread) },
        ))
    }

    /// Let the creating connection go. The slot itself persists; only the
    /// exported snapshot becomes unusable.
    pub fn release(&mut self) {
        self.release_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SlotHolder {
    fn drop(&mut self) {
        self.release();
    }
}
