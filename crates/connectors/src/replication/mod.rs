pub mod message;

use crate::error::ReplicationError;
use message::WireMessage;
use model::{lsn::Lsn, slot::SlotDescriptor};
use tracing::{debug, info};

/// Timeline and current write position reported by `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: u32,
    pub xlogpos: Lsn,
}

/// A replication-protocol session on the source. Slot creation with
/// snapshot export and the CopyBoth stream both require this dedicated
/// connection; the async driver does not speak this dialect, so the
/// session wraps the C client library directly.
///
/// Calls block; the receiver runs the whole session on a blocking task.
pub struct ReplicationSession {
    conn: libpq::Connection,
}

impl ReplicationSession {
    pub fn connect(source_uri: &str) -> Result<Self, ReplicationError> {
        let conninfo = replication_conninfo(source_uri);
        let conn = libpq::Connection::new(&conninfo)
            .map_err(|e| ReplicationError::Connect(e.to_string()))?;
        debug!("replication connection established");
        Ok(ReplicationSession { conn })
    }

    fn last_error(&self) -> String {
        format!("{:?}", self.conn.error_message())
    }

    pub fn identify_system(&self) -> Result<SystemIdentity, ReplicationError> {
        let result = self.conn.exec("IDENTIFY_SYSTEM");
        if result.status() != libpq::Status::TuplesOk {
            return Err(ReplicationError::Command(format!(
                "IDENTIFY_SYSTEM failed: {}",
                self.last_error()
            )));
        }

        let system_id = text_field(&result, 0, 0)
            .ok_or_else(|| ReplicationError::Command("IDENTIFY_SYSTEM: missing systemid".into()))?;
        let timeline = text_field(&result, 0, 1)
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| ReplicationError::Command("IDENTIFY_SYSTEM: bad timeline".into()))?;
        let xlogpos: Lsn = text_field(&result, 0, 2)
            .ok_or_else(|| ReplicationError::Command("IDENTIFY_SYSTEM: missing xlogpos".into()))?
            .parse()?;

        Ok(SystemIdentity { system_id, timeline, xlogpos })
    }

    /// Create the logical slot and export its snapshot in one command, so
    /// the snapshot and the slot's consistent point agree by construction.
    /// The exported snapshot stays valid only while this connection is
    /// idle and open.
    pub fn create_slot(
        &self,
        slot_name: &str,
        plugin: &str,
    ) -> Result<SlotDescriptor, ReplicationError> {
        let command = format!(
            "CREATE_REPLICATION_SLOT \"{slot_name}\" LOGICAL {plugin} EXPORT_SNAPSHOT"
        );
        let result = self.conn.exec(&command);
        if result.status() != libpq::Status::TuplesOk {
            return Err(ReplicationError::Command(format!(
                "CREATE_REPLICATION_SLOT \"{slot_name}\" failed: {}",
                self.last_error()
            )));
        }

        // Columns: slot_name, consistent_point, snapshot_name, output_plugin.
        let consistent_lsn: Lsn = text_field(&result, 0, 1)
            .ok_or_else(|| ReplicationError::Command("slot creation: missing consistent point".into()))?
            .parse()?;
        let snapshot_name = text_field(&result, 0, 2);
        let plugin = text_field(&result, 0, 3).unwrap_or_else(|| plugin.to_string());

        let slot = SlotDescriptor {
            slot_name: slot_name.to_string(),
            plugin,
            consistent_lsn,
            snapshot_name,
        };
        info!(
            slot = %slot.slot_name,
            lsn = %slot.consistent_lsn,
            "replication slot created with exported snapshot"
        );
        Ok(slot)
    }

    pub fn drop_slot(&self, slot_name: &str) -> Result<(), ReplicationError> {
        let result = self.conn.exec(&format!("DROP_REPLICATION_SLOT \"{slot_name}\" WAIT"));
        if result.status() != libpq::Status::CommandOk {
            return Err(ReplicationError::Command(format!(
                "DROP_REPLICATION_SLOT \"{slot_name}\" failed: {}",
                self.last_error()
            )));
        }
        info!(slot = slot_name, "replication slot dropped");
        Ok(())
    }

    /// Enter CopyBoth mode at `start_lsn` with the given plugin options.
    pub fn start_replication(
        &self,
        slot_name: &str,
        start_lsn: Lsn,
        options: &[(&str, &str)],
    ) -> Result<(), ReplicationError> {
        let mut command = format!("START_REPLICATION SLOT \"{slot_name}\" LOGICAL {start_lsn}");
        if !options.is_empty() {
            let rendered: Vec<String> = options
                .iter()
                .map(|(key, value)| format!("\"{key}\" '{value}'"))
                .collect();
            command.push_str(&format!(" ({})", rendered.join(", ")));
        }

        let result = self.conn.exec(&command);
        if result.status() != libpq::Status::CopyBoth {
            return Err(ReplicationError::Command(format!(
                "START_REPLICATION failed ({:?}): {}",
                result.status(),
                self.last_error()
            )));
        }
        info!(slot = slot_name, start = %start_lsn, "replication started");
        Ok(())
    }

    /// Block for the next copy-data frame. `None` means the copy stream
    /// ended (server shutdown or end-of-timeline); the caller decides
    /// whether that is orderly by consulting its own stop conditions.
    pub fn receive(&self) -> Result<Option<WireMessage>, ReplicationError> {
        let _ = self.conn.consume_input();
        match self.conn.copy_data(false) {
            Ok(frame) => WireMessage::parse(&frame).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Send a standby status update acknowledging progress to the sender.
    pub fn send_status_update(
        &self,
        write: Lsn,
        flush: Lsn,
        apply: Lsn,
        reply_requested: bool,
    ) -> Result<(), ReplicationError> {
        let frame = message::status_update(write, flush, apply, reply_requested);
        self.conn
            .put_copy_data(&frame)
            .map_err(|e| ReplicationError::Command(format!("status update failed: {e}")))?;
        Ok(())
    }
}

/// Ask for the replication protocol variant that still allows SQL, which
/// logical decoding requires.
fn replication_conninfo(uri: &str) -> String {
    if uri.starts_with("postgres://") || uri.starts_with("postgresql://") {
        if uri.contains('?') {
            format!("{uri}&replication=database")
        } else {
            format!("{uri}?replication=database")
        }
    } else {
        format!("{uri} replication=database")
    }
}

fn text_field(result: &libpq::Result, row: usize, column: usize) -> Option<String> {
    result
        .value(row, column)
        .map(|value| String::from_utf8_lossy(value.as_ref()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conninfo_gains_replication_parameter() {
        assert_eq!(
            replication_conninfo("postgres://host/db"),
            "postgres://host/db?replication=database"
        );
        assert_eq!(
            replication_conninfo("postgres://host/db?sslmode=disable"),
            "postgres://host/db?sslmode=disable&replication=database"
        );
        assert_eq!(
            replication_conninfo("host=localhost dbname=db"),
            "host=localhost dbname=db replication=database"
        );
    }
}
