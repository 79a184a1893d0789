use crate::lsn::Lsn;
use serde::{Deserialize, Serialize};

/// Action tag of a logical message, serialized with the single-letter
/// codes the decoding plugin emits (plus the receiver-injected markers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamAction {
    #[serde(rename = "B")]
    Begin,
    #[serde(rename = "C")]
    Commit,
    #[serde(rename = "I")]
    Insert,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
    #[serde(rename = "T")]
    Truncate,
    #[serde(rename = "M")]
    Message,
    /// Keepalive, injected by the receiver to carry progress LSNs.
    #[serde(rename = "K")]
    Keepalive,
    /// WAL segment switch, first record of a new segment file.
    #[serde(rename = "X")]
    Switch,
    /// The receiver reached the configured end position.
    #[serde(rename = "E")]
    Endpos,
}

/// One column of a replicated tuple, the `{name, type, value}` triple
/// the decoding plugin reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: serde_json::Value,
}

/// One logical message as persisted in the CDC segment files: the plugin
/// record augmented with receiver metadata (xid, lsn, timestamp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub action: StreamAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xid: Option<u32>,
    pub lsn: Lsn,
    /// Commit LSN of the enclosing transaction, known at COMMIT time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_lsn: Option<Lsn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<TupleColumn>>,
    /// Replica-identity columns for UPDATE/DELETE.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Vec<TupleColumn>>,
    /// Raw plugin payload for MESSAGE records and unrecognized shapes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,
}

impl StreamRecord {
    pub fn marker(action: StreamAction, lsn: Lsn) -> Self {
        StreamRecord {
            action,
            xid: None,
            lsn,
            commit_lsn: None,
            timestamp: None,
            schema: None,
            table: None,
            columns: None,
            identity: None,
            message: None,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_single_letter_actions() {
        let record = StreamRecord::marker(StreamAction::Keepalive, Lsn(0x28));
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"action":"K","lsn":"0/28"}"#);
    }

    #[test]
    fn round_trips_an_insert_record() {
        let json = r#"{"action":"I","xid":771,"lsn":"0/24E1218","schema":"public","table":"t",
            "columns":[{"name":"id","type":"integer","value":1},
                       {"name":"v","type":"text","value":"a"}]}"#;
        let record: StreamRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.action, StreamAction::Insert);
        assert_eq!(record.xid, Some(771));
        assert_eq!(record.table.as_deref(), Some("t"));
        let columns = record.columns.as_ref().unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[1].value, serde_json::json!("a"));

        let back = serde_json::to_string(&record).unwrap();
        let again: StreamRecord = serde_json::from_str(&back).unwrap();
        assert_eq!(again, record);
    }
}
