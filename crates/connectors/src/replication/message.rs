use crate::error::ReplicationError;
use model::lsn::Lsn;
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds between the Unix and Postgres epochs (2000-01-01).
const POSTGRES_EPOCH_OFFSET_US: u64 = 946_684_800_000_000;

/// A decoded frame of the streaming-replication copy protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    XLogData(XLogData),
    Keepalive(Keepalive),
}

/// `w` frame: a chunk of logical-decoding output with its WAL coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub server_clock_us: u64,
    pub payload: Vec<u8>,
}

/// `k` frame: sender heartbeat carrying the server's write position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub wal_end: Lsn,
    pub server_clock_us: u64,
    pub reply_requested: bool,
}

impl WireMessage {
    /// Parse one copy-data frame. Any unrecognized tag is a protocol
    /// violation and fatal to the stream.
    pub fn parse(buf: &[u8]) -> Result<WireMessage, ReplicationError> {
        match buf.first() {
            Some(b'w') => XLogData::parse(&buf[1..]).map(WireMessage::XLogData),
            Some(b'k') => Keepalive::parse(&buf[1..]).map(WireMessage::Keepalive),
            Some(tag) => Err(ReplicationError::Protocol(format!(
                "unexpected message tag {:?} ({} bytes)",
                *tag as char,
                buf.len()
            ))),
            None => Err(ReplicationError::Protocol("empty message".into())),
        }
    }
}

impl XLogData {
    fn parse(buf: &[u8]) -> Result<Self, ReplicationError> {
        if buf.len() < 24 {
            return Err(ReplicationError::Protocol(format!(
                "truncated XLogData header: {} bytes",
                buf.len()
            )));
        }
        Ok(XLogData {
            wal_start: Lsn(read_u64(buf, 0)),
            wal_end: Lsn(read_u64(buf, 8)),
            server_clock_us: read_u64(buf, 16),
            payload: buf[24..].to_vec(),
        })
    }
}

impl Keepalive {
    fn parse(buf: &[u8]) -> Result<Self, ReplicationError> {
        if buf.len() < 17 {
            return Err(ReplicationError::Protocol(format!(
                "truncated keepalive: {} bytes",
                buf.len()
            )));
        }
        Ok(Keepalive {
            wal_end: Lsn(read_u64(buf, 0)),
            server_clock_us: read_u64(buf, 8),
            reply_requested: buf[16] != 0,
        })
    }
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// Build an `r` standby-status-update frame: three LSNs (written, flushed,
/// applied), the client clock, and the reply-requested flag.
pub fn status_update(write: Lsn, flush: Lsn, apply: Lsn, reply_requested: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 * 4 + 1);
    buf.push(b'r');
    buf.extend_from_slice(&write.0.to_be_bytes());
    buf.extend_from_slice(&flush.0.to_be_bytes());
    buf.extend_from_slice(&apply.0.to_be_bytes());
    buf.extend_from_slice(&now_postgres_us().to_be_bytes());
    buf.push(reply_requested as u8);
    buf
}

fn now_postgres_us() -> u64 {
    let unix_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    unix_us.saturating_sub(POSTGRES_EPOCH_OFFSET_US)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_xlogdata_frame() {
        let mut buf = vec![b'w'];
        buf.extend_from_slice(&0x0000_0001_0000_000A_u64.to_be_bytes());
        buf.extend_from_slice(&0x0000_0001_0000_000B_u64.to_be_bytes());
        buf.extend_from_slice(&42u64.to_be_bytes());
        buf.extend_from_slice(b"{\"action\":\"B\"}");

        match WireMessage::parse(&buf).unwrap() {
            WireMessage::XLogData(data) => {
                assert_eq!(data.wal_start, Lsn(0x0000_0001_0000_000A));
                assert_eq!(data.wal_end, Lsn(0x0000_0001_0000_000B));
                assert_eq!(data.server_clock_us, 42);
                assert_eq!(data.payload, b"{\"action\":\"B\"}");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_keepalive_frame() {
        let mut buf = vec![b'k'];
        buf.extend_from_slice(&0x2000u64.to_be_bytes());
        buf.extend_from_slice(&7u64.to_be_bytes());
        buf.push(1);

        match WireMessage::parse(&buf).unwrap() {
            WireMessage::Keepalive(keepalive) => {
                assert_eq!(keepalive.wal_end, Lsn(0x2000));
                assert!(keepalive.reply_requested);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_a_protocol_violation() {
        assert!(matches!(
            WireMessage::parse(&[b'z', 0, 0]),
            Err(ReplicationError::Protocol(_))
        ));
        assert!(matches!(WireMessage::parse(&[]), Err(ReplicationError::Protocol(_))));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(WireMessage::parse(&[b'w', 0, 0, 0]).is_err());
        assert!(WireMessage::parse(&[b'k', 0]).is_err());
    }

    #[test]
    fn status_update_layout() {
        let buf = status_update(Lsn(1), Lsn(2), Lsn(3), true);
        assert_eq!(buf.len(), 34);
        assert_eq!(buf[0], b'r');
        assert_eq!(&buf[1..9], &1u64.to_be_bytes());
        assert_eq!(&buf[9..17], &2u64.to_be_bytes());
        assert_eq!(&buf[17..25], &3u64.to_be_bytes());
        assert_eq!(buf[33], 1);
    }
}
