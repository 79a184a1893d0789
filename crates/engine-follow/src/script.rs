use crate::error::FollowError;
use model::lsn::Lsn;
use serde::{Deserialize, Serialize};

/// Transaction coordinates carried as a JSON comment on BEGIN/COMMIT
/// lines, so the applier can skip duplicates without parsing SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnMarker {
    pub xid: u32,
    pub commit_lsn: Lsn,
}

/// Progress coordinates on non-transactional marker lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LsnMarker {
    pub lsn: Lsn,
}

/// One line of a replay script. Scripts are plain SQL with structured
/// comments, so they replay through any SQL client as well as through
/// the applier.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayLine {
    Begin(TxnMarker),
    Statement(String),
    Commit(TxnMarker),
    Keepalive(LsnMarker),
    Switch(LsnMarker),
    Endpos(LsnMarker),
}

const BEGIN_PREFIX: &str = "BEGIN; -- ";
const COMMIT_PREFIX: &str = "COMMIT; -- ";
const KEEPALIVE_PREFIX: &str = "-- KEEPALIVE ";
const SWITCH_PREFIX: &str = "-- SWITCH ";
const ENDPOS_PREFIX: &str = "-- ENDPOS ";

impl ReplayLine {
    pub fn render(&self) -> Result<String, FollowError> {
        Ok(match self {
            ReplayLine::Begin(marker) => {
                format!("{BEGIN_PREFIX}{}", serde_json::to_string(marker)?)
            }
            ReplayLine::Statement(sql) => sql.clone(),
            ReplayLine::Commit(marker) => {
                format!("{COMMIT_PREFIX}{}", serde_json::to_string(marker)?)
            }
            ReplayLine::Keepalive(marker) => {
                format!("{KEEPALIVE_PREFIX}{}", serde_json::to_string(marker)?)
            }
            ReplayLine::Switch(marker) => {
                format!("{SWITCH_PREFIX}{}", serde_json::to_string(marker)?)
            }
            ReplayLine::Endpos(marker) => {
                format!("{ENDPOS_PREFIX}{}", serde_json::to_string(marker)?)
            }
        })
    }

    /// Parse one script line; blank lines yield `None`. Anything that is
    /// not a recognized marker is a statement to execute verbatim.
    pub fn parse(line: &str) -> Result<Option<ReplayLine>, FollowError> {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let invalid = |err: serde_json::Error| {
            FollowError::InvalidReplayLine(format!("{trimmed}: {err}"))
        };

        if let Some(marker) = trimmed.strip_prefix(BEGIN_PREFIX) {
            return Ok(Some(ReplayLine::Begin(serde_json::from_str(marker).map_err(invalid)?)));
        }
        if let Some(marker) = trimmed.strip_prefix(COMMIT_PREFIX) {
            return Ok(Some(ReplayLine::Commit(serde_json::from_str(marker).map_err(invalid)?)));
        }
        if let Some(marker) = trimmed.strip_prefix(KEEPALIVE_PREFIX) {
            return Ok(Some(ReplayLine::Keepalive(serde_json::from_str(marker).map_err(invalid)?)));
        }
        if let Some(marker) = trimmed.strip_prefix(SWITCH_PREFIX) {
            return Ok(Some(ReplayLine::Switch(serde_json::from_str(marker).map_err(invalid)?)));
        }
        if let Some(marker) = trimmed.strip_prefix(ENDPOS_PREFIX) {
            return Ok(Some(ReplayLine::Endpos(serde_json::from_str(marker).map_err(invalid)?)));
        }

        Ok(Some(ReplayLine::Statement(trimmed.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_round_trip() {
        let lines = vec![
            ReplayLine::Begin(TxnMarker { xid: 771, commit_lsn: Lsn(0x24E1260) }),
            ReplayLine::Statement("INSERT INTO \"public\".\"t\" (\"id\") VALUES (1);".into()),
            ReplayLine::Commit(TxnMarker { xid: 771, commit_lsn: Lsn(0x24E1260) }),
            ReplayLine::Keepalive(LsnMarker { lsn: Lsn(0x24E1270) }),
            ReplayLine::Switch(LsnMarker { lsn: Lsn(0x3000000) }),
            ReplayLine::Endpos(LsnMarker { lsn: Lsn(0x4000000) }),
        ];
        for line in lines {
            let rendered = line.render().unwrap();
            let parsed = ReplayLine::parse(&rendered).unwrap().unwrap();
            assert_eq!(parsed, line);
        }
    }

    #[test]
    fn begin_line_is_valid_sql_with_comment() {
        let line = ReplayLine::Begin(TxnMarker { xid: 1, commit_lsn: Lsn(16) });
        assert_eq!(line.render().unwrap(), "BEGIN; -- {\"xid\":1,\"commit_lsn\":\"0/10\"}");
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert!(ReplayLine::parse("").unwrap().is_none());
        assert!(ReplayLine::parse("   ").unwrap().is_none());
    }

    #[test]
    fn unknown_text_is_a_statement() {
        let parsed = ReplayLine::parse("SELECT 1;").unwrap().unwrap();
        assert_eq!(parsed, ReplayLine::Statement("SELECT 1;".into()));
    }

    #[test]
    fn mangled_marker_is_an_error() {
        assert!(ReplayLine::parse("BEGIN; -- {not json}").is_err());
    }
}
