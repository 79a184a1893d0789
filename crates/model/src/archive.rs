use crate::error::ModelError;

/// Multi-word descriptions the restorer's list output can carry; matched
/// longest-first so `TABLE DATA` never parses as `TABLE`.
const COMPOUND_DESCRIPTIONS: &[&str] = &[
    "MATERIALIZED VIEW DATA",
    "SEQUENCE OWNED BY",
    "TEXT SEARCH CONFIGURATION",
    "TEXT SEARCH DICTIONARY",
    "TEXT SEARCH PARSER",
    "TEXT SEARCH TEMPLATE",
    "CHECK CONSTRAINT",
    "DEFAULT ACL",
    "EVENT TRIGGER",
    "FK CONSTRAINT",
    "FOREIGN TABLE",
    "INDEX ATTACH",
    "MATERIALIZED VIEW",
    "PUBLICATION TABLE",
    "ROW SECURITY",
    "SEQUENCE SET",
    "TABLE ATTACH",
    "TABLE DATA",
];

/// One entry of the restorer's archive table of contents, as printed by
/// its `--list` output: `dumpId; catalogOid objectOid DESC rest…`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub dump_id: u32,
    pub catalog_oid: u32,
    pub object_oid: u32,
    pub description: String,
    /// Namespace token, when the entry is schema-qualified (`-` otherwise).
    pub namespace: Option<String>,
    /// Everything after the description; what the restorer matches on.
    pub restore_list_name: String,
    /// The unmodified input line, re-emitted verbatim in include-lists.
    pub raw: String,
}

impl ArchiveEntry {
    /// Parse one list line. Comment lines (leading `;`) and blank lines
    /// yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<ArchiveEntry>, ModelError> {
        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            return Ok(None);
        }

        let invalid = || ModelError::InvalidArchiveLine(trimmed.to_string());

        let (dump_id, rest) = trimmed.split_once(';').ok_or_else(invalid)?;
        let dump_id: u32 = dump_id.trim().parse().map_err(|_| invalid())?;

        let mut tokens = rest.trim().splitn(3, ' ');
        let catalog_oid: u32 = tokens.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
        let object_oid: u32 = tokens.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
        let tail = tokens.next().ok_or_else(invalid)?;

        let (description, rest) = Self::split_description(tail);
        let namespace = rest
            .split_whitespace()
            .next()
            .filter(|ns| *ns != "-")
            .map(str::to_string);

        Ok(Some(ArchiveEntry {
            dump_id,
            catalog_oid,
            object_oid,
            description: description.to_string(),
            namespace,
            restore_list_name: rest.to_string(),
            raw: trimmed.to_string(),
        }))
    }

    /// First token of the restore-list name after the namespace; the object
    /// name filters match against.
    pub fn object_name(&self) -> Option<&str> {
        let mut tokens = self.restore_list_name.split_whitespace();
        tokens.next()?;
        tokens.next()
    }

    /// The line form the restorer skips: prefixed with its comment sentinel.
    pub fn commented(&self) -> String {
        format!(";{}", self.raw)
    }

    fn split_description(tail: &str) -> (&str, &str) {
        for desc in COMPOUND_DESCRIPTIONS {
            if let Some(rest) = tail.strip_prefix(desc) {
                if rest.starts_with(' ') {
                    return (desc, rest.trim_start());
                }
            }
        }
        match tail.split_once(' ') {
            Some((desc, rest)) => (desc, rest.trim_start()),
            None => (tail, ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_table_entry() {
        let line = "215; 1259 16386 TABLE public foo postgres";
        let entry = ArchiveEntry::parse(line).unwrap().unwrap();
        assert_eq!(entry.dump_id, 215);
        assert_eq!(entry.catalog_oid, 1259);
        assert_eq!(entry.object_oid, 16386);
        assert_eq!(entry.description, "TABLE");
        assert_eq!(entry.namespace.as_deref(), Some("public"));
        assert_eq!(entry.object_name(), Some("foo"));
        assert_eq!(entry.raw, line);
    }

    #[test]
    fn parses_compound_descriptions() {
        let entry = ArchiveEntry::parse("3347; 0 16386 TABLE DATA public foo postgres")
            .unwrap()
            .unwrap();
        assert_eq!(entry.description, "TABLE DATA");
        assert_eq!(entry.namespace.as_deref(), Some("public"));

        let entry = ArchiveEntry::parse("2606; 2606 16400 FK CONSTRAINT public orders orders_fk postgres")
            .unwrap()
            .unwrap();
        assert_eq!(entry.description, "FK CONSTRAINT");
        assert_eq!(entry.object_name(), Some("orders"));
    }

    #[test]
    fn dashes_mean_no_namespace() {
        let entry = ArchiveEntry::parse("10; 2615 2200 SCHEMA - public postgres")
            .unwrap()
            .unwrap();
        assert_eq!(entry.description, "SCHEMA");
        assert_eq!(entry.namespace, None);
    }

    #[test]
    fn skips_comments_and_blanks() {
        assert!(ArchiveEntry::parse("; Archive created at …").unwrap().is_none());
        assert!(ArchiveEntry::parse("").unwrap().is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(ArchiveEntry::parse("not a toc line").is_err());
        assert!(ArchiveEntry::parse("x; y z TABLE a b").is_err());
    }

    #[test]
    fn commented_form_keeps_original_text() {
        let line = "1259; 1259 16395 INDEX public idx_foo_v postgres";
        let entry = ArchiveEntry::parse(line).unwrap().unwrap();
        assert_eq!(entry.commented(), format!(";{line}"));
    }
}
