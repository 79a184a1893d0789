use serde::{Deserialize, Serialize};

/// Namespace-aware object filtering with four clauses. An object passes
/// iff it passes all four; empty clauses pass everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TableFilters {
    pub include_only_schemas: Vec<String>,
    pub exclude_schemas: Vec<String>,
    /// Entries are unquoted `schema.table` names.
    pub include_only_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
}

impl TableFilters {
    pub fn is_empty(&self) -> bool {
        self.include_only_schemas.is_empty()
            && self.exclude_schemas.is_empty()
            && self.include_only_tables.is_empty()
            && self.exclude_tables.is_empty()
    }

    pub fn allows(&self, nspname: &str, relname: &str) -> bool {
        if !self.include_only_schemas.is_empty()
            && !self.include_only_schemas.iter().any(|s| s == nspname)
        {
            return false;
        }
        if self.exclude_schemas.iter().any(|s| s == nspname) {
            return false;
        }

        let qualified = format!("{nspname}.{relname}");
        if !self.include_only_tables.is_empty()
            && !self.include_only_tables.iter().any(|t| *t == qualified)
        {
            return false;
        }
        if self.exclude_tables.iter().any(|t| *t == qualified) {
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filters_pass_everything() {
        let f = TableFilters::default();
        assert!(f.is_empty());
        assert!(f.allows("public", "anything"));
    }

    #[test]
    fn exclude_table_is_qualified() {
        let f = TableFilters {
            exclude_tables: vec!["s.secret".into()],
            ..Default::default()
        };
        assert!(!f.allows("s", "secret"));
        assert!(f.allows("public", "secret"));
        assert!(f.allows("s", "visible"));
    }

    #[test]
    fn include_only_schema_restricts() {
        let f = TableFilters {
            include_only_schemas: vec!["app".into()],
            ..Default::default()
        };
        assert!(f.allows("app", "t"));
        assert!(!f.allows("public", "t"));
    }

    #[test]
    fn all_four_clauses_must_pass() {
        let f = TableFilters {
            include_only_schemas: vec!["app".into()],
            exclude_schemas: vec!["app_audit".into()],
            include_only_tables: vec!["app.users".into(), "app.orders".into()],
            exclude_tables: vec!["app.orders".into()],
        };
        assert!(f.allows("app", "users"));
        // Present in include-only but also excluded.
        assert!(!f.allows("app", "orders"));
        // Not in the include-only table list.
        assert!(!f.allows("app", "sessions"));
    }
}
