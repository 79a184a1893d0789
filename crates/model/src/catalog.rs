use crate::idents::quote_qualified;
use serde::{Deserialize, Serialize};

/// One attribute of a source table, in attribute-number order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableColumn {
    pub attnum: i16,
    pub name: String,
    pub type_name: String,
}

/// A half-open page range `[start_page, end_page)` of a heap table;
/// `end_page = None` means "to the end of the relation".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start_page: u32,
    pub end_page: Option<u32>,
}

/// One leaf partition of a partitioned table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablePartition {
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
}

/// How the copier slices a table into copy units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CopyPartitioning {
    /// One unit streaming the whole relation.
    Whole,
    /// Large heap table without a usable key: slice by ctid page ranges.
    CtidRange(Vec<PageRange>),
    /// Partitioned table: one unit per leaf partition.
    ByPartition(Vec<TablePartition>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceTable {
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
    /// Planner estimate from `pg_class.reltuples`; scheduling only.
    pub estimated_row_count: i64,
    pub bytes: i64,
    pub relpages: u32,
    pub columns: Vec<TableColumn>,
    /// Declared partition key expression, when the table is partitioned.
    pub partition_key: Option<String>,
    pub partitioning: CopyPartitioning,
}

impl SourceTable {
    pub fn qualified_name(&self) -> String {
        quote_qualified(&self.nspname, &self.relname)
    }

    /// `schema.table` without quoting, the form filters match against.
    pub fn filter_name(&self) -> String {
        format!("{}.{}", self.nspname, self.relname)
    }
}

/// A primary-key or unique constraint attached to an index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConstraint {
    pub oid: u32,
    pub name: String,
    /// `pg_get_constraintdef` output, e.g. `PRIMARY KEY (id)`.
    pub definition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceIndex {
    pub oid: u32,
    pub table_oid: u32,
    pub nspname: String,
    pub name: String,
    /// `pg_get_indexdef` output: a complete CREATE INDEX statement.
    pub definition: String,
    pub is_primary: bool,
    pub is_unique: bool,
    pub constraint: Option<IndexConstraint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionConfigTable {
    pub nspname: String,
    pub relname: String,
    /// Extension-declared row filter for the configuration dump.
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceExtension {
    pub name: String,
    pub config_tables: Vec<ExtensionConfigTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSequence {
    pub oid: u32,
    pub nspname: String,
    pub relname: String,
    pub last_value: i64,
    pub is_called: bool,
}

/// In-memory image of the source schema, loaded once under the snapshot
/// and immutable afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub tables: Vec<SourceTable>,
    pub indexes: Vec<SourceIndex>,
    pub sequences: Vec<SourceSequence>,
    pub extensions: Vec<SourceExtension>,
}

impl Catalog {
    pub fn total_bytes(&self) -> i64 {
        self.tables.iter().map(|t| t.bytes).sum()
    }

    pub fn total_row_estimate(&self) -> i64 {
        self.tables.iter().map(|t| t.estimated_row_count.max(0)).sum()
    }

    pub fn table(&self, oid: u32) -> Option<&SourceTable> {
        self.tables.iter().find(|t| t.oid == oid)
    }

    /// Tables ordered by byte size descending, the longest-processing-time
    /// order the copier schedules in.
    pub fn tables_by_size_desc(&self) -> Vec<&SourceTable> {
        let mut tables: Vec<&SourceTable> = self.tables.iter().collect();
        tables.sort_by(|a, b| b.bytes.cmp(&a.bytes));
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(oid: u32, relname: &str, bytes: i64) -> SourceTable {
        SourceTable {
            oid,
            nspname: "public".into(),
            relname: relname.into(),
            estimated_row_count: 10,
            bytes,
            relpages: 1,
            columns: vec![],
            partition_key: None,
            partitioning: CopyPartitioning::Whole,
        }
    }

    #[test]
    fn orders_tables_largest_first() {
        let catalog = Catalog {
            tables: vec![table(1, "small", 10), table(2, "big", 1000), table(3, "mid", 100)],
            ..Default::default()
        };
        let names: Vec<&str> = catalog
            .tables_by_size_desc()
            .iter()
            .map(|t| t.relname.as_str())
            .collect();
        assert_eq!(names, vec!["big", "mid", "small"]);
        assert_eq!(catalog.total_bytes(), 1110);
    }

    #[test]
    fn quoting_and_filter_names() {
        let t = table(1, "users", 0);
        assert_eq!(t.qualified_name(), "\"public\".\"users\"");
        assert_eq!(t.filter_name(), "public.users");
    }
}
