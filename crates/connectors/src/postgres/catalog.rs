use crate::error::DbError;
use model::catalog::{
    Catalog, CopyPartitioning, ExtensionConfigTable, IndexConstraint, PageRange, SourceExtension,
    SourceIndex, SourceSequence, SourceTable, TableColumn, TablePartition,
};
use model::filter::TableFilters;
use model::idents::quote_qualified;
use std::collections::HashSet;
use tokio_postgres::Client;
use tracing::{debug, info};

const QUERY_TABLES: &str = include_str!("sql/tables.sql");
const QUERY_COLUMNS: &str = include_str!("sql/columns.sql");
const QUERY_PARTITIONS: &str = include_str!("sql/partitions.sql");
const QUERY_INDEXES: &str = include_str!("sql/indexes.sql");
const QUERY_EXTENSIONS: &str = include_str!("sql/extensions.sql");
const QUERY_SEQUENCES: &str = include_str!("sql/sequences.sql");

/// Populates the in-memory catalog from the source, under the snapshot
/// the caller's connection is attached to.
pub struct CatalogLoader<'a> {
    client: &'a Client,
    filters: TableFilters,
    /// Tables larger than this (bytes) and lacking a partition key are
    /// split into ctid page ranges. `None` disables splitting.
    split_threshold: Option<u64>,
}

impl<'a> CatalogLoader<'a> {
    pub fn new(client: &'a Client, filters: TableFilters, split_threshold: Option<u64>) -> Self {
        CatalogLoader { client, filters, split_threshold }
    }

    pub async fn load(&self) -> Result<Catalog, DbError> {
        let tables = self.load_tables().await?;
        let table_oids: HashSet<u32> = tables.iter().map(|t| t.oid).collect();
        let indexes = self.load_indexes(&table_oids).await?;
        let sequences = self.load_sequences().await?;
        let extensions = self.load_extensions().await?;

        info!(
            tables = tables.len(),
            indexes = indexes.len(),
            sequences = sequences.len(),
            extensions = extensions.len(),
            "source catalog loaded"
        );

        Ok(Catalog { tables, indexes, sequences, extensions })
    }

    async fn load_tables(&self) -> Result<Vec<SourceTable>, DbError> {
        let rows = self.client.query(QUERY_TABLES, &[]).await?;
        let mut tables = Vec::with_capacity(rows.len());

        for row in rows {
            let oid: u32 = row.get("oid");
            let nspname: String = row.get("nspname");
            let relname: String = row.get("relname");
            if !self.filters.allows(&nspname, &relname) {
                debug!(table = %format!("{nspname}.{relname}"), "filtered out");
                continue;
            }

            let estimated_row_count: i64 = row.get("reltuples");
            let bytes: i64 = row.get("bytes");
            let relpages: i32 = row.get("relpages");
            let partition_key: Option<String> = row.get("partkey");

            let columns = self.load_columns(oid).await?;
            let partitioning = if partition_key.is_some() {
                CopyPartitioning::ByPartition(self.load_partitions(oid).await?)
            } else {
                split_by_pages(bytes, relpages.max(0) as u32, self.split_threshold)
            };

            tables.push(SourceTable {
                oid,
                nspname,
                relname,
                estimated_row_count,
                bytes,
                relpages: relpages.max(0) as u32,
                columns,
                partition_key,
                partitioning,
            });
        }

        Ok(tables)
    }

    async fn load_columns(&self, table_oid: u32) -> Result<Vec<TableColumn>, DbError> {
        let rows = self.client.query(QUERY_COLUMNS, &[&table_oid]).await?;
        Ok(rows
            .iter()
            .map(|row| TableColumn {
                attnum: row.get("attnum"),
                name: row.get("attname"),
                type_name: row.get("atttype"),
            })
            .collect())
    }

    async fn load_partitions(&self, table_oid: u32) -> Result<Vec<TablePartition>, DbError> {
        let rows = self.client.query(QUERY_PARTITIONS, &[&table_oid]).await?;
        Ok(rows
            .iter()
            .map(|row| TablePartition {
                oid: row.get("oid"),
                nspname: row.get("nspname"),
                relname: row.get("relname"),
            })
            .collect())
    }

    async fn load_indexes(&self, table_oids: &HashSet<u32>) -> Result<Vec<SourceIndex>, DbError> {
        let rows = self.client.query(QUERY_INDEXES, &[]).await?;
        let mut indexes = Vec::new();

        for row in rows {
            let table_oid: u32 = row.get("table_oid");
            if !table_oids.contains(&table_oid) {
                continue;
            }

            let constraint = match row.get::<_, Option<u32>>("constraint_oid") {
                Some(oid) => Some(IndexConstraint {
                    oid,
                    name: row.get("conname"),
                    definition: row.get("constraint_def"),
                }),
                None => None,
            };

            indexes.push(SourceIndex {
                oid: row.get("oid"),
                table_oid,
                nspname: row.get("nspname"),
                name: row.get("name"),
                definition: row.get("definition"),
                is_primary: row.get("indisprimary"),
                is_unique: row.get("indisunique"),
                constraint,
            });
        }

        Ok(indexes)
    }

    async fn load_sequences(&self) -> Result<Vec<SourceSequence>, DbError> {
        let rows = self.client.query(QUERY_SEQUENCES, &[]).await?;
        let mut sequences = Vec::with_capacity(rows.len());

        for row in rows {
            let oid: u32 = row.get("oid");
            let nspname: String = row.get("nspname");
            let relname: String = row.get("relname");
            if !self.filters.allows(&nspname, &relname) {
                continue;
            }

            // Sequence state lives in the sequence relation itself.
            let state = self
                .client
                .query_one(
                    &format!(
                        "select last_value, is_called from {}",
                        quote_qualified(&nspname, &relname)
                    ),
                    &[],
                )
                .await?;

            sequences.push(SourceSequence {
                oid,
                nspname,
                relname,
                last_value: state.get("last_value"),
                is_called: state.get("is_called"),
            });
        }

        Ok(sequences)
    }

    async fn load_extensions(&self) -> Result<Vec<SourceExtension>, DbError> {
        let rows = self.client.query(QUERY_EXTENSIONS, &[]).await?;
        let mut extensions: Vec<SourceExtension> = Vec::new();

        for row in rows {
            let extname: String = row.get("extname");
            let table = ExtensionConfigTable {
                nspname: row.get("nspname"),
                relname: row.get("relname"),
                condition: row
                    .get::<_, Option<String>>("condition")
                    .filter(|c| !c.is_empty()),
            };

            match extensions.last_mut() {
                Some(ext) if ext.name == extname => ext.config_tables.push(table),
                _ => extensions.push(SourceExtension {
                    name: extname,
                    config_tables: vec![table],
                }),
            }
        }

        Ok(extensions)
    }
}

/// Compute the copy partitioning for a plain heap table: whole-table
/// below the threshold, ctid page ranges above it.
fn split_by_pages(bytes: i64, relpages: u32, threshold: Option<u64>) -> CopyPartitioning {
    let Some(threshold) = threshold else {
        return CopyPartitioning::Whole;
    };
    if threshold == 0 || bytes <= 0 || (bytes as u64) <= threshold || relpages < 2 {
        return CopyPartitioning::Whole;
    }

    let range_count = ((bytes as u64).div_ceil(threshold)).min(relpages as u64) as u32;
    let pages_per_range = relpages.div_ceil(range_count).max(1);

    let mut ranges = Vec::with_capacity(range_count as usize);
    let mut start = 0u32;
    while start < relpages {
        let end = start.saturating_add(pages_per_range);
        ranges.push(PageRange {
            start_page: start,
            end_page: if end >= relpages { None } else { Some(end) },
        });
        start = end;
    }
    CopyPartitioning::CtidRange(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_tables_stay_whole() {
        assert!(matches!(split_by_pages(1000, 10, Some(4096)), CopyPartitioning::Whole));
        assert!(matches!(split_by_pages(1000, 10, None), CopyPartitioning::Whole));
    }

    #[test]
    fn large_tables_split_into_contiguous_ranges() {
        // 100MB over 12800 pages, 32MB threshold: four ranges.
        let partitioning = split_by_pages(100 << 20, 12_800, Some(32 << 20));
        let CopyPartitioning::CtidRange(ranges) = partitioning else {
            panic!("expected ctid ranges");
        };
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0].start_page, 0);
        // Ranges tile the page space without gaps.
        for window in ranges.windows(2) {
            assert_eq!(window[0].end_page.unwrap(), window[1].start_page);
        }
        assert_eq!(ranges.last().unwrap().end_page, None);
    }

    #[test]
    fn range_count_never_exceeds_pages() {
        let partitioning = split_by_pages(1 << 30, 4, Some(1));
        let CopyPartitioning::CtidRange(ranges) = partitioning else {
            panic!("expected ctid ranges");
        };
        assert!(ranges.len() <= 4);
    }
}
