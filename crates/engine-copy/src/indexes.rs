use crate::error::CopyError;
use connectors::postgres::client;
use engine_core::{
    config::RunOptions,
    markers::{DoneKey, DoneMarkers},
    workdir::WorkDir,
};
use model::{
    catalog::{Catalog, SourceIndex},
    idents::quote_ident,
};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// SQL to run on the target for one index unit: the index itself, then
/// the constraint that rides on it, when there is one.
pub fn build_statements(catalog: &Catalog, index: &SourceIndex) -> Vec<String> {
    let mut statements = vec![index.definition.clone()];

    if let Some(constraint) = &index.constraint {
        let table = catalog
            .table(index.table_oid)
            .map(|t| t.qualified_name())
            .unwrap_or_else(|| quote_ident(&index.name));
        let kind = if index.is_primary { "PRIMARY KEY" } else { "UNIQUE" };
        statements.push(format!(
            "ALTER TABLE {table} ADD CONSTRAINT {} {kind} USING INDEX {}",
            quote_ident(&constraint.name),
            quote_ident(&index.name),
        ));
    }

    statements
}

/// Parallel builder for indexes and their attached constraints. Runs
/// concurrently with the table copier: an index becomes eligible the
/// moment its table's done marker lands. Foreign keys are not built here;
/// they ride the post-data restore where all referenced tables exist.
pub struct IndexBuilder {
    target_uri: String,
    jobs: usize,
    markers: DoneMarkers,
}

impl IndexBuilder {
    pub fn new(options: &RunOptions, workdir: &WorkDir) -> Self {
        IndexBuilder {
            target_uri: options.target_uri.clone(),
            jobs: options.index_jobs,
            markers: DoneMarkers::new(workdir),
        }
    }

    /// Consume finished-table announcements until the copier hangs up,
    /// building each table's indexes as capacity allows.
    pub async fn run(
        &self,
        catalog: &Catalog,
        mut tables_done_rx: mpsc::UnboundedReceiver<u32>,
        cancel: CancellationToken,
    ) -> Result<usize, CopyError> {
        let mut by_table: HashMap<u32, Vec<&SourceIndex>> = HashMap::new();
        for index in &catalog.indexes {
            by_table.entry(index.table_oid).or_default().push(index);
        }

        let mut eligible: VecDeque<&SourceIndex> = VecDeque::new();
        let mut builds: JoinSet<Result<(), CopyError>> = JoinSet::new();
        let mut built = 0usize;
        let mut receiving = true;

        loop {
            // Keep the pool full before waiting on anything.
            while builds.len() < self.jobs {
                let Some(index) = eligible.pop_front() else { break };
                if self.markers.is_done(DoneKey::Index(index.oid)) {
                    info!(index = %index.name, "index already built, skipping");
                    continue;
                }
                builds.spawn(build_one(
                    self.target_uri.clone(),
                    self.markers.clone(),
                    index.name.clone(),
                    index.oid,
                    index.constraint.as_ref().map(|c| c.oid),
                    build_statements(catalog, index),
                ));
            }

            if !receiving && eligible.is_empty() && builds.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    // Let in-flight builds finish their statement, start
                    // nothing new.
                    while let Some(result) = builds.join_next().await {
                        result??;
                    }
                    return Ok(built);
                }

                Some(result) = builds.join_next(), if !builds.is_empty() => {
                    result??;
                    built += 1;
                }

                received = tables_done_rx.recv(), if receiving => {
                    match received {
                        Some(table_oid) => {
                            if let Some(indexes) = by_table.remove(&table_oid) {
                                eligible.extend(indexes);
                            }
                        }
                        None => receiving = false,
                    }
                }
            }
        }

        if !by_table.is_empty() {
            // Their tables never finished copying; the copier reports the
            // failure, these indexes stay pending for the next run.
            warn!(tables = by_table.len(), "tables without data left their indexes unbuilt");
        }

        info!(built, "index build complete");
        Ok(built)
    }
}

async fn build_one(
    target_uri: String,
    markers: DoneMarkers,
    name: String,
    index_oid: u32,
    constraint_oid: Option<u32>,
    statements: Vec<String>,
) -> Result<(), CopyError> {
    let target = client::connect(&target_uri).await?;

    for statement in &statements {
        if let Err(err) = target.batch_execute(statement).await {
            return Err(CopyError::IndexBuild {
                index: name,
                source: connectors::error::DbError::Pg(err),
            });
        }
    }

    // The post-data include-list consults these markers to skip objects
    // already built here; the constraint has its own archive entry.
    markers.mark_done(DoneKey::Index(index_oid))?;
    if let Some(constraint_oid) = constraint_oid {
        markers.mark_done(DoneKey::Index(constraint_oid))?;
    }

    info!(index = %name, statements = statements.len(), "index built");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::catalog::{CopyPartitioning, IndexConstraint, SourceTable};

    fn catalog_with_index(constraint: Option<IndexConstraint>, is_primary: bool) -> Catalog {
        Catalog {
            tables: vec![SourceTable {
                oid: 100,
                nspname: "public".into(),
                relname: "t".into(),
                estimated_row_count: 0,
                bytes: 0,
                relpages: 0,
                columns: vec![],
                partition_key: None,
                partitioning: CopyPartitioning::Whole,
            }],
            indexes: vec![SourceIndex {
                oid: 200,
                table_oid: 100,
                nspname: "public".into(),
                name: "t_pkey".into(),
                definition: "CREATE UNIQUE INDEX t_pkey ON public.t USING btree (id)".into(),
                is_primary,
                is_unique: true,
                constraint,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn plain_index_is_one_statement() {
        let catalog = catalog_with_index(None, false);
        let statements = build_statements(&catalog, &catalog.indexes[0]);
        assert_eq!(statements, vec![catalog.indexes[0].definition.clone()]);
    }

    #[test]
    fn constraint_attaches_via_using_index() {
        let constraint = IndexConstraint {
            oid: 300,
            name: "t_pkey".into(),
            definition: "PRIMARY KEY (id)".into(),
        };
        let catalog = catalog_with_index(Some(constraint), true);
        let statements = build_statements(&catalog, &catalog.indexes[0]);
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[1],
            "ALTER TABLE \"public\".\"t\" ADD CONSTRAINT \"t_pkey\" PRIMARY KEY USING INDEX \"t_pkey\""
        );
    }

    #[test]
    fn unique_constraint_uses_unique_keyword() {
        let constraint = IndexConstraint {
            oid: 300,
            name: "t_v_key".into(),
            definition: "UNIQUE (v)".into(),
        };
        let catalog = catalog_with_index(Some(constraint), false);
        let statements = build_statements(&catalog, &catalog.indexes[0]);
        assert!(statements[1].contains("ADD CONSTRAINT \"t_v_key\" UNIQUE USING INDEX"));
    }
}
