use crate::error::CopyError;
use connectors::postgres::{client, copy::stream_copy, snapshot::set_transaction_snapshot};
use engine_core::{config::RunOptions, workdir::WorkDir};
use model::{catalog::Catalog, idents::quote_qualified};
use tracing::{info, warn};

/// Copies the rows of tables that source extensions declare as
/// configuration data, narrowed by each extension's where-clause. An
/// auxiliary step: failures are logged and only fail the run in strict
/// mode.
pub struct ExtensionConfigCopier {
    source_uri: String,
    target_uri: String,
    strict: bool,
}

impl ExtensionConfigCopier {
    pub fn new(options: &RunOptions, _workdir: &WorkDir) -> Self {
        ExtensionConfigCopier {
            source_uri: options.source_uri.clone(),
            target_uri: options.target_uri.clone(),
            strict: options.strict_extensions,
        }
    }

    pub async fn run(&self, catalog: &Catalog, snapshot: Option<&str>) -> Result<(), CopyError> {
        if catalog.extensions.iter().all(|e| e.config_tables.is_empty()) {
            return Ok(());
        }

        let source = client::connect(&self.source_uri).await?;
        let target = client::connect(&self.target_uri).await?;

        match snapshot {
            Some(snapshot) => set_transaction_snapshot(&source, snapshot).await?,
            None => {
                source
                    .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ, READ ONLY")
                    .await
                    .map_err(connectors::error::DbError::Pg)?
            }
        }

        let mut failures = 0usize;
        for extension in &catalog.extensions {
            for table in &extension.config_tables {
                let qualified = quote_qualified(&table.nspname, &table.relname);
                let out_sql = match &table.condition {
                    Some(condition) => format!(
                        "COPY (SELECT * FROM {qualified} WHERE {condition}) TO STDOUT"
                    ),
                    None => format!("COPY {qualified} TO STDOUT"),
                };
                let in_sql = format!("COPY {qualified} FROM STDIN");

                match stream_copy(&source, &target, &out_sql, &in_sql).await {
                    Ok((rows, _bytes)) => {
                        info!(extension = %extension.name, table = %qualified, rows, "extension config copied");
                    }
                    Err(err) => {
                        failures += 1;
                        warn!(
                            extension = %extension.name,
                            table = %qualified,
                            error = %err,
                            "extension config copy failed"
                        );
                    }
                }
            }
        }

        let _ = source.batch_execute("ROLLBACK").await;

        if failures > 0 && self.strict {
            return Err(CopyError::UnitsFailed { failed: failures });
        }
        Ok(())
    }
}
