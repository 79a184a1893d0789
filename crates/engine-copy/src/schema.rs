use crate::error::CopyError;
use engine_core::{
    config::RunOptions,
    markers::{DoneKey, DoneMarkers},
    workdir::{DumpPass, WorkDir},
};
use model::{archive::ArchiveEntry, catalog::Catalog, idents::quote_ident};
use std::process::Stdio;
use tokio::process::Command;
use tokio_postgres::Client;
use tracing::{debug, info, warn};

/// Drives the external dumper and restorer: two dump passes, archive-list
/// rewriting, and the filtered restore. Every pass is gated by a done
/// marker so a rerun skips finished work.
pub struct SchemaDriver<'a> {
    options: &'a RunOptions,
    workdir: &'a WorkDir,
    markers: DoneMarkers,
}

impl<'a> SchemaDriver<'a> {
    pub fn new(options: &'a RunOptions, workdir: &'a WorkDir) -> Self {
        let markers = DoneMarkers::new(workdir);
        SchemaDriver { options, workdir, markers }
    }

    fn dump_key(pass: DumpPass) -> DoneKey {
        match pass {
            DumpPass::PreData => DoneKey::PreDataDump,
            DumpPass::PostData => DoneKey::PostDataDump,
        }
    }

    fn restore_key(pass: DumpPass) -> DoneKey {
        match pass {
            DumpPass::PreData => DoneKey::PreDataRestore,
            DumpPass::PostData => DoneKey::PostDataRestore,
        }
    }

    /// Run one `pg_dump` pass into the work directory, under the exported
    /// snapshot when one is held.
    pub async fn dump(&self, pass: DumpPass, snapshot: Option<&str>) -> Result<(), CopyError> {
        let key = Self::dump_key(pass);
        if self.markers.is_done(key) {
            info!(pass = pass.as_str(), "schema dump already done, skipping");
            return Ok(());
        }

        let dump_path = self.workdir.dump_path(pass);
        let mut command = Command::new("pg_dump");
        command
            .arg("--format")
            .arg("custom")
            .arg("--section")
            .arg(pass.as_str())
            .arg("--file")
            .arg(&dump_path);
        if let Some(snapshot) = snapshot {
            command.arg("--snapshot").arg(snapshot);
        }
        command.arg(&self.options.source_uri);

        info!(pass = pass.as_str(), file = %dump_path.display(), "running pg_dump");
        run_tool("pg_dump", &mut command).await?;

        self.markers.mark_done(key)?;
        Ok(())
    }

    /// Restore one pass on the target through a rewritten include-list.
    /// The target client is used for the preparatory statements the
    /// restorer cannot be trusted with under a partial list.
    pub async fn restore(
        &self,
        pass: DumpPass,
        catalog: &Catalog,
        target: &Client,
    ) -> Result<(), CopyError> {
        let key = Self::restore_key(pass);
        if self.markers.is_done(key) {
            info!(pass = pass.as_str(), "schema restore already done, skipping");
            return Ok(());
        }

        if pass == DumpPass::PreData {
            self.prepare_target(catalog, target).await?;
        }

        let entries = self.archive_entries(pass).await?;
        let list = self.build_include_list(&entries);
        let list_path = self.workdir.list_path(pass);
        tokio::fs::write(&list_path, list).await?;

        let mut command = Command::new("pg_restore");
        command
            .arg("--dbname")
            .arg(&self.options.target_uri)
            .arg("--use-list")
            .arg(&list_path)
            .arg("--no-owner")
            .arg(self.workdir.dump_path(pass));

        info!(pass = pass.as_str(), list = %list_path.display(), "running pg_restore");
        run_tool("pg_restore", &mut command).await?;

        self.markers.mark_done(key)?;
        Ok(())
    }

    /// Read the archive table of contents with `pg_restore --list`.
    pub async fn archive_entries(&self, pass: DumpPass) -> Result<Vec<ArchiveEntry>, CopyError> {
        let output = Command::new("pg_restore")
            .arg("--list")
            .arg(self.workdir.dump_path(pass))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(CopyError::Subprocess {
                program: "pg_restore --list".into(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        let mut entries = Vec::new();
        for line in listing.lines() {
            match ArchiveEntry::parse(line) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(err) => {
                    // The archive header carries free-form text; only real
                    // TOC lines matter and those parse.
                    debug!(%err, line, "skipping unparsable list line");
                }
            }
        }
        Ok(entries)
    }

    /// Rewrite the entry list into an include-list: entries whose object
    /// already has a done marker (built concurrently) or that fail the
    /// filters get the comment sentinel; the rest pass through verbatim.
    pub fn build_include_list(&self, entries: &[ArchiveEntry]) -> String {
        let mut lines = Vec::with_capacity(entries.len());
        let mut skipped = 0usize;

        for entry in entries {
            if self.entry_is_done(entry) || self.entry_is_filtered(entry) {
                skipped += 1;
                lines.push(entry.commented());
            } else {
                lines.push(entry.raw.clone());
            }
        }

        if skipped > 0 {
            info!(skipped, total = entries.len(), "include-list entries commented out");
        }

        let mut list = lines.join("\n");
        list.push('\n');
        list
    }

    fn entry_is_done(&self, entry: &ArchiveEntry) -> bool {
        entry.object_oid != 0
            && (self.markers.is_done(DoneKey::Index(entry.object_oid))
                || self.markers.is_done(DoneKey::Table(entry.object_oid)))
    }

    fn entry_is_filtered(&self, entry: &ArchiveEntry) -> bool {
        if self.options.filters.is_empty() {
            return false;
        }
        match (&entry.namespace, entry.object_name()) {
            (Some(namespace), Some(name)) => !self.options.filters.allows(namespace, name),
            // Entries without a namespace (schemas, extensions, …) are
            // kept; the four clauses only speak about tables.
            _ => false,
        }
    }

    /// Target-side groundwork the restorer's own options get wrong with a
    /// partial include-list: schema creation for include-only runs, and
    /// one collective DROP for `--drop-if-exists`.
    async fn prepare_target(&self, catalog: &Catalog, target: &Client) -> Result<(), CopyError> {
        for schema in &self.options.filters.include_only_schemas {
            target
                .batch_execute(&format!("create schema if not exists {}", quote_ident(schema)))
                .await
                .map_err(connectors::error::DbError::Pg)?;
        }

        if self.options.drop_if_exists {
            let tables: Vec<String> =
                catalog.tables.iter().map(|t| t.qualified_name()).collect();
            if tables.is_empty() {
                warn!("--drop-if-exists requested but this run has no tables");
            } else {
                let drop = format!("drop table if exists {} cascade", tables.join(", "));
                info!(tables = tables.len(), "dropping stale target tables");
                target
                    .batch_execute(&drop)
                    .await
                    .map_err(connectors::error::DbError::Pg)?;
            }
        }

        Ok(())
    }
}

async fn run_tool(program: &str, command: &mut Command) -> Result<(), CopyError> {
    let output = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(CopyError::Subprocess {
            program: program.into(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::config::RawOptions;
    use model::filter::TableFilters;
    use tempfile::tempdir;

    fn options_with_filters(filters: TableFilters) -> RunOptions {
        RawOptions {
            source: Some("postgres://src/db".into()),
            target: Some("postgres://dst/db".into()),
            filters,
            ..Default::default()
        }
        .resolve()
        .unwrap()
    }

    fn driver_fixture(
        filters: TableFilters,
    ) -> (tempfile::TempDir, RunOptions, WorkDir) {
        let dir = tempdir().unwrap();
        let workdir = WorkDir::at(dir.path().join("run"));
        workdir.ensure_layout().unwrap();
        (dir, options_with_filters(filters), workdir)
    }

    #[test]
    fn include_list_comments_filtered_tables() {
        let filters = TableFilters {
            exclude_tables: vec!["s.secret".into()],
            ..Default::default()
        };
        let (_dir, options, workdir) = driver_fixture(filters);
        let driver = SchemaDriver::new(&options, &workdir);

        let entries = vec![
            ArchiveEntry::parse("215; 1259 16386 TABLE public foo owner").unwrap().unwrap(),
            ArchiveEntry::parse("216; 1259 16390 TABLE s secret owner").unwrap().unwrap(),
        ];
        let list = driver.build_include_list(&entries);
        let lines: Vec<&str> = list.lines().collect();
        assert_eq!(lines[0], "215; 1259 16386 TABLE public foo owner");
        assert_eq!(lines[1], ";216; 1259 16390 TABLE s secret owner");
    }

    #[test]
    fn include_list_comments_already_built_indexes() {
        let (_dir, options, workdir) = driver_fixture(TableFilters::default());
        let markers = DoneMarkers::new(&workdir);
        markers.mark_done(DoneKey::Index(16395)).unwrap();
        markers.mark_done(DoneKey::Index(16396)).unwrap();

        let driver = SchemaDriver::new(&options, &workdir);
        let entries = vec![
            ArchiveEntry::parse("1259; 1259 16395 INDEX public i1 owner").unwrap().unwrap(),
            ArchiveEntry::parse("1260; 1259 16396 INDEX public i2 owner").unwrap().unwrap(),
            ArchiveEntry::parse("1261; 1259 16397 INDEX public i3 owner").unwrap().unwrap(),
        ];
        let list = driver.build_include_list(&entries);
        let lines: Vec<&str> = list.lines().collect();
        assert!(lines[0].starts_with(';'));
        assert!(lines[1].starts_with(';'));
        assert!(!lines[2].starts_with(';'));
    }

    #[test]
    fn schemaless_entries_survive_filtering() {
        let filters = TableFilters {
            include_only_schemas: vec!["app".into()],
            ..Default::default()
        };
        let (_dir, options, workdir) = driver_fixture(filters);
        let driver = SchemaDriver::new(&options, &workdir);

        let entries = vec![
            ArchiveEntry::parse("10; 2615 2200 SCHEMA - app owner").unwrap().unwrap(),
            ArchiveEntry::parse("215; 1259 16386 TABLE app t owner").unwrap().unwrap(),
            ArchiveEntry::parse("216; 1259 16390 TABLE public t owner").unwrap().unwrap(),
        ];
        let list = driver.build_include_list(&entries);
        let lines: Vec<&str> = list.lines().collect();
        assert!(!lines[0].starts_with(';'));
        assert!(!lines[1].starts_with(';'));
        assert!(lines[2].starts_with(';'));
    }
}
