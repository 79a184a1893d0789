use crate::error::CliError;
use clap::{Args, Subcommand};
use engine_core::config::RawOptions;
use model::filter::TableFilters;

#[derive(Subcommand)]
pub enum Commands {
    /// Check that both endpoints answer queries; exit 0 iff they do
    Ping(GlobalArgs),

    /// Export a consistent snapshot and hold it until killed
    Snapshot(GlobalArgs),

    Copy {
        #[command(subcommand)]
        command: CopyCommand,
    },

    /// Stream and apply source changes until the end position is reached
    Follow(GlobalArgs),

    Stream {
        #[command(subcommand)]
        command: StreamCommand,
    },
}

#[derive(Subcommand)]
pub enum CopyCommand {
    /// Bulk-copy schema, table data, indexes and constraints; idempotent
    TableData(GlobalArgs),
}

#[derive(Subcommand)]
pub enum StreamCommand {
    /// Drop the replication slot and origin, and clear local state
    Cleanup(GlobalArgs),
}

#[derive(Args)]
pub struct GlobalArgs {
    #[arg(long, help = "Source connection string (or PGCOPYDB_SOURCE_PGURI)")]
    pub source: Option<String>,

    #[arg(long, help = "Target connection string (or PGCOPYDB_TARGET_PGURI)")]
    pub target: Option<String>,

    #[arg(long, help = "Parallel table-data copy workers")]
    pub table_jobs: Option<usize>,

    #[arg(long, help = "Parallel index build workers")]
    pub index_jobs: Option<usize>,

    #[arg(long, help = "Drop this run's target tables before the pre-data restore")]
    pub drop_if_exists: bool,

    #[arg(long, help = "Skip copying extension configuration tables")]
    pub skip_extensions: bool,

    #[arg(long, help = "Fail the run when extension config copy fails")]
    pub strict_extensions: bool,

    #[arg(long, help = "Stop replay after this LSN (e.g. 0/16B6C50)")]
    pub endpos: Option<String>,

    #[arg(long, help = "Replication origin name on the target")]
    pub origin: Option<String>,

    #[arg(long, help = "Replication slot name on the source")]
    pub slot_name: Option<String>,

    #[arg(long, help = "Logical decoding plugin: wal2json, test_decoding or pgoutput")]
    pub plugin: Option<String>,

    #[arg(long, help = "Discard previous run state and start over")]
    pub restart: bool,

    #[arg(long, help = "Continue a previously interrupted run")]
    pub resume: bool,

    #[arg(long, help = "Verbose output")]
    pub notice: bool,

    #[arg(long, help = "Create the replication slot together with the snapshot")]
    pub follow: bool,

    #[arg(long, help = "Split tables larger than this many bytes into ctid ranges")]
    pub split_tables_larger_than: Option<u64>,

    #[arg(long, help = "JSON file with include/exclude filter clauses")]
    pub filters: Option<String>,

    #[arg(long, help = "Exclude a table (schema.table); repeatable")]
    pub exclude_table: Vec<String>,

    #[arg(long, help = "Only include these tables (schema.table); repeatable")]
    pub include_only_table: Vec<String>,

    #[arg(long, help = "Exclude a schema; repeatable")]
    pub exclude_schema: Vec<String>,

    #[arg(long, help = "Only include these schemas; repeatable")]
    pub include_only_schema: Vec<String>,
}

impl GlobalArgs {
    pub fn notice(&self) -> bool {
        self.notice
    }

    /// Fold the flags into unresolved options; environment fallbacks and
    /// validation happen in `resolve`.
    pub fn into_raw(self) -> Result<RawOptions, CliError> {
        let mut filters = match &self.filters {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                serde_json::from_str::<TableFilters>(&content)?
            }
            None => TableFilters::default(),
        };
        filters.exclude_tables.extend(self.exclude_table);
        filters.include_only_tables.extend(self.include_only_table);
        filters.exclude_schemas.extend(self.exclude_schema);
        filters.include_only_schemas.extend(self.include_only_schema);

        Ok(RawOptions {
            source: self.source,
            target: self.target,
            table_jobs: self.table_jobs,
            index_jobs: self.index_jobs,
            drop_if_exists: self.drop_if_exists,
            skip_extensions: self.skip_extensions,
            strict_extensions: self.strict_extensions,
            endpos: self.endpos,
            origin: self.origin,
            slot_name: self.slot_name,
            plugin: self.plugin,
            restart: self.restart,
            resume: self.resume,
            notice: self.notice,
            follow: self.follow,
            split_tables_larger_than: self.split_tables_larger_than,
            filters,
        })
    }
}
