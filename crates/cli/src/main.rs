use crate::{
    commands::{Commands, CopyCommand, GlobalArgs, StreamCommand},
    conn::{EndpointPinger, PostgresEndpointPinger},
    error::CliError,
    shutdown::ShutdownCoordinator,
};
use clap::Parser;
use engine_core::config::RunOptions;
use engine_runtime::executor;
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;
mod conn;
mod error;
mod shutdown;

#[derive(Parser)]
#[command(
    name = "pgcopydb",
    version,
    about = "Clone a PostgreSQL database, with optional change-data-capture"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(notice_requested(&cli.command));

    let exit_code = match run_cli(cli).await {
        Ok(()) => 0,
        Err(err) => {
            match &err {
                CliError::ShutdownRequested => {
                    info!("Stopped on request; state is resumable");
                }
                other => tracing::error!("{other}"),
            }
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn notice_requested(command: &Commands) -> bool {
    match command {
        Commands::Ping(args) | Commands::Snapshot(args) | Commands::Follow(args) => args.notice(),
        Commands::Copy { command: CopyCommand::TableData(args) } => args.notice(),
        Commands::Stream { command: StreamCommand::Cleanup(args) } => args.notice(),
    }
}

fn init_tracing(notice: bool) {
    let default_level = if notice { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_cli(cli: Cli) -> Result<(), CliError> {
    let cancel = CancellationToken::new();
    let coordinator = ShutdownCoordinator::new(cancel.clone());
    coordinator.register_handlers();

    match cli.command {
        Commands::Ping(args) => {
            let options = resolve(args)?;
            ping_endpoints(&options).await
        }

        Commands::Snapshot(args) => {
            let options = resolve(args)?;
            executor::snapshot(options, cancel).await?;
            Ok(())
        }

        Commands::Copy { command: CopyCommand::TableData(args) } => {
            let options = resolve(args)?;
            match executor::copy_table_data(options, cancel.clone()).await {
                Ok(summary) => {
                    if coordinator.is_shutdown_requested() {
                        return Err(CliError::ShutdownRequested);
                    }
                    info!(
                        tables = summary.tables_total,
                        skipped = summary.tables_skipped,
                        units = summary.units_copied,
                        rows = summary.rows_copied,
                        bytes = summary.bytes_copied,
                        "copy table-data complete"
                    );
                    Ok(())
                }
                Err(err) if err.is_shutdown() => Err(CliError::ShutdownRequested),
                Err(err) => Err(err.into()),
            }
        }

        Commands::Follow(args) => {
            let options = resolve(args)?;
            let replayed = executor::follow(options, cancel.clone()).await;
            match replayed {
                Ok(lsn) => {
                    info!(replayed = %lsn, "follow complete");
                    Ok(())
                }
                Err(err) if err.is_shutdown() => Err(CliError::ShutdownRequested),
                Err(err) => Err(err.into()),
            }
        }

        Commands::Stream { command: StreamCommand::Cleanup(args) } => {
            let options = resolve(args)?;
            executor::stream_cleanup(options).await?;
            Ok(())
        }
    }
}

fn resolve(args: GlobalArgs) -> Result<RunOptions, CliError> {
    Ok(args.into_raw()?.resolve()?)
}

/// Exit 0 iff both endpoints are reachable and answer a trivial query.
async fn ping_endpoints(options: &RunOptions) -> Result<(), CliError> {
    PostgresEndpointPinger {
        label: "source",
        conn_str: options.source_uri.clone(),
    }
    .ping()
    .await?;

    PostgresEndpointPinger {
        label: "target",
        conn_str: options.target_uri.clone(),
    }
    .ping()
    .await?;

    Ok(())
}
