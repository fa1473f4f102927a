mod cli;
mod commands;
mod error;
mod progress;
mod utils;

use std::process;

use clap::Parser;
use mimalloc::MiMalloc;
use spool_engine::CleanupPolicy;
use tracing::{Level, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands};
use crate::commands::CommandExecutor;
use crate::error::Result;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("Application error: {e}");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let hide_progress = args.quiet;
    let executor = CommandExecutor::new(&args.http, &args.state_dir, hide_progress)?;

    match args.command {
        Commands::Plan { source } => executor.plan(&source).await,
        Commands::Download {
            source,
            engine,
            output_dir,
            id,
            keep_on_failure,
            keep_on_cancel,
        } => {
            let policy = CleanupPolicy {
                delete_on_failure: !keep_on_failure,
                delete_on_cancel: !keep_on_cancel,
                ..CleanupPolicy::default()
            };
            executor
                .download(&source, &engine, &output_dir, id, policy)
                .await
        }
        Commands::Resume {
            id,
            engine,
            output_dir,
        } => executor.resume(&id, &engine, &output_dir).await,
        Commands::List => executor.list().await,
        Commands::Clean {
            id,
            output_dir,
            all,
        } => executor.clean(&id, &output_dir, all).await,
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(verbose),
        )
        .init();
}
