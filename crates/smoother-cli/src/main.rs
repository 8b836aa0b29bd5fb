//! Smoother CLI - per-user balance smoothing service
//!
//! Usage:
//!   smoother init                          Initialize database
//!   smoother enqueue --file events.jsonl   Queue transaction events
//!   smoother run                           Consume the queue until Ctrl-C
//!   smoother history alice                 Recent smoothed balances

mod cli;
mod commands;


use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    match cli.command {
        Commands::Init => commands::cmd_init(&cli.db, cli.no_encrypt),
        Commands::Run {
            consumer_id,
            partitions,
            owned,
        } => {
            let mut config = commands::load_config(cli.config.as_deref())?;
            commands::apply_run_overrides(&mut config, consumer_id, partitions, owned)?;
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_run(&db, config).await
        }
        Commands::Enqueue {
            file,
            user,
            amount,
            direction,
            ts,
        } => {
            let config = commands::load_config(cli.config.as_deref())?;
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match (file, user, amount) {
                (Some(file), _, _) => {
                    commands::cmd_enqueue_file(&db, &file, config.queue.partitions)
                }
                (None, Some(user), Some(amount)) => commands::cmd_enqueue_event(
                    &db,
                    &user,
                    amount,
                    &direction,
                    ts.as_deref(),
                    config.queue.partitions,
                ),
                _ => anyhow::bail!("Provide --file, or --user and --amount"),
            }
        }
        Commands::History { user, limit, json } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_history(&db, &user, limit, json)
        }
        Commands::State { user, json } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_state(&db, user.as_deref(), json)
        }
        Commands::Status => {
            commands::cmd_status(&cli.db, cli.config.as_deref(), cli.no_encrypt)
        }
        Commands::Queue { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                None => commands::cmd_queue_list(&db, None, 20),
                Some(QueueAction::List { status, limit }) => {
                    commands::cmd_queue_list(&db, status.as_deref(), limit)
                }
                Some(QueueAction::Requeue { id }) => commands::cmd_queue_requeue(&db, id),
            }
        }
    }
}
