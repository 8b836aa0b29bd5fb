//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Smoother - per-user Kalman balance smoothing
#[derive(Parser)]
#[command(name = "smoother")]
#[command(about = "Recursive balance smoothing over a transaction event stream", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database path
    #[arg(long, default_value = "smoother.db", global = true)]
    pub db: PathBuf,

    /// Configuration file (defaults to the platform data dir, then built-in defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable database encryption (not recommended for production)
    ///
    /// By default, the database is encrypted using SQLCipher.
    /// Set SMOOTHER_DB_KEY environment variable with your passphrase.
    /// Use --no-encrypt only for development or testing.
    #[arg(long, global = true)]
    pub no_encrypt: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database
    Init,

    /// Consume queued events until interrupted
    Run {
        /// Consumer id used for queue leases (default: smoother-<pid>)
        #[arg(long)]
        consumer_id: Option<String>,

        /// Total number of queue partitions
        #[arg(long)]
        partitions: Option<u32>,

        /// Partitions this consumer owns, comma-separated (default: all)
        #[arg(long, value_delimiter = ',')]
        owned: Vec<u32>,
    },

    /// Add transaction events to the queue
    Enqueue {
        /// JSON-lines file with one event per line
        #[arg(short, long, conflicts_with_all = ["user", "amount"])]
        file: Option<PathBuf>,

        /// User id
        #[arg(short, long, requires = "amount")]
        user: Option<String>,

        /// Unsigned transaction amount
        #[arg(short, long, requires = "user")]
        amount: Option<f64>,

        /// debit or credit
        #[arg(short, long, default_value = "debit")]
        direction: String,

        /// Event time, ISO-8601 (defaults to now)
        #[arg(long)]
        ts: Option<String>,
    },

    /// Show recent smoothed balances for a user
    History {
        /// User id
        user: String,

        /// Number of records to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Output as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show filter state for one user, or all users
    State {
        /// User id (all users if omitted)
        user: Option<String>,

        /// Output the persisted state document as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show database, queue and configuration status
    Status,

    /// Inspect and repair the event queue
    Queue {
        #[command(subcommand)]
        action: Option<QueueAction>,
    },
}

#[derive(Subcommand)]
pub enum QueueAction {
    /// List queued events
    List {
        /// Only events with this status: pending, leased, done, rejected, gap
        #[arg(short, long)]
        status: Option<String>,

        /// Number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Put a rejected event back in the queue
    Requeue {
        /// Queue event id
        id: i64,
    },
}
