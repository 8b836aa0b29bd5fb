//! Core command implementations and shared utilities
//!
//! This module contains:
//! - `open_db` - Shared utility to open the database
//! - `load_config` - Shared utility to resolve configuration
//! - `cmd_init` - Initialize the database

use std::path::Path;

use anyhow::{Context, Result};
use smoother_core::{Database, SmootherConfig};

/// Open database with encryption by default, or unencrypted if --no-encrypt
pub fn open_db(db_path: &Path, no_encrypt: bool) -> Result<Database> {
    let path_str = db_path
        .to_str()
        .with_context(|| format!("Database path is not valid UTF-8: {}", db_path.display()))?;
    if no_encrypt {
        Database::new_unencrypted(path_str).context("Failed to open database (unencrypted)")
    } else {
        Database::new(path_str).context("Failed to open database")
    }
}

/// Resolve configuration: explicit path, data-dir override, built-in defaults
pub fn load_config(path: Option<&Path>) -> Result<SmootherConfig> {
    SmootherConfig::load(path).context("Failed to load configuration")
}

/// Layer `smoother run` flags over the loaded configuration
pub fn apply_run_overrides(
    config: &mut SmootherConfig,
    consumer_id: Option<String>,
    partitions: Option<u32>,
    owned: Vec<u32>,
) -> Result<()> {
    if let Some(id) = consumer_id {
        config.queue.consumer_id = id;
    }
    if let Some(partitions) = partitions {
        config.queue.partitions = partitions;
    }
    if !owned.is_empty() {
        config.queue.owned_partitions = owned;
    }
    config.validate().context("Invalid run options")?;
    Ok(())
}

pub fn cmd_init(db_path: &Path, no_encrypt: bool) -> Result<()> {
    println!("🔧 Initializing database at {}...", db_path.display());

    let db = open_db(db_path, no_encrypt)?;
    let users = db.count_states().context("Failed to read filter state")?;
    println!("   Filter state, smoothed balance log and event queue ready");
    if users > 0 {
        println!("   Existing state for {} user(s) kept", users);
    }

    if no_encrypt {
        println!("   ⚠️  Encryption: DISABLED (--no-encrypt)");
    } else {
        println!("   🔒 Encryption: ENABLED");
    }

    println!("✅ Database initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  1. Queue events: smoother enqueue --file events.jsonl");
    println!("  2. Start smoothing: smoother run");

    Ok(())
}
