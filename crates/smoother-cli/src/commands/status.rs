//! Status command implementation

use std::path::Path;

use anyhow::Result;
use smoother_core::config::default_config_path;
use smoother_core::db::DB_KEY_ENV;
use smoother_core::Database;
use tracing::warn;

use super::{load_config, open_db};

pub fn cmd_status(db_path: &Path, config_path: Option<&Path>, no_encrypt: bool) -> Result<()> {
    use std::fs;

    println!();
    println!("📊 Smoother Status");
    println!("   ─────────────────────────────────────────────────────────────");

    // Database path
    println!("   Database: {}", db_path.display());

    // Check if database file exists and get size
    if db_path.exists() {
        if let Ok(metadata) = fs::metadata(db_path) {
            let size_kb = metadata.len() as f64 / 1024.0;
            if size_kb < 1024.0 {
                println!("   Size: {:.1} KB", size_kb);
            } else {
                println!("   Size: {:.1} MB", size_kb / 1024.0);
            }
        }
    } else {
        println!("   Size: (database not initialized)");
    }

    // Check encryption status
    let has_key = std::env::var(DB_KEY_ENV).is_ok();
    if no_encrypt {
        println!("   ⚠️  Encryption: DISABLED (--no-encrypt)");
    } else if has_key {
        println!("   🔒 Encryption: ENABLED ({}=***)", DB_KEY_ENV);
    } else {
        println!("   ❌ Encryption: REQUIRED but {} not set", DB_KEY_ENV);
    }

    // Configuration
    let source = match config_path {
        Some(path) => path.display().to_string(),
        None => match default_config_path() {
            Some(path) if path.exists() => path.display().to_string(),
            _ => "built-in defaults".to_string(),
        },
    };
    println!();
    println!("   Config: {}", source);
    let partitions = match load_config(config_path) {
        Ok(config) => {
            println!("   Observation model: {}", config.filter.observation.as_str());
            println!(
                "   Partitions: {:?} of {}",
                config.queue.claimed_partitions(),
                config.queue.partitions
            );
            Some(config.queue.partitions)
        }
        Err(e) => {
            println!("   ❌ {:#}", e);
            None
        }
    };

    // Try to open the database and show stats
    if db_path.exists() {
        match open_db(db_path, no_encrypt) {
            Ok(db) => {
                println!();
                if let Ok(users) = db.count_states() {
                    println!("   Users: {}", users);
                }
                if let Ok(records) = db.count_records(None) {
                    println!("   Smoothed records: {}", records);
                }
                if let Ok(queue) = db.queue_stats() {
                    println!(
                        "   Queue: {} pending, {} leased, {} done",
                        queue.pending, queue.leased, queue.done
                    );
                    if queue.rejected > 0 {
                        println!("   ❌ Rejected: {}", queue.rejected);
                    }
                    if queue.gap > 0 {
                        println!("   ⚠️  Output gaps: {}", queue.gap);
                        println!("      Inspect with: smoother queue list --status gap");
                    }
                }
                if let Some(partitions) = partitions {
                    warn_unroutable(&db, partitions);
                }
            }
            Err(e) => {
                println!();
                println!("   ❌ Error opening database: {}", e);
                if !no_encrypt && !has_key {
                    println!("      Set {} or use --no-encrypt", DB_KEY_ENV);
                } else if has_key {
                    println!("      (Check if {} is correct)", DB_KEY_ENV);
                }
            }
        }
    }

    println!();
    Ok(())
}

/// Warn about pending events hashed into partitions `>= partitions`.
/// Returns how many there are.
pub fn warn_unroutable(db: &Database, partitions: u32) -> i64 {
    match db.count_unroutable_pending(partitions) {
        Ok(0) => 0,
        Ok(count) => {
            warn!(count, partitions, "Pending events outside the configured partitions");
            println!(
                "   ⚠️  {} pending event(s) in partitions ≥ {}; no consumer will claim them",
                count, partitions
            );
            println!("      Producers and consumers must use the same partition count");
            count
        }
        Err(e) => {
            warn!("Failed to check queue partitions: {}", e);
            0
        }
    }
}
