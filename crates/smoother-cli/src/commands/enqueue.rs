//! Queue producer commands

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use smoother_core::models::parse_timestamp;
use smoother_core::{Database, Direction, TransactionEvent};
use tracing::warn;

/// Queue a single event built from command-line arguments
pub fn cmd_enqueue_event(
    db: &Database,
    user: &str,
    amount: f64,
    direction: &str,
    ts: Option<&str>,
    partitions: u32,
) -> Result<()> {
    let direction: Direction = direction.parse().map_err(anyhow::Error::msg)?;
    let timestamp = match ts {
        Some(ts) => parse_timestamp(ts).with_context(|| format!("Invalid timestamp: {}", ts))?,
        None => Utc::now(),
    };

    let payload = TransactionEvent {
        user_id: user.to_string(),
        timestamp,
        amount,
        direction,
    }
    .to_json();

    // Refuse to knowingly queue something that will be dead-lettered
    TransactionEvent::from_json(&payload).context("Invalid event")?;

    let id = db
        .enqueue_event(&payload, partitions)
        .context("Failed to enqueue event")?;

    println!(
        "📥 Queued event #{}: {} {:.2} for {} at {}",
        id,
        direction,
        amount,
        user,
        timestamp.to_rfc3339()
    );

    Ok(())
}

/// Queue every line of a JSON-lines file.
///
/// Malformed lines are queued as well so they show up as rejected events
/// instead of disappearing.
pub fn cmd_enqueue_file(db: &Database, path: &Path, partitions: u32) -> Result<()> {
    println!("📥 Queueing events from {}...", path.display());

    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut queued = 0;
    let mut malformed = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        let payload = line.trim();
        if payload.is_empty() {
            continue;
        }

        if let Err(e) = TransactionEvent::from_json(payload) {
            warn!("Line {}: {}", index + 1, e);
            malformed += 1;
        }
        db.enqueue_event(payload, partitions)
            .with_context(|| format!("Failed to enqueue line {}", index + 1))?;
        queued += 1;
    }

    println!("✅ Queued {} event(s)", queued);
    if malformed > 0 {
        println!(
            "   ⚠️  {} malformed event(s) will be rejected on delivery",
            malformed
        );
    }

    Ok(())
}
