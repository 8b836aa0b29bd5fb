//! Queue administration commands

use anyhow::{Context, Result};
use smoother_core::{Database, QueueStatus};

use super::truncate;

pub fn cmd_queue_list(db: &Database, status: Option<&str>, limit: usize) -> Result<()> {
    let status = status
        .map(|s| s.parse::<QueueStatus>().map_err(anyhow::Error::msg))
        .transpose()?;

    let events = db
        .list_queue(status, limit)
        .context("Failed to read event queue")?;

    if events.is_empty() {
        match status {
            Some(status) => println!("No {} events.", status),
            None => println!("Queue is empty. Add events with: smoother enqueue --file events.jsonl"),
        }
        return Ok(());
    }

    println!();
    println!("📬 Event queue");
    println!("   ─────────────────────────────────────────────────────────────");

    for event in &events {
        let icon = match event.status {
            QueueStatus::Pending => "⏳",
            QueueStatus::Leased => "🔄",
            QueueStatus::Done => "✅",
            QueueStatus::Rejected => "❌",
            QueueStatus::Gap => "⚠️ ",
        };
        println!(
            "   {} #{:<6} {:<9} user={:<16} p={} tries={}",
            icon,
            event.id,
            event.status,
            event.user_id.as_deref().unwrap_or("-"),
            event.partition,
            event.deliveries
        );
        println!("      {}", truncate(&event.payload, 72));
        if let Some(error) = &event.last_error {
            println!("      reason: {}", error);
        }
    }
    println!();

    Ok(())
}

pub fn cmd_queue_requeue(db: &Database, id: i64) -> Result<()> {
    if db.requeue_event(id).context("Failed to requeue event")? {
        println!("✅ Event #{} is pending again", id);
        Ok(())
    } else {
        anyhow::bail!(
            "Event #{} is not rejected (only dead-lettered events can be requeued)",
            id
        )
    }
}
