//! Service command implementation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use smoother_core::{Database, QueueConsumer, ServiceStats, SmootherConfig, SmoothingService};
use tracing::info;

use super::warn_unroutable;

pub async fn cmd_run(db: &Database, config: SmootherConfig) -> Result<()> {
    println!("🚀 Starting balance smoother...");
    println!("   Database: {}", db.path());
    println!("   Consumer: {}", config.queue.consumer_id);
    println!(
        "   Partitions: {:?} of {}",
        config.queue.claimed_partitions(),
        config.queue.partitions
    );
    println!("   Observation model: {}", config.filter.observation.as_str());
    warn_unroutable(db, config.queue.partitions);
    println!();
    println!("   Press Ctrl-C to stop");

    let source = QueueConsumer::new(db.clone(), config.queue.clone());
    let mut service = SmoothingService::new(
        Box::new(source),
        Box::new(db.clone()),
        Box::new(db.clone()),
        config,
    );

    // The service loop blocks; keep it off the async workers
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let worker = tokio::task::spawn_blocking(move || service.run(&flag));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    println!();
    println!("🛑 Stopping after the current event...");
    shutdown.store(true, Ordering::SeqCst);

    let stats = worker.await.context("Service thread failed")?;
    print_stats(&stats);

    Ok(())
}

pub fn print_stats(stats: &ServiceStats) {
    println!();
    println!("📊 Session summary");
    println!("   Processed:     {}", stats.processed);
    println!("   Rejected:      {}", stats.rejected);
    println!("   Released:      {}", stats.released);
    println!("   Retries:       {}", stats.retries);
    println!("   Resets:        {}", stats.resets);
    println!("   Out of order:  {}", stats.out_of_order);
    if stats.gaps > 0 {
        println!("   ⚠️  Output gaps: {}", stats.gaps);
        println!("      Inspect with: smoother queue list --status gap");
    }
    if stats.source_errors > 0 {
        println!("   ❌ Source errors: {}", stats.source_errors);
    }
}
