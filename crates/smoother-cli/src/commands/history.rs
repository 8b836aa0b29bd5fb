//! Smoothed balance history and filter state commands

use anyhow::{Context, Result};
use smoother_core::{Database, StoredState};

pub fn cmd_history(db: &Database, user: &str, limit: usize, json: bool) -> Result<()> {
    let records = db
        .recent_records(user, limit)
        .context("Failed to read smoothed balances")?;

    if json {
        for record in &records {
            println!("{}", serde_json::to_string(record)?);
        }
        return Ok(());
    }

    if records.is_empty() {
        println!("No smoothed balances for {}.", user);
        return Ok(());
    }

    println!();
    println!("📈 Smoothed balance for {} (newest first)", user);
    println!("   ─────────────────────────────────────────────────────────────");
    println!("   {:<27} {:>14} {:>12}", "As of", "Balance", "± Std dev");

    for record in &records {
        println!(
            "   {:<27} {:>14.2} {:>12.2}",
            record.as_of.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            record.smoothed_balance,
            record.variance.max(0.0).sqrt()
        );
    }
    println!();

    Ok(())
}

pub fn cmd_state(db: &Database, user: Option<&str>, json: bool) -> Result<()> {
    match user {
        Some(user) => {
            let stored = db
                .get_state(user)
                .context("Failed to read filter state")?
                .with_context(|| format!("No filter state for user: {}", user))?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&stored.state.to_document())?
                );
            } else {
                print_state(user, &stored);
            }
        }
        None => {
            let states = db.list_states().context("Failed to read filter state")?;

            if json {
                for (user, stored) in &states {
                    let line = serde_json::json!({
                        "user_id": user,
                        "version": stored.version,
                        "state": stored.state.to_document(),
                    });
                    println!("{}", line);
                }
                return Ok(());
            }

            if states.is_empty() {
                println!("No filter state yet. Start the service with: smoother run");
                return Ok(());
            }

            println!();
            println!("👥 Users ({})", states.len());
            println!("   ─────────────────────────────────────────────────────────────");
            println!(
                "   {:<20} {:>14} {:>12} {:>10}  {}",
                "User", "Balance", "Drift/day", "± Std dev", "Last update"
            );
            for (user, stored) in &states {
                let estimate = &stored.state.estimate;
                println!(
                    "   {:<20} {:>14.2} {:>12.2} {:>10.2}  {}",
                    super::truncate(user, 20),
                    estimate.balance(),
                    estimate.velocity(),
                    estimate.variance().max(0.0).sqrt(),
                    stored.state.last_update.format("%Y-%m-%d %H:%M")
                );
            }
            println!();
        }
    }

    Ok(())
}

fn print_state(user: &str, stored: &StoredState) {
    let state = &stored.state;
    let [[p00, p01], [p10, p11]] = state.covariance();

    println!();
    println!("🧮 Filter state for {}", user);
    println!("   ─────────────────────────────────────────");
    println!("   Smoothed balance:  {:.2}", state.estimate.balance());
    println!("   Drift per day:     {:.4}", state.estimate.velocity());
    println!("   Observed balance:  {:.2}", state.observed_balance);
    println!("   Covariance:        [[{:.4}, {:.4}],", p00, p01);
    println!("                       [{:.4}, {:.4}]]", p10, p11);
    println!("   Last update:       {}", state.last_update.to_rfc3339());
    println!("   Version:           {}", stored.version);

    if let Some(reason) = state.estimate.degeneracy(1e-6) {
        println!("   ⚠️  Degenerate: {} (reset on next event)", reason);
    }
    println!();
}
