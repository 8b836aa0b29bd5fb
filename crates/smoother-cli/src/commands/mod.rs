//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `core` - Init and shared utilities (open_db, load_config)
//! - `enqueue` - Queue producer commands (single event, JSON-lines file)
//! - `history` - Smoothed balance history and filter state inspection
//! - `queue` - Queue administration (list, requeue)
//! - `run` - The long-running smoothing service
//! - `status` - Database, queue and configuration status

pub mod core;
pub mod enqueue;
pub mod history;
pub mod queue;
pub mod run;
pub mod status;

// Re-export command functions for main.rs
pub use core::*;
pub use enqueue::*;
pub use history::*;
pub use queue::*;
pub use run::*;
pub use status::*;

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
