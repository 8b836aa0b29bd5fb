//! Smoother Core Library
//!
//! Per-user balance smoothing over a stream of transaction events:
//! - Constant-velocity Kalman filter engine
//! - Durable filter state with versioned writes
//! - Append-only smoothed balance log
//! - Partitioned, leased SQLite event queue
//! - The service loop tying them together

pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod models;
pub mod service;
pub mod sink;
pub mod source;
pub mod store;

pub use config::{FilterConfig, ObservationModel, QueueConfig, RetryConfig, SmootherConfig};
pub use db::{partition_for, Database, QueueConsumer};
pub use error::{Error, Result};
pub use filter::{Estimate, NoiseModel};
pub use models::{
    Direction, FilterState, QueueStats, QueueStatus, QueuedEvent, SmoothedRecord,
    TransactionEvent,
};
pub use service::{compute, Outcome, Phase, ServiceStats, SmoothingService, Transition};
pub use sink::OutputSink;
pub use source::{ChannelSource, Delivery, DeliveryGuarantee, EventSource};
pub use store::{StateStore, StoredState};
