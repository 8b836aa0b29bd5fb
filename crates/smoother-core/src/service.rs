//! The smoothing service loop
//!
//! One sequential consumer:
//!
//! ```text
//! IDLE → LOADING → COMPUTING → PERSISTING → EMITTING → ACK → IDLE
//! ```
//!
//! Failure handling per phase:
//! - malformed payload: dead-lettered, state untouched
//! - LOADING / PERSISTING: transient store errors and version conflicts are
//!   retried from LOADING with exponential backoff; when attempts run out the
//!   event is released unacknowledged (redelivered or lost, depending on the
//!   source's [`DeliveryGuarantee`](crate::source::DeliveryGuarantee))
//! - EMITTING: the state is already persisted, so the event is closed as a
//!   *gap* instead of being retried (retrying would apply it twice)
//! - degenerate covariance: the user is reset to the diffuse prior; an event
//!   that stays degenerate after the reset is dead-lettered, state untouched
//!
//! The loop itself never exits on a per-event failure; only the shutdown flag
//! stops it, and only between events.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{FilterConfig, ObservationModel, SmootherConfig};
use crate::error::{Error, Result};
use crate::filter::{self, Estimate};
use crate::models::{FilterState, SmoothedRecord, TransactionEvent};
use crate::sink::OutputSink;
use crate::source::{Delivery, EventSource};
use crate::store::StateStore;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Loading,
    Computing,
    Persisting,
    Emitting,
    Ack,
}

/// Counters since the service started
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// Applied, recorded and acknowledged
    pub processed: u64,
    /// Malformed or numerically unusable events dead-lettered
    pub rejected: u64,
    /// Released unacknowledged after store failures
    pub released: u64,
    /// Applied to state with the output record missing
    pub gaps: u64,
    /// Users reset to the diffuse prior
    pub resets: u64,
    /// Events older than the user's last update
    pub out_of_order: u64,
    /// Store retries
    pub retries: u64,
    /// Failed pulls from the event source
    pub source_errors: u64,
}

/// What happened to one poll of the source
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing arrived before the timeout
    Idle,
    Applied(SmoothedRecord),
    Rejected(String),
    Released(String),
    Gap(SmoothedRecord),
    SourceError(String),
}

/// Result of folding one event into a user's state
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: FilterState,
    /// Elapsed time actually used, after the floor
    pub dt_days: f64,
    /// The event is older than the state's last update
    pub out_of_order: bool,
    /// Why the user was reset to the diffuse prior, if they were
    pub reset: Option<String>,
    /// The running balance overflowed and restarted from this event's amount
    pub balance_restarted: bool,
}

/// Fold `event` into `previous` (or a fresh diffuse prior). Pure.
///
/// A degenerate prior or posterior resets the user to the diffuse prior. If
/// the estimate is still degenerate after the reset, nothing usable can be
/// produced and [`Error::NumericalDegeneracy`] is returned.
pub fn compute(
    config: &FilterConfig,
    previous: Option<&FilterState>,
    event: &TransactionEvent,
) -> Result<Transition> {
    let tolerance = config.degeneracy_tolerance;
    let diffuse = Estimate::diffuse(config.prior_variance);
    let mut reset = None;

    let prior = match previous {
        Some(state) => match state.estimate.check(tolerance) {
            Ok(()) => state.estimate,
            Err(e) => {
                reset = Some(format!("{} in stored state", e));
                diffuse
            }
        },
        None => diffuse,
    };

    let last_update = previous.map(|s| s.last_update);
    let (dt_days, out_of_order) = elapsed_days(last_update, event.timestamp, config.min_dt_days);

    let previous_balance = previous
        .map(|s| s.observed_balance)
        .filter(|b| b.is_finite())
        .unwrap_or(0.0);
    let signed = event.signed_amount();
    let mut observed_balance = previous_balance + signed;
    let balance_restarted = !observed_balance.is_finite();
    if balance_restarted {
        observed_balance = signed;
    }

    let z = match config.observation {
        ObservationModel::Amount => signed,
        ObservationModel::Balance => observed_balance,
    };

    let mut estimate = filter::step(&prior, z, dt_days, event.amount, &config.noise);
    if let Err(e) = estimate.check(tolerance) {
        reset = Some(format!("{} after update", e));
        estimate = filter::step(&diffuse, z, dt_days, event.amount, &config.noise);
        if let Some(reason) = estimate.degeneracy(tolerance) {
            return Err(Error::NumericalDegeneracy(format!(
                "{} after reset to the diffuse prior",
                reason
            )));
        }
    }

    let last_update = match last_update {
        Some(prev) if prev > event.timestamp => prev,
        _ => event.timestamp,
    };

    Ok(Transition {
        state: FilterState {
            estimate,
            last_update,
            observed_balance,
        },
        dt_days,
        out_of_order,
        reset,
        balance_restarted,
    })
}

/// Days between `previous` and `current`, floored at `min_days`, and whether
/// `current` is earlier than `previous`.
fn elapsed_days(previous: Option<DateTime<Utc>>, current: DateTime<Utc>, min_days: f64) -> (f64, bool) {
    match previous {
        Some(prev) => {
            let raw = (current - prev).num_milliseconds() as f64 / MILLIS_PER_DAY;
            (raw.max(min_days), current < prev)
        }
        None => (min_days, false),
    }
}

/// The balance smoothing consumer
pub struct SmoothingService {
    source: Box<dyn EventSource>,
    store: Box<dyn StateStore>,
    sink: Box<dyn OutputSink>,
    config: SmootherConfig,
    stats: ServiceStats,
    phase: Phase,
}

impl SmoothingService {
    pub fn new(
        source: Box<dyn EventSource>,
        store: Box<dyn StateStore>,
        sink: Box<dyn OutputSink>,
        config: SmootherConfig,
    ) -> Self {
        Self {
            source,
            store,
            sink,
            config,
            stats: ServiceStats::default(),
            phase: Phase::Idle,
        }
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Poll until `shutdown` is set. The flag is checked between events, so
    /// shutdown waits for at most one poll timeout plus one event.
    pub fn run(&mut self, shutdown: &AtomicBool) -> ServiceStats {
        info!(
            "Smoothing service started ({:?} delivery, poll timeout {:?})",
            self.source.guarantee(),
            self.config.queue.poll_timeout
        );

        while !shutdown.load(Ordering::SeqCst) {
            if catch_unwind(AssertUnwindSafe(|| self.poll_once())).is_err() {
                error!("Panic while handling an event in phase {:?}; continuing", self.phase);
                self.phase = Phase::Idle;
            }
        }

        info!("Smoothing service stopped: {:?}", self.stats);
        self.stats.clone()
    }

    /// One pass through the state machine
    pub fn poll_once(&mut self) -> Outcome {
        self.phase = Phase::Idle;

        let delivery = match self.source.next(self.config.queue.poll_timeout) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return Outcome::Idle,
            Err(e) => {
                self.stats.source_errors += 1;
                error!("Event source failed: {}", e);
                std::thread::sleep(self.config.retry.initial_backoff);
                return Outcome::SourceError(e.to_string());
            }
        };

        let outcome = self.handle(&delivery);
        self.phase = Phase::Idle;
        outcome
    }

    fn handle(&mut self, delivery: &Delivery) -> Outcome {
        let event = match TransactionEvent::from_json(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(event_id = delivery.id, "Skipping event: {}", e);
                self.stats.rejected += 1;
                if let Err(err) = self.source.reject(delivery, &e.to_string()) {
                    error!(event_id = delivery.id, "Failed to dead-letter event: {}", err);
                }
                return Outcome::Rejected(e.to_string());
            }
        };

        let max_attempts = self.config.retry.max_attempts;
        let mut attempt = 1;
        let transition = loop {
            match self.apply(&event) {
                Ok(transition) => break transition,
                Err(e @ Error::NumericalDegeneracy(_)) => {
                    error!(
                        user_id = %event.user_id,
                        event_id = delivery.id,
                        "Dead-lettering event, no finite estimate: {}", e
                    );
                    self.stats.rejected += 1;
                    if let Err(err) = self.source.reject(delivery, &e.to_string()) {
                        error!(event_id = delivery.id, "Failed to dead-letter event: {}", err);
                    }
                    return Outcome::Rejected(e.to_string());
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.config.retry.backoff(attempt);
                    warn!(
                        user_id = %event.user_id,
                        event_id = delivery.id,
                        attempt,
                        "Retrying in {:?}: {}", delay, e
                    );
                    self.stats.retries += 1;
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        user_id = %event.user_id,
                        event_id = delivery.id,
                        attempt,
                        "Giving up on event, leaving it unacknowledged: {}", e
                    );
                    self.stats.released += 1;
                    if let Err(err) = self.source.release(delivery, &e.to_string()) {
                        error!(event_id = delivery.id, "Failed to release event: {}", err);
                    }
                    return Outcome::Released(e.to_string());
                }
            }
        };

        if transition.out_of_order {
            self.stats.out_of_order += 1;
        }
        if transition.reset.is_some() {
            self.stats.resets += 1;
        }

        self.phase = Phase::Emitting;
        let estimate = transition.state.estimate;
        let record = SmoothedRecord {
            user_id: event.user_id.clone(),
            as_of: event.timestamp,
            smoothed_balance: estimate.balance(),
            variance: estimate.variance(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.sink.append(&record) {
            error!(
                user_id = %record.user_id,
                event_id = delivery.id,
                as_of = %record.as_of,
                smoothed_balance = record.smoothed_balance,
                variance = record.variance,
                "Filter state persisted but smoothed record was not written: {}", e
            );
            self.stats.gaps += 1;
            if let Err(err) = self.source.record_gap(delivery, &e.to_string()) {
                error!(event_id = delivery.id, "Failed to record output gap: {}", err);
            }
            return Outcome::Gap(record);
        }

        self.phase = Phase::Ack;
        if let Err(e) = self.source.ack(delivery) {
            error!(
                event_id = delivery.id,
                "Failed to acknowledge event, it may be applied again: {}", e
            );
        }
        self.stats.processed += 1;

        debug!(
            user_id = %record.user_id,
            smoothed_balance = record.smoothed_balance,
            variance = record.variance,
            dt_days = transition.dt_days,
            "Processed event"
        );

        Outcome::Applied(record)
    }

    /// LOADING → COMPUTING → PERSISTING for one event
    fn apply(&mut self, event: &TransactionEvent) -> Result<Transition> {
        self.phase = Phase::Loading;
        let stored = self.store.get(&event.user_id)?;

        self.phase = Phase::Computing;
        let transition = compute(
            &self.config.filter,
            stored.as_ref().map(|s| &s.state),
            event,
        )?;

        if transition.out_of_order {
            if let Some(stored) = &stored {
                warn!(
                    user_id = %event.user_id,
                    event_ts = %event.timestamp,
                    last_update = %stored.state.last_update,
                    "Out-of-order event; elapsed time clamped to {} day(s)",
                    transition.dt_days
                );
            }
        }
        if transition.balance_restarted {
            warn!(
                user_id = %event.user_id,
                amount = event.amount,
                "Running balance overflowed; restarting it from this event"
            );
        }
        if let Some(reason) = &transition.reset {
            warn!(
                user_id = %event.user_id,
                "Resetting filter to diffuse prior: {}", reason
            );
        }

        self.phase = Phase::Persisting;
        self.store.set(
            &event.user_id,
            &transition.state,
            stored.map(|s| s.version),
        )?;

        Ok(transition)
    }
}
