//! Event source adapters
//!
//! The service loop pulls raw payloads through [`EventSource`] and reports
//! the outcome of each delivery back to it. What happens to an event that is
//! released without acknowledgement depends on the adapter and is declared by
//! [`EventSource::guarantee`]:
//!
//! - the SQLite queue ([`crate::db::QueueConsumer`]) is at-least-once:
//!   released or lease-expired events are delivered again
//! - [`ChannelSource`] is at-most-once: released events are gone

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// One delivery of a queued payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Adapter-specific handle used to acknowledge this delivery
    pub id: i64,
    pub payload: String,
    /// 1 for the first delivery, higher when redelivered
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryGuarantee {
    AtLeastOnce,
    AtMostOnce,
}

pub trait EventSource: Send {
    /// Block for at most `timeout` waiting for the next payload
    fn next(&self, timeout: Duration) -> Result<Option<Delivery>>;

    /// The event was fully applied and recorded
    fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// The event was not applied; make it available again (if the adapter can)
    fn release(&self, delivery: &Delivery, reason: &str) -> Result<()>;

    /// The event can never be applied; dead-letter it
    fn reject(&self, delivery: &Delivery, reason: &str) -> Result<()>;

    /// The event was applied to state but its output record is missing
    fn record_gap(&self, delivery: &Delivery, reason: &str) -> Result<()>;

    fn guarantee(&self) -> DeliveryGuarantee;
}

/// In-process source fed through an `mpsc` channel (at-most-once)
pub struct ChannelSource {
    rx: Receiver<String>,
    next_id: AtomicI64,
}

impl ChannelSource {
    pub fn new(rx: Receiver<String>) -> Self {
        Self {
            rx,
            next_id: AtomicI64::new(1),
        }
    }
}

impl EventSource for ChannelSource {
    fn next(&self, timeout: Duration) -> Result<Option<Delivery>> {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => Ok(Some(Delivery {
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                payload,
                attempt: 1,
            })),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Source("event channel disconnected".to_string()))
            }
        }
    }

    fn ack(&self, _delivery: &Delivery) -> Result<()> {
        Ok(())
    }

    fn release(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        warn!(
            delivery_id = delivery.id,
            "Dropping event from at-most-once channel source: {}", reason
        );
        Ok(())
    }

    fn reject(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        warn!(delivery_id = delivery.id, "Discarding event: {}", reason);
        Ok(())
    }

    fn record_gap(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        warn!(
            delivery_id = delivery.id,
            payload = %delivery.payload,
            "Output gap (not recorded by channel source): {}", reason
        );
        Ok(())
    }

    fn guarantee(&self) -> DeliveryGuarantee {
        DeliveryGuarantee::AtMostOnce
    }
}
