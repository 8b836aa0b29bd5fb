//! Durable, partitioned event queue
//!
//! Delivery contract:
//! - At-least-once. A claimed event is leased to one consumer; if the lease
//!   expires without an ack (crash, hang) the event becomes pending again.
//! - Events are partitioned by a stable hash of `user_id`. A consumer only
//!   claims from the partitions it owns.
//! - Per-user exclusion and ordering. An event is never claimed while another
//!   event of the same user is leased, and a user's pending events are
//!   claimed in event-time order.
//! - Events redelivered `max_deliveries` times are dead-lettered.

use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::Database;
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::models::{format_timestamp, QueueStats, QueueStatus, QueuedEvent, TransactionEvent};
use crate::source::{Delivery, DeliveryGuarantee, EventSource};

/// Stable partition for a user: SHA-256 of the id, first 8 bytes, modulo `partitions`
pub fn partition_for(user_id: &str, partitions: u32) -> u32 {
    let digest = Sha256::digest(user_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions.max(1))) as u32
}

fn partition_list(partitions: &[u32]) -> String {
    partitions
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Database {
    /// Add a raw payload to the queue.
    ///
    /// The partition is fixed here from `partitions`, so consumers must run
    /// with the same count; see [`count_unroutable_pending`](Self::count_unroutable_pending).
    /// Payloads that don't parse are still stored (without user or partition
    /// information) so they are dead-lettered visibly on delivery.
    pub fn enqueue_event(&self, payload: &str, partitions: u32) -> Result<i64> {
        let (user_id, partition, event_ts) = match TransactionEvent::from_json(payload) {
            Ok(event) => {
                let partition = partition_for(&event.user_id, partitions);
                (
                    Some(event.user_id),
                    partition,
                    Some(format_timestamp(&event.timestamp)),
                )
            }
            Err(e) => {
                warn!("Enqueueing malformed payload, it will be rejected: {}", e);
                (None, 0, None)
            }
        };

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO event_queue (user_id, partition_key, event_ts, payload) VALUES (?, ?, ?, ?)",
            params![user_id, partition, event_ts, payload],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Lease the next claimable event from `partitions` to `consumer_id`
    pub fn claim_event(
        &self,
        consumer_id: &str,
        partitions: &[u32],
        lease: Duration,
        max_deliveries: u32,
    ) -> Result<Option<Delivery>> {
        if partitions.is_empty() {
            return Ok(None);
        }

        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::Config(format!("Lease duration out of range: {}", e)))?;
        let now = Utc::now();
        let now_str = format_timestamp(&now);

        let mut conn = self.conn()?;
        // IMMEDIATE takes the write lock up front so two consumers can't pick the same row
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let dead = tx.execute(
            "UPDATE event_queue
             SET status = 'rejected', last_error = 'exceeded max deliveries',
                 lease_owner = NULL, lease_expires_at = NULL, completed_at = CURRENT_TIMESTAMP
             WHERE status = 'leased' AND lease_expires_at <= ? AND deliveries >= ?",
            params![now_str, max_deliveries],
        )?;
        if dead > 0 {
            warn!("Dead-lettered {} event(s) after {} deliveries", dead, max_deliveries);
        }

        let expired = tx.execute(
            "UPDATE event_queue
             SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL,
                 last_error = COALESCE(last_error, 'lease expired')
             WHERE status = 'leased' AND lease_expires_at <= ?",
            params![now_str],
        )?;
        if expired > 0 {
            warn!("Returned {} event(s) with expired leases to the queue", expired);
        }

        let candidate: Option<(i64, String, u32)> = tx
            .query_row(
                &format!(
                    "SELECT q.id, q.payload, q.deliveries
                     FROM event_queue q
                     WHERE q.status = 'pending'
                       AND q.partition_key IN ({})
                       AND (q.user_id IS NULL OR NOT EXISTS (
                           SELECT 1 FROM event_queue l
                           WHERE l.user_id = q.user_id AND l.status = 'leased'))
                     ORDER BY q.event_ts, q.id
                     LIMIT 1",
                    partition_list(partitions)
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((id, payload, deliveries)) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE event_queue
             SET status = 'leased', lease_owner = ?, lease_expires_at = ?, deliveries = deliveries + 1
             WHERE id = ?",
            params![consumer_id, format_timestamp(&(now + lease)), id],
        )?;
        tx.commit()?;

        debug!(event_id = id, consumer = consumer_id, "Claimed event");

        Ok(Some(Delivery {
            id,
            payload,
            attempt: deliveries + 1,
        }))
    }

    /// Close out a leased event. Returns false if the lease was no longer ours.
    pub fn finish_event(
        &self,
        id: i64,
        consumer_id: &str,
        status: QueueStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE event_queue
             SET status = ?, last_error = COALESCE(?, last_error),
                 lease_owner = NULL, lease_expires_at = NULL, completed_at = CURRENT_TIMESTAMP
             WHERE id = ? AND status = 'leased' AND lease_owner = ?",
            params![status.as_str(), error, id, consumer_id],
        )?;
        Ok(updated == 1)
    }

    /// Give a leased event back for redelivery, or dead-letter it once it has
    /// been delivered `max_deliveries` times.
    pub fn release_event(
        &self,
        id: i64,
        consumer_id: &str,
        reason: &str,
        max_deliveries: u32,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE event_queue
             SET status = CASE WHEN deliveries >= ? THEN 'rejected' ELSE 'pending' END,
                 last_error = ?, lease_owner = NULL, lease_expires_at = NULL
             WHERE id = ? AND status = 'leased' AND lease_owner = ?",
            params![max_deliveries, reason, id, consumer_id],
        )?;
        Ok(updated == 1)
    }

    /// Put a dead-lettered event back in the queue with a fresh delivery count.
    ///
    /// Gap events are not requeued: their state change is already applied.
    pub fn requeue_event(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE event_queue
             SET status = 'pending', deliveries = 0, completed_at = NULL
             WHERE id = ? AND status = 'rejected'",
            params![id],
        )?;
        Ok(updated == 1)
    }

    /// Pending events whose partition is outside `0..partitions`. No consumer
    /// configured with that count will ever claim them.
    pub fn count_unroutable_pending(&self, partitions: u32) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM event_queue WHERE status = 'pending' AND partition_key >= ?",
            params![partitions],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Event counts per status
    pub fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM event_queue GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.parse::<QueueStatus>() {
                Ok(QueueStatus::Pending) => stats.pending = count,
                Ok(QueueStatus::Leased) => stats.leased = count,
                Ok(QueueStatus::Done) => stats.done = count,
                Ok(QueueStatus::Rejected) => stats.rejected = count,
                Ok(QueueStatus::Gap) => stats.gap = count,
                Err(e) => warn!("{}", e),
            }
        }
        Ok(stats)
    }

    /// Queue entries, optionally filtered by status, oldest first
    pub fn list_queue(&self, status: Option<QueueStatus>, limit: usize) -> Result<Vec<QueuedEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, partition_key, payload, status, deliveries, last_error, enqueued_at
             FROM event_queue
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY id
             LIMIT ?2",
        )?;

        let events = stmt
            .query_map(params![status.map(|s| s.as_str()), limit as i64], |row| {
                let status: String = row.get(4)?;
                Ok(QueuedEvent {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    partition: row.get(2)?,
                    payload: row.get(3)?,
                    status: status.parse().unwrap_or(QueueStatus::Pending),
                    deliveries: row.get(5)?,
                    last_error: row.get(6)?,
                    enqueued_at: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

/// One consumer of the SQLite queue
pub struct QueueConsumer {
    db: Database,
    config: QueueConfig,
    partitions: Vec<u32>,
}

impl QueueConsumer {
    pub fn new(db: Database, config: QueueConfig) -> Self {
        let partitions = config.claimed_partitions();
        Self {
            db,
            config,
            partitions,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.config.consumer_id
    }

    pub fn partitions(&self) -> &[u32] {
        &self.partitions
    }

    fn finish(&self, delivery: &Delivery, status: QueueStatus, reason: Option<&str>) -> Result<()> {
        if !self
            .db
            .finish_event(delivery.id, &self.config.consumer_id, status, reason)?
        {
            warn!(
                event_id = delivery.id,
                "Lease lost before marking event {}; it may be delivered again", status
            );
        }
        Ok(())
    }
}

impl EventSource for QueueConsumer {
    fn next(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            let claimed = self
                .db
                .claim_event(
                    &self.config.consumer_id,
                    &self.partitions,
                    self.config.lease,
                    self.config.max_deliveries,
                )
                .map_err(|e| Error::Source(e.to_string()))?;

            if claimed.is_some() {
                return Ok(claimed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.finish(delivery, QueueStatus::Done, None)
    }

    fn release(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        if !self.db.release_event(
            delivery.id,
            &self.config.consumer_id,
            reason,
            self.config.max_deliveries,
        )? {
            warn!(event_id = delivery.id, "Lease lost before release");
        }
        Ok(())
    }

    fn reject(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        self.finish(delivery, QueueStatus::Rejected, Some(reason))
    }

    fn record_gap(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        self.finish(delivery, QueueStatus::Gap, Some(reason))
    }

    fn guarantee(&self) -> DeliveryGuarantee {
        DeliveryGuarantee::AtLeastOnce
    }
}
