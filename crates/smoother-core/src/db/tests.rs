//! Database tests

use super::*;
use crate::filter::Estimate;
use crate::models::*;
use crate::source::EventSource;
use crate::store::StateStore;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use rusqlite::params;
    use std::time::Duration;

    const LEASE: Duration = Duration::from_secs(60);

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, day, 12, 0, 0).unwrap()
    }

    fn sample_state(balance: f64, day: u32) -> FilterState {
        FilterState {
            estimate: Estimate {
                mean: [balance, -1.5],
                covariance: [[50.0, 25.0], [25.0, 400.0]],
            },
            last_update: ts(day),
            observed_balance: balance,
        }
    }

    fn payload(user: &str, day: u32, amount: f64) -> String {
        TransactionEvent {
            user_id: user.to_string(),
            timestamp: ts(day),
            amount,
            direction: Direction::Debit,
        }
        .to_json()
    }

    fn record(user: &str, day: u32, balance: f64) -> SmoothedRecord {
        SmoothedRecord {
            user_id: user.to_string(),
            as_of: ts(day),
            smoothed_balance: balance,
            variance: 12.5,
            created_at: Utc::now(),
        }
    }

    fn status_of(db: &Database, id: i64) -> QueueStatus {
        db.list_queue(None, 100)
            .unwrap()
            .into_iter()
            .find(|e| e.id == id)
            .map(|e| e.status)
            .unwrap()
    }

    #[test]
    fn test_schema_exists() {
        let db = Database::in_memory().unwrap();
        let conn = db.conn().unwrap();

        for table in ["filter_states", "smoothed_balances", "event_queue"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
                    params![table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smoother.db");
        let path = path.to_str().unwrap();

        Database::new_unencrypted(path).unwrap();
        let db = Database::new_unencrypted(path).unwrap();
        assert_eq!(db.count_states().unwrap(), 0);
    }

    #[test]
    fn test_state_roundtrip() {
        let db = Database::in_memory().unwrap();
        assert!(db.get_state("alice").unwrap().is_none());

        let state = sample_state(-120.25, 3);
        assert_eq!(db.put_state("alice", &state, None).unwrap(), 1);

        let stored = db.get_state("alice").unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.state, state);
    }

    #[test]
    fn test_state_version_conflicts() {
        let db = Database::in_memory().unwrap();
        db.put_state("alice", &sample_state(10.0, 1), None).unwrap();

        // A second "first write" loses
        let err = db.put_state("alice", &sample_state(20.0, 2), None).unwrap_err();
        assert!(matches!(err, Error::Conflict { expected: None, .. }));

        assert_eq!(db.put_state("alice", &sample_state(30.0, 2), Some(1)).unwrap(), 2);

        // Stale writer that also read version 1
        let err = db.put_state("alice", &sample_state(40.0, 2), Some(1)).unwrap_err();
        assert!(matches!(err, Error::Conflict { expected: Some(1), .. }));

        let stored = db.get_state("alice").unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.state.observed_balance, 30.0);
    }

    #[test]
    fn test_state_store_trait_keeps_conflicts() {
        let db = Database::in_memory().unwrap();
        let store: &dyn StateStore = &db;

        store.set("bob", &sample_state(1.0, 1), None).unwrap();
        let err = store.set("bob", &sample_state(2.0, 1), Some(7)).unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn test_states_are_per_user() {
        let db = Database::in_memory().unwrap();
        db.put_state("carol", &sample_state(5.0, 1), None).unwrap();
        db.put_state("alice", &sample_state(7.0, 1), None).unwrap();

        let states = db.list_states().unwrap();
        let users: Vec<_> = states.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(users, vec!["alice", "carol"]);
        assert_eq!(db.count_states().unwrap(), 2);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart.db");
        let path = path.to_str().unwrap();
        let state = sample_state(-42.0, 9);

        {
            let db = Database::new_unencrypted(path).unwrap();
            db.put_state("dave", &state, None).unwrap();
            db.append_record(&record("dave", 9, -42.0)).unwrap();
        }

        let db = Database::new_unencrypted(path).unwrap();
        let stored = db.get_state("dave").unwrap().unwrap();
        assert_eq!(stored.state, state);
        assert_eq!(db.count_records(Some("dave")).unwrap(), 1);
    }

    #[test]
    fn test_uncommitted_state_write_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.db");
        let path = path.to_str().unwrap();
        let state = sample_state(100.0, 1);

        {
            let db = Database::new_unencrypted(path).unwrap();
            db.put_state("erin", &state, None).unwrap();
        }

        // A writer that dies halfway through replacing the row
        {
            let conn = rusqlite::Connection::open(path).unwrap();
            conn.execute_batch(
                "BEGIN IMMEDIATE;
                 UPDATE filter_states SET mean_balance = -1.0 WHERE user_id = 'erin';
                 UPDATE filter_states SET cov_00 = -9.0 WHERE user_id = 'erin';",
            )
            .unwrap();
        }

        let db = Database::new_unencrypted(path).unwrap();
        let stored = db.get_state("erin").unwrap().unwrap();
        assert_eq!(stored.state, state);
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_filter_states_cannot_be_deleted() {
        let db = Database::in_memory().unwrap();
        db.put_state("frank", &sample_state(1.0, 1), None).unwrap();

        let conn = db.conn().unwrap();
        let result = conn.execute("DELETE FROM filter_states WHERE user_id = 'frank'", []);
        assert!(result.is_err());
        assert_eq!(db.count_states().unwrap(), 1);
    }

    #[test]
    fn test_records_are_append_only() {
        let db = Database::in_memory().unwrap();
        let id = db.append_record(&record("gina", 1, 10.0)).unwrap();

        let conn = db.conn().unwrap();
        let update = conn.execute(
            "UPDATE smoothed_balances SET smoothed_balance = 0 WHERE id = ?",
            params![id],
        );
        assert!(update.is_err());
        let delete = conn.execute("DELETE FROM smoothed_balances WHERE id = ?", params![id]);
        assert!(delete.is_err());

        let records = db.recent_records("gina", 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].smoothed_balance, 10.0);
    }

    #[test]
    fn test_recent_records_newest_first() {
        let db = Database::in_memory().unwrap();
        db.append_record(&record("hank", 2, 20.0)).unwrap();
        db.append_record(&record("hank", 5, 50.0)).unwrap();
        db.append_record(&record("hank", 1, 10.0)).unwrap();
        db.append_record(&record("ivy", 9, 90.0)).unwrap();

        let records = db.recent_records("hank", 2).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].as_of, ts(5));
        assert_eq!(records[1].as_of, ts(2));

        assert_eq!(db.count_records(Some("hank")).unwrap(), 3);
        assert_eq!(db.count_records(None).unwrap(), 4);
    }

    #[test]
    fn test_record_timestamps_roundtrip() {
        let db = Database::in_memory().unwrap();
        let mut original = record("jack", 3, -7.5);
        original.created_at = Utc.with_ymd_and_hms(2024, 2, 3, 12, 0, 1).unwrap();
        db.append_record(&original).unwrap();

        let records = db.recent_records("jack", 1).unwrap();
        assert_eq!(records[0], original);
    }

    #[test]
    fn test_enqueue_claim_ack() {
        let db = Database::in_memory().unwrap();
        let id = db.enqueue_event(&payload("alice", 1, 10.0), 1).unwrap();

        let delivery = db.claim_event("c1", &[0], LEASE, 10).unwrap().unwrap();
        assert_eq!(delivery.id, id);
        assert_eq!(delivery.attempt, 1);
        assert_eq!(status_of(&db, id), QueueStatus::Leased);

        assert!(db.finish_event(id, "c1", QueueStatus::Done, None).unwrap());
        assert_eq!(status_of(&db, id), QueueStatus::Done);
        assert!(db.claim_event("c1", &[0], LEASE, 10).unwrap().is_none());
    }

    #[test]
    fn test_claims_in_event_time_order() {
        let db = Database::in_memory().unwrap();
        let later = db.enqueue_event(&payload("alice", 8, 1.0), 1).unwrap();
        let earlier = db.enqueue_event(&payload("alice", 2, 1.0), 1).unwrap();

        let first = db.claim_event("c1", &[0], LEASE, 10).unwrap().unwrap();
        assert_eq!(first.id, earlier);
        db.finish_event(first.id, "c1", QueueStatus::Done, None).unwrap();

        let second = db.claim_event("c1", &[0], LEASE, 10).unwrap().unwrap();
        assert_eq!(second.id, later);
    }

    #[test]
    fn test_one_lease_per_user() {
        let db = Database::in_memory().unwrap();
        let a1 = db.enqueue_event(&payload("alice", 1, 1.0), 1).unwrap();
        let _a2 = db.enqueue_event(&payload("alice", 2, 1.0), 1).unwrap();
        let b1 = db.enqueue_event(&payload("bob", 3, 1.0), 1).unwrap();

        let first = db.claim_event("c1", &[0], LEASE, 10).unwrap().unwrap();
        assert_eq!(first.id, a1);

        // alice is busy with c1, so c2 gets bob
        let second = db.claim_event("c2", &[0], LEASE, 10).unwrap().unwrap();
        assert_eq!(second.id, b1);
        assert!(db.claim_event("c2", &[0], LEASE, 10).unwrap().is_none());

        db.finish_event(a1, "c1", QueueStatus::Done, None).unwrap();
        assert!(db.claim_event("c2", &[0], LEASE, 10).unwrap().is_some());
    }

    #[test]
    fn test_expired_lease_is_redelivered() {
        let db = Database::in_memory().unwrap();
        let id = db.enqueue_event(&payload("carol", 1, 1.0), 1).unwrap();

        let first = db.claim_event("crashed", &[0], Duration::ZERO, 10).unwrap().unwrap();
        assert_eq!(first.attempt, 1);

        let second = db.claim_event("c2", &[0], LEASE, 10).unwrap().unwrap();
        assert_eq!(second.id, id);
        assert_eq!(second.attempt, 2);

        // The crashed consumer no longer owns it
        assert!(!db.finish_event(id, "crashed", QueueStatus::Done, None).unwrap());
        assert!(db.finish_event(id, "c2", QueueStatus::Done, None).unwrap());
    }

    #[test]
    fn test_expired_lease_dead_letters_at_max_deliveries() {
        let db = Database::in_memory().unwrap();
        let id = db.enqueue_event(&payload("dave", 1, 1.0), 1).unwrap();

        db.claim_event("c1", &[0], Duration::ZERO, 2).unwrap().unwrap();
        db.claim_event("c1", &[0], Duration::ZERO, 2).unwrap().unwrap();
        assert!(db.claim_event("c1", &[0], LEASE, 2).unwrap().is_none());

        let events = db.list_queue(Some(QueueStatus::Rejected), 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, id);
        assert_eq!(events[0].deliveries, 2);
        assert_eq!(events[0].last_error.as_deref(), Some("exceeded max deliveries"));
    }

    #[test]
    fn test_release_and_max_deliveries() {
        let db = Database::in_memory().unwrap();
        let id = db.enqueue_event(&payload("erin", 1, 1.0), 1).unwrap();

        db.claim_event("c1", &[0], LEASE, 2).unwrap().unwrap();
        assert!(db.release_event(id, "c1", "store down", 2).unwrap());
        assert_eq!(status_of(&db, id), QueueStatus::Pending);

        db.claim_event("c1", &[0], LEASE, 2).unwrap().unwrap();
        assert!(db.release_event(id, "c1", "store down", 2).unwrap());
        assert_eq!(status_of(&db, id), QueueStatus::Rejected);

        // Operator puts it back with a fresh count
        assert!(db.requeue_event(id).unwrap());
        let again = db.claim_event("c1", &[0], LEASE, 2).unwrap().unwrap();
        assert_eq!(again.attempt, 1);
    }

    #[test]
    fn test_requeue_only_rejected() {
        let db = Database::in_memory().unwrap();
        let id = db.enqueue_event(&payload("frank", 1, 1.0), 1).unwrap();
        assert!(!db.requeue_event(id).unwrap());

        db.claim_event("c1", &[0], LEASE, 10).unwrap().unwrap();
        db.finish_event(id, "c1", QueueStatus::Gap, Some("sink down")).unwrap();
        assert!(!db.requeue_event(id).unwrap());
        assert_eq!(status_of(&db, id), QueueStatus::Gap);
    }

    #[test]
    fn test_partition_filtering() {
        let db = Database::in_memory().unwrap();
        let users: Vec<String> = (0..20).map(|i| format!("user-{}", i)).collect();
        for user in &users {
            db.enqueue_event(&payload(user, 1, 1.0), 4).unwrap();
        }

        let mut claimed = Vec::new();
        while let Some(delivery) = db.claim_event("p2", &[2], LEASE, 10).unwrap() {
            let event = TransactionEvent::from_json(&delivery.payload).unwrap();
            assert_eq!(partition_for(&event.user_id, 4), 2);
            db.finish_event(delivery.id, "p2", QueueStatus::Done, None).unwrap();
            claimed.push(event.user_id);
        }

        let expected = users.iter().filter(|u| partition_for(u, 4) == 2).count();
        assert_eq!(claimed.len(), expected);
        assert_eq!(db.queue_stats().unwrap().pending as usize, users.len() - expected);
        assert!(db.claim_event("none", &[], LEASE, 10).unwrap().is_none());
    }

    #[test]
    fn test_unroutable_pending_after_partition_mismatch() {
        let db = Database::in_memory().unwrap();
        let users: Vec<String> = (0..20).map(|i| format!("user-{}", i)).collect();
        for user in &users {
            db.enqueue_event(&payload(user, 1, 1.0), 4).unwrap();
        }
        let stranded = users.iter().filter(|u| partition_for(u, 4) >= 1).count() as i64;
        assert!(stranded > 0);

        assert_eq!(db.count_unroutable_pending(4).unwrap(), 0);
        assert_eq!(db.count_unroutable_pending(1).unwrap(), stranded);

        // A single-partition consumer drains partition 0 and nothing else
        while let Some(delivery) = db.claim_event("solo", &[0], LEASE, 10).unwrap() {
            db.finish_event(delivery.id, "solo", QueueStatus::Done, None).unwrap();
        }
        assert_eq!(db.queue_stats().unwrap().pending, stranded);
        assert_eq!(db.count_unroutable_pending(1).unwrap(), stranded);
    }

    #[test]
    fn test_malformed_payload_is_queued() {
        let db = Database::in_memory().unwrap();
        let id = db.enqueue_event("{not json", 8).unwrap();

        let queued = db.list_queue(None, 10).unwrap();
        assert_eq!(queued[0].id, id);
        assert_eq!(queued[0].user_id, None);
        assert_eq!(queued[0].partition, 0);

        let delivery = db.claim_event("c1", &[0], LEASE, 10).unwrap().unwrap();
        assert_eq!(delivery.payload, "{not json");
    }

    #[test]
    fn test_queue_stats() {
        let db = Database::in_memory().unwrap();
        for day in 1..=4 {
            db.enqueue_event(&payload(&format!("u{}", day), day, 1.0), 1).unwrap();
        }

        let a = db.claim_event("c1", &[0], LEASE, 10).unwrap().unwrap();
        db.finish_event(a.id, "c1", QueueStatus::Done, None).unwrap();
        let b = db.claim_event("c1", &[0], LEASE, 10).unwrap().unwrap();
        db.finish_event(b.id, "c1", QueueStatus::Rejected, Some("bad")).unwrap();
        db.claim_event("c1", &[0], LEASE, 10).unwrap().unwrap();

        let stats = db.queue_stats().unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending: 1,
                leased: 1,
                done: 1,
                rejected: 1,
                gap: 0,
            }
        );
    }

    #[test]
    fn test_queue_consumer_source() {
        let db = Database::in_memory().unwrap();
        let config = crate::config::QueueConfig {
            poll_timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(5),
            consumer_id: "worker-1".to_string(),
            ..Default::default()
        };
        let consumer = QueueConsumer::new(db.clone(), config);
        assert_eq!(consumer.partitions(), &[0]);

        assert!(consumer.next(Duration::from_millis(20)).unwrap().is_none());

        let id = db.enqueue_event(&payload("gina", 1, 3.0), 1).unwrap();
        let delivery = consumer.next(Duration::from_millis(20)).unwrap().unwrap();
        assert_eq!(delivery.id, id);

        consumer.ack(&delivery).unwrap();
        assert_eq!(status_of(&db, id), QueueStatus::Done);
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let key1 = derive_key("my-secret").unwrap();
        let key2 = derive_key("my-secret").unwrap();
        assert_eq!(key1, key2);

        let key3 = derive_key("other-secret").unwrap();
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_encrypted_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encrypted.db");
        let path = path.to_str().unwrap();

        {
            let db = Database::new_with_key(path, Some("test-passphrase")).unwrap();
            db.put_state("alice", &sample_state(1.0, 1), None).unwrap();
        }

        {
            let db = Database::new_with_key(path, Some("test-passphrase")).unwrap();
            assert_eq!(db.count_states().unwrap(), 1);
        }

        assert!(
            Database::new_unencrypted(path).is_err(),
            "Should fail to open encrypted db without key"
        );
        assert!(
            Database::new_with_key(path, Some("wrong-passphrase")).is_err(),
            "Should fail to open encrypted db with wrong key"
        );
    }
}
