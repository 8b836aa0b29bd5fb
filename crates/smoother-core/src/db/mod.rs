//! SQLite persistence with connection pooling and migrations
//!
//! One database file holds everything the smoother needs to survive a restart:
//! - `state` - per-user filter state (the [`StateStore`](crate::StateStore))
//! - `records` - append-only smoothed balance log (the [`OutputSink`](crate::OutputSink))
//! - `queue` - partitioned, leased event queue (the durable [`EventSource`](crate::EventSource))
//!
//! Several consumer processes may share the file; SQLite's busy timeout
//! absorbs short write contention and WAL mode keeps readers unblocked.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

use crate::error::{Error, Result};

mod queue;
mod records;
mod state;

pub use queue::{partition_for, QueueConsumer};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Environment variable for database encryption key
pub const DB_KEY_ENV: &str = "SMOOTHER_DB_KEY";

/// How long a connection waits on a locked database before failing
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Derive an encryption key from a passphrase using Argon2
///
/// Uses a fixed application salt so the same passphrase always produces the same key,
/// regardless of database path.
fn derive_key(passphrase: &str) -> Result<String> {
    use argon2::{password_hash::SaltString, Argon2, PasswordHasher};

    // Changing this invalidates every existing encrypted database
    const APP_SALT: &[u8; 16] = b"smoother-salt-v1";

    let salt = SaltString::encode_b64(APP_SALT)
        .map_err(|e| Error::Encryption(format!("Failed to create salt: {}", e)))?;

    let hash = Argon2::default()
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| Error::Encryption(format!("Failed to derive key: {}", e)))?;

    let output = hash
        .hash
        .ok_or_else(|| Error::Encryption("No hash output".to_string()))?;
    Ok(hex::encode(output.as_bytes()))
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    db_path: String,
}

impl Database {
    /// Open (or create) an encrypted database
    ///
    /// Requires `SMOOTHER_DB_KEY` to be set. Use `new_unencrypted()` for
    /// development and tests.
    pub fn new(path: &str) -> Result<Self> {
        match std::env::var(DB_KEY_ENV).ok() {
            Some(key) => Self::new_with_key(path, Some(&key)),
            None => Err(Error::Encryption(format!(
                "Database encryption required. Set {} environment variable with your passphrase, \
                or use --no-encrypt for unencrypted databases (not recommended for production).",
                DB_KEY_ENV
            ))),
        }
    }

    /// Open (or create) an unencrypted database
    pub fn new_unencrypted(path: &str) -> Result<Self> {
        Self::new_with_key(path, None)
    }

    /// Open with an explicit encryption passphrase
    pub fn new_with_key(path: &str, passphrase: Option<&str>) -> Result<Self> {
        let key_pragma = passphrase
            .map(derive_key)
            .transpose()?
            .map(|key| format!("PRAGMA key = 'x\"{}\"';", key));

        // Runs on every new pooled connection; the key must come first
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            if let Some(pragma) = &key_pragma {
                conn.execute_batch(pragma)?;
            }
            conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS as u64))?;
            Ok(())
        });

        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self {
            pool,
            db_path: path.to_string(),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a throwaway database (for testing)
    ///
    /// Uses a temporary file rather than `:memory:` so every pooled
    /// connection sees the same data.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "smoother_test_{}_{}.db",
            std::process::id(),
            id
        ));
        let path = path.to_string_lossy().to_string();

        let _ = std::fs::remove_file(&path);

        Self::new_unencrypted(&path)
    }

    /// Check if the database is encrypted
    pub fn is_encrypted(&self) -> Result<bool> {
        let conn = self.conn()?;
        // SQLCipher sets cipher_version if encryption is active
        let result: rusqlite::Result<String> =
            conn.query_row("PRAGMA cipher_version;", [], |row| row.get(0));
        Ok(result.is_ok() && std::env::var(DB_KEY_ENV).is_ok())
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- WAL mode: readers don't block the single writer
            PRAGMA journal_mode = WAL;

            -- FULL: a committed state update survives power loss
            PRAGMA synchronous = FULL;

            -- Per-user Kalman filter state. One row per user, never deleted.
            -- All columns of a user are written by one statement, so a crash
            -- leaves either the old or the new state.
            CREATE TABLE IF NOT EXISTS filter_states (
                user_id TEXT PRIMARY KEY,
                mean_balance REAL NOT NULL,
                mean_velocity REAL NOT NULL,
                cov_00 REAL NOT NULL,
                cov_01 REAL NOT NULL,
                cov_10 REAL NOT NULL,
                cov_11 REAL NOT NULL,
                observed_balance REAL NOT NULL DEFAULT 0,
                last_update TEXT NOT NULL,              -- newest event time folded in
                version INTEGER NOT NULL DEFAULT 1,     -- compare-and-swap guard
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TRIGGER IF NOT EXISTS filter_states_no_delete
            BEFORE DELETE ON filter_states
            BEGIN
                SELECT RAISE(ABORT, 'filter_states rows are never deleted');
            END;

            -- Smoothed balance log (audit trail for risk and forecast consumers)
            CREATE TABLE IF NOT EXISTS smoothed_balances (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                as_of TEXT NOT NULL,                    -- observation time
                smoothed_balance REAL NOT NULL,
                variance REAL NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_smoothed_user_as_of ON smoothed_balances(user_id, as_of);

            CREATE TRIGGER IF NOT EXISTS smoothed_balances_no_update
            BEFORE UPDATE ON smoothed_balances
            BEGIN
                SELECT RAISE(ABORT, 'smoothed_balances is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS smoothed_balances_no_delete
            BEFORE DELETE ON smoothed_balances
            BEGIN
                SELECT RAISE(ABORT, 'smoothed_balances is append-only');
            END;

            -- Transaction event queue, partitioned by user
            CREATE TABLE IF NOT EXISTS event_queue (
                id INTEGER PRIMARY KEY,
                user_id TEXT,                           -- NULL when the payload has no usable user_id
                partition_key INTEGER NOT NULL DEFAULT 0,
                event_ts TEXT,                          -- normalized event time, NULL if unparsable
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending', -- pending, leased, done, rejected, gap
                deliveries INTEGER NOT NULL DEFAULT 0,
                lease_owner TEXT,
                lease_expires_at TEXT,
                last_error TEXT,
                enqueued_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                completed_at DATETIME
            );

            CREATE INDEX IF NOT EXISTS idx_event_queue_claim ON event_queue(status, partition_key, event_ts);
            CREATE INDEX IF NOT EXISTS idx_event_queue_user ON event_queue(user_id, status);
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
