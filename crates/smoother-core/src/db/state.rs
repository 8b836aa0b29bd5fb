//! Per-user filter state

use rusqlite::{params, OptionalExtension, Row};

use super::Database;
use crate::error::{Error, Result};
use crate::filter::Estimate;
use crate::models::{format_timestamp, parse_timestamp, FilterState};
use crate::store::{StateStore, StoredState};

const STATE_COLUMNS: &str = "user_id, mean_balance, mean_velocity, cov_00, cov_01, cov_10, cov_11, \
     observed_balance, last_update, version";

fn row_to_state(row: &Row) -> rusqlite::Result<(String, StoredState)> {
    let last_update: String = row.get(8)?;
    let last_update = parse_timestamp(&last_update).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("invalid last_update: {}", last_update).into(),
        )
    })?;

    Ok((
        row.get(0)?,
        StoredState {
            state: FilterState {
                estimate: Estimate {
                    mean: [row.get(1)?, row.get(2)?],
                    covariance: [[row.get(3)?, row.get(4)?], [row.get(5)?, row.get(6)?]],
                },
                last_update,
                observed_balance: row.get(7)?,
            },
            version: row.get(9)?,
        },
    ))
}

impl Database {
    /// Load a user's filter state
    pub fn get_state(&self, user_id: &str) -> Result<Option<StoredState>> {
        let conn = self.conn()?;
        let state = conn
            .query_row(
                &format!("SELECT {} FROM filter_states WHERE user_id = ?", STATE_COLUMNS),
                params![user_id],
                row_to_state,
            )
            .optional()?;

        Ok(state.map(|(_, stored)| stored))
    }

    /// Write a user's filter state if nobody else has since `expected_version`.
    ///
    /// A single INSERT or UPDATE statement, so the row is replaced atomically.
    pub fn put_state(
        &self,
        user_id: &str,
        state: &FilterState,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let [m0, m1] = state.estimate.mean;
        let [[p00, p01], [p10, p11]] = state.estimate.covariance;
        let last_update = format_timestamp(&state.last_update);

        let conflict = || Error::Conflict {
            user_id: user_id.to_string(),
            expected: expected_version,
        };

        match expected_version {
            None => {
                let inserted = conn.execute(
                    "INSERT INTO filter_states
                        (user_id, mean_balance, mean_velocity, cov_00, cov_01, cov_10, cov_11,
                         observed_balance, last_update, version)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
                     ON CONFLICT(user_id) DO NOTHING",
                    params![
                        user_id,
                        m0,
                        m1,
                        p00,
                        p01,
                        p10,
                        p11,
                        state.observed_balance,
                        last_update
                    ],
                )?;
                if inserted == 0 {
                    return Err(conflict());
                }
                Ok(1)
            }
            Some(version) => {
                let updated = conn.execute(
                    "UPDATE filter_states
                     SET mean_balance = ?, mean_velocity = ?,
                         cov_00 = ?, cov_01 = ?, cov_10 = ?, cov_11 = ?,
                         observed_balance = ?, last_update = ?,
                         version = version + 1, updated_at = CURRENT_TIMESTAMP
                     WHERE user_id = ? AND version = ?",
                    params![
                        m0,
                        m1,
                        p00,
                        p01,
                        p10,
                        p11,
                        state.observed_balance,
                        last_update,
                        user_id,
                        version
                    ],
                )?;
                if updated == 0 {
                    return Err(conflict());
                }
                Ok(version + 1)
            }
        }
    }

    /// All users with state, ordered by user id
    pub fn list_states(&self) -> Result<Vec<(String, StoredState)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM filter_states ORDER BY user_id",
            STATE_COLUMNS
        ))?;

        let states = stmt
            .query_map([], row_to_state)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(states)
    }

    /// Number of users with state
    pub fn count_states(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM filter_states", [], |row| row.get(0))?)
    }
}

/// Storage failures surface as `StoreUnavailable` so the service retries them;
/// version conflicts keep their own variant.
fn store_error(e: Error) -> Error {
    match e {
        Error::Conflict { .. } | Error::StoreUnavailable(_) => e,
        other => Error::StoreUnavailable(other.to_string()),
    }
}

impl StateStore for Database {
    fn get(&self, user_id: &str) -> Result<Option<StoredState>> {
        self.get_state(user_id).map_err(store_error)
    }

    fn set(
        &self,
        user_id: &str,
        state: &FilterState,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        self.put_state(user_id, state, expected_version)
            .map_err(store_error)
    }
}
