//! Smoothed balance log

use rusqlite::{params, Row};

use super::Database;
use crate::error::{Error, Result};
use crate::models::{format_timestamp, parse_timestamp, SmoothedRecord};
use crate::sink::OutputSink;

fn row_to_record(row: &Row) -> rusqlite::Result<SmoothedRecord> {
    let timestamp = |idx: usize| -> rusqlite::Result<_> {
        let s: String = row.get(idx)?;
        parse_timestamp(&s).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                format!("invalid timestamp: {}", s).into(),
            )
        })
    };

    Ok(SmoothedRecord {
        user_id: row.get(0)?,
        as_of: timestamp(1)?,
        smoothed_balance: row.get(2)?,
        variance: row.get(3)?,
        created_at: timestamp(4)?,
    })
}

impl Database {
    /// Append a smoothed record
    pub fn append_record(&self, record: &SmoothedRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO smoothed_balances (user_id, as_of, smoothed_balance, variance, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                record.user_id,
                format_timestamp(&record.as_of),
                record.smoothed_balance,
                record.variance,
                format_timestamp(&record.created_at)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent records for a user, newest observation first
    pub fn recent_records(&self, user_id: &str, limit: usize) -> Result<Vec<SmoothedRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, as_of, smoothed_balance, variance, created_at
             FROM smoothed_balances
             WHERE user_id = ?
             ORDER BY as_of DESC, id DESC
             LIMIT ?",
        )?;

        let records = stmt
            .query_map(params![user_id, limit as i64], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Total records, optionally for one user
    pub fn count_records(&self, user_id: Option<&str>) -> Result<i64> {
        let conn = self.conn()?;
        let count = match user_id {
            Some(user_id) => conn.query_row(
                "SELECT COUNT(*) FROM smoothed_balances WHERE user_id = ?",
                params![user_id],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM smoothed_balances", [], |row| {
                row.get(0)
            })?,
        };
        Ok(count)
    }
}

impl OutputSink for Database {
    fn append(&self, record: &SmoothedRecord) -> Result<()> {
        self.append_record(record)
            .map(|_| ())
            .map_err(|e| Error::SinkUnavailable(e.to_string()))
    }
}
