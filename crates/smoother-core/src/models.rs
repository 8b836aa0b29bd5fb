//! Data models for the balance smoother

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::filter::{Estimate, Matrix2, Vector2};

/// Transaction direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debit" => Ok(Self::Debit),
            "credit" => Ok(Self::Credit),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single transaction as delivered by the event queue
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEvent {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    /// Unsigned amount; the sign comes from `direction`
    pub amount: f64,
    pub direction: Direction,
}

impl TransactionEvent {
    /// Parse a queue message of the shape
    /// `{"user_id": "...", "ts": "<ISO-8601>", "amount": 12.5, "direction": "debit"}`.
    ///
    /// `amount` may also be a numeric string. Every problem is reported as
    /// [`Error::MalformedEvent`] so the caller can dead-letter the payload.
    pub fn from_json(payload: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| Error::MalformedEvent(format!("invalid JSON: {}", e)))?;
        let object = value
            .as_object()
            .ok_or_else(|| Error::MalformedEvent("payload is not a JSON object".to_string()))?;

        let user_id = match object.get("user_id") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => return Err(Error::MalformedEvent("user_id is empty".to_string())),
            None => return Err(Error::MalformedEvent("missing user_id".to_string())),
        };

        let ts = object
            .get("ts")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedEvent("missing ts".to_string()))?;
        let timestamp = parse_timestamp(ts)
            .ok_or_else(|| Error::MalformedEvent(format!("unparsable ts: {}", ts)))?;

        let amount = match object.get("amount") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(_) => None,
            None => return Err(Error::MalformedEvent("missing amount".to_string())),
        }
        .ok_or_else(|| Error::MalformedEvent("unparsable amount".to_string()))?;

        if !amount.is_finite() {
            return Err(Error::MalformedEvent(format!(
                "non-finite amount: {}",
                amount
            )));
        }
        if amount < 0.0 {
            return Err(Error::MalformedEvent(format!(
                "negative amount {} (use direction for the sign)",
                amount
            )));
        }

        let direction = object
            .get("direction")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedEvent("missing direction".to_string()))?
            .parse::<Direction>()
            .map_err(Error::MalformedEvent)?;

        Ok(Self {
            user_id,
            timestamp,
            amount,
            direction,
        })
    }

    /// Serialize back to the queue message shape
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "user_id": self.user_id,
            "ts": format_timestamp(&self.timestamp),
            "amount": self.amount,
            "direction": self.direction.as_str(),
        })
        .to_string()
    }

    /// Signed observation: negative for debits, positive for credits
    pub fn signed_amount(&self) -> f64 {
        match self.direction {
            Direction::Debit => -self.amount,
            Direction::Credit => self.amount,
        }
    }
}

/// Durable per-user filter state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterState {
    pub estimate: Estimate,
    /// Timestamp of the newest event folded into this state
    pub last_update: DateTime<Utc>,
    /// Running sum of signed amounts seen so far
    pub observed_balance: f64,
}

impl FilterState {
    pub fn mean(&self) -> Vector2 {
        self.estimate.mean
    }

    pub fn covariance(&self) -> Matrix2 {
        self.estimate.covariance
    }

    /// Export in the logical persisted shape `{"x": [[m0],[m1]], "P": [[..],[..]], "ts": ..}`
    pub fn to_document(&self) -> StateDocument {
        StateDocument {
            x: [[self.estimate.mean[0]], [self.estimate.mean[1]]],
            p: self.estimate.covariance,
            ts: format_timestamp(&self.last_update),
            observed_balance: self.observed_balance,
        }
    }
}

/// Serialized form of [`FilterState`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub x: [[f64; 1]; 2],
    #[serde(rename = "P")]
    pub p: Matrix2,
    pub ts: String,
    pub observed_balance: f64,
}

impl StateDocument {
    pub fn into_state(self) -> Result<FilterState> {
        let last_update = parse_timestamp(&self.ts)
            .ok_or_else(|| Error::InvalidData(format!("Invalid state timestamp: {}", self.ts)))?;
        Ok(FilterState {
            estimate: Estimate {
                mean: [self.x[0][0], self.x[1][0]],
                covariance: self.p,
            },
            last_update,
            observed_balance: self.observed_balance,
        })
    }
}

/// One row of the append-only smoothed balance log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothedRecord {
    pub user_id: String,
    /// Observation (event) time
    #[serde(with = "iso8601")]
    pub as_of: DateTime<Utc>,
    pub smoothed_balance: f64,
    #[serde(rename = "var")]
    pub variance: f64,
    #[serde(with = "iso8601")]
    pub created_at: DateTime<Utc>,
}

/// Per-status counts of the event queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub leased: i64,
    pub done: i64,
    pub rejected: i64,
    pub gap: i64,
}

/// Lifecycle of a queued event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting for a consumer
    Pending,
    /// Claimed by a consumer until its lease expires
    Leased,
    /// Applied and recorded
    Done,
    /// Dead-lettered (malformed or too many deliveries)
    Rejected,
    /// Applied to state but the output record is missing
    Gap,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Done => "done",
            Self::Rejected => "rejected",
            Self::Gap => "gap",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "done" => Ok(Self::Done),
            "rejected" => Ok(Self::Rejected),
            "gap" => Ok(Self::Gap),
            _ => Err(format!("Unknown queue status: {}", s)),
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A queued event as seen by an operator
#[derive(Debug, Clone, Serialize)]
pub struct QueuedEvent {
    pub id: i64,
    pub user_id: Option<String>,
    pub partition: u32,
    pub payload: String,
    pub status: QueueStatus,
    pub deliveries: u32,
    pub last_error: Option<String>,
    pub enqueued_at: String,
}

/// Parse an ISO-8601 timestamp.
///
/// Accepts RFC 3339 with an offset, or a naive `YYYY-MM-DDTHH:MM:SS[.f]`
/// (also with a space separator, or a bare date) which is taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt.and_utc());
        }
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Fixed-width UTC format; lexical order equals chronological order, which
/// the queue relies on when ordering by event time in SQL.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

mod iso8601 {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_timestamp(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", s)))
    }
}
