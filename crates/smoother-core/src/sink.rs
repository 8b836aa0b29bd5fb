//! Append-only log of smoothed estimates

use crate::error::Result;
use crate::models::SmoothedRecord;

pub trait OutputSink: Send {
    /// Append one record. Records are never updated or deleted.
    fn append(&self, record: &SmoothedRecord) -> Result<()>;
}
