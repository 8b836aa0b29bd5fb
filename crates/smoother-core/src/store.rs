//! Durable per-user filter state
//!
//! The store is a keyed get/set interface. Read-modify-write of one user is
//! made safe against other writers of the same user through a version
//! number: `set` names the version it read, and fails with
//! [`Error::Conflict`](crate::Error::Conflict) if someone else wrote first.
//! No cross-user coordination happens here.

use crate::error::Result;
use crate::models::FilterState;

/// A state together with the version it was read at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredState {
    pub state: FilterState,
    pub version: i64,
}

pub trait StateStore: Send {
    /// Current state for `user_id`, or `None` if the user was never seen
    fn get(&self, user_id: &str) -> Result<Option<StoredState>>;

    /// Replace the state for `user_id`.
    ///
    /// `expected_version` is the version returned by [`get`](Self::get), or
    /// `None` for a user that had no state. The whole state is written
    /// atomically. Returns the new version.
    fn set(&self, user_id: &str, state: &FilterState, expected_version: Option<i64>)
        -> Result<i64>;
}
