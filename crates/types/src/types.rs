//! Identifier types for Ridgeline tablets.
//!
//! These types name positions in the replicated log and the tablets that
//! own them. Both are wire-adjacent: the consensus layer serializes them
//! into log entries and RPC payloads.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in the replicated log: leader epoch plus log index.
///
/// The zero value means "not yet assigned"; valid log indexes start at 1.
///
/// # Display
///
/// Formats as `term.index`, e.g. `5.17`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OpId {
    /// Leader epoch in which the entry was proposed.
    pub term: i64,
    /// Position of the entry in the log.
    pub index: i64,
}

impl OpId {
    /// Sentinel term for operations received from a leader rather than
    /// originated locally.
    pub const UNKNOWN_TERM: i64 = -1;

    /// Creates an op id from a term and an index.
    #[inline]
    pub const fn new(term: i64, index: i64) -> Self {
        Self { term, index }
    }

    /// Returns true once the id names a real log position.
    #[inline]
    pub const fn is_set(&self) -> bool {
        self.index > 0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// Unique identifier for a tablet (a contiguous shard of a table).
///
/// Wraps the hex string assigned at tablet creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabletId(String);

impl TabletId {
    /// Creates a tablet id from its string form.
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TabletId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TabletId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The all-zeros tablet id reserved for internal tablets.
///
/// Write delay test hooks exempt this tablet; the literal is a wire-level
/// convention and must not change.
pub const SENTINEL_TABLET_ID: &str = "00000000000000000000000000000000";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_op_id_default_is_unset() {
        let id = OpId::default();
        assert_eq!(id, OpId::new(0, 0));
        assert!(!id.is_set());
    }

    #[test]
    fn test_op_id_set_once_index_assigned() {
        assert!(OpId::new(3, 1).is_set());
        assert!(OpId::new(0, 7).is_set());
        assert!(!OpId::new(3, 0).is_set());
    }

    #[test]
    fn test_op_id_display() {
        assert_eq!(OpId::new(5, 17).to_string(), "5.17");
    }

    #[test]
    fn test_op_id_orders_by_term_then_index() {
        assert!(OpId::new(1, 9) < OpId::new(2, 1));
        assert!(OpId::new(2, 1) < OpId::new(2, 2));
    }

    #[test]
    fn test_tablet_id_display_round_trip() {
        let id = TabletId::new("deadbeef");
        assert_eq!(id.to_string(), "deadbeef");
        assert_eq!(id.as_str(), "deadbeef");
    }

    #[test]
    fn test_sentinel_tablet_id_is_32_zeros() {
        assert_eq!(SENTINEL_TABLET_ID.len(), 32);
        assert!(SENTINEL_TABLET_ID.chars().all(|c| c == '0'));
    }
}
