//! Core types for Ridgeline tablets.
//!
//! This crate provides the foundational types shared by the tablet server
//! crates:
//! - Consensus positions (`OpId`) and tablet identifiers (`TabletId`)
//! - Hybrid timestamps and the per-tablet monotonic `HybridClock`

#![deny(unsafe_code)]

pub mod hybrid_time;
pub mod types;

// Re-export commonly used types at crate root
pub use hybrid_time::{HybridClock, HybridTime, now_micros};
pub use types::{OpId, SENTINEL_TABLET_ID, TabletId};
