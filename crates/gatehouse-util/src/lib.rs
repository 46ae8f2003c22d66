//! Shared utilities for gatehoused
//!
//! This crate provides:
//! - ID types (MonitorKey, ItemId, ClientId)
//! - Target canonicalization (monitoring key and item id extraction)
//! - Wall-clock utilities and the daily quota cycle calculation
//! - Error types
//! - Rate limiting helpers
//! - Default paths for socket, data, and config directories

mod error;
mod ids;
mod paths;
mod rate_limit;
mod target;
mod time;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use rate_limit::*;
pub use target::*;
pub use time::*;
