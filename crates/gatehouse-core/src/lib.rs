//! Session and cooldown decision engine for gatehoused
//!
//! This crate is the heart of gatehoused, containing:
//! - Access decisions for monitored keys (allow, or deny with a reason)
//! - Session lifecycle: unlimited, duration and count sessions
//! - Cooldowns and their quota-funded bypass
//! - Daily quota accounting with lazy cycle rollover
//! - Expiry wake-up handling for idle surfaces
//!
//! Every decision is a read-decide-write on one key's stored state, committed
//! with compare-and-swap and retried on conflict, so concurrent callers never
//! overwrite each other's transitions.

mod engine;
mod error;
mod events;
mod quota;
mod transition;

#[cfg(test)]
mod test_support;

pub use engine::*;
pub use error::*;
pub use events::*;
pub use transition::{
    ACTIVITY_WRITE_THROTTLE, COUNT_ABANDON_TIMEOUT, MAX_COUNT_ITEMS, MAX_DURATION_MINUTES,
    UNLIMITED_IDLE_TIMEOUT,
};
