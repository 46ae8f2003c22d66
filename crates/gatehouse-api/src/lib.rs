//! Data model and protocol types for gatehoused
//!
//! This crate defines what the service stores and what it says to clients:
//! - Sessions, cooldowns and quota usage
//! - Access decisions and start-session refusals
//! - Commands and responses
//! - Events (service -> clients)
//! - Versioning

mod commands;
mod events;
mod types;

pub use commands::*;
pub use events::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
