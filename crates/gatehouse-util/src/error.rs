//! Error types for gatehoused

use thiserror::Error;

/// Error type for the shared utilities
#[derive(Debug, Error)]
pub enum GatehouseError {
    /// Target has no usable host, so no monitoring key can be derived
    #[error("Invalid target: {0}")]
    InvalidTarget(String),
}

impl GatehouseError {
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::InvalidTarget(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, GatehouseError>;
