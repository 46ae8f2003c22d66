//! Core error types

use gatehouse_store::StoreError;
use gatehouse_util::MonitorKey;
use thiserror::Error;

/// Errors from engine operations.
///
/// None of these mean "allow": a caller that gets an error for an access
/// check has to deny.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Gave up after {attempts} conflicting writes to {key}")]
    Contention { key: MonitorKey, attempts: usize },

    #[error("Gave up after {attempts} conflicting quota writes")]
    QuotaContention { attempts: usize },
}

pub type CoreResult<T> = Result<T, CoreError>;
