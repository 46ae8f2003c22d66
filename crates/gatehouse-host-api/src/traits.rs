//! Scheduler collaborator traits

use chrono::{DateTime, Local};
use gatehouse_util::MonitorKey;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from host collaborator operations
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Wake-up events already taken by another subscriber")]
    AlreadySubscribed,
}

pub type HostResult<T> = Result<T, HostError>;

/// A scheduled wake-up that fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeEvent {
    pub key: MonitorKey,
    /// The instant the wake-up was scheduled for
    pub at: DateTime<Local>,
}

/// One-shot wake-ups keyed by monitoring key.
///
/// At most one wake-up is pending per key; scheduling again replaces it.
/// Both operations are best-effort and idempotent: cancelling something that
/// already fired or was never scheduled does nothing. A missed wake-up is
/// tolerated because access checks expire sessions on their own.
pub trait WakeScheduler: Send + Sync {
    fn schedule_at(&self, key: &MonitorKey, at: DateTime<Local>);

    fn cancel(&self, key: &MonitorKey);

    /// Take the stream of fired wake-ups. Only one subscriber is supported.
    fn subscribe(&self) -> HostResult<mpsc::UnboundedReceiver<WakeEvent>>;
}
