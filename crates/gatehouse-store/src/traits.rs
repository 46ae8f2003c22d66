//! Store trait definitions

use gatehouse_api::{KeyState, QuotaUsage};
use gatehouse_util::MonitorKey;
use tokio::sync::broadcast;

use crate::{AuditEvent, StoreResult};

/// State of one key as read, tagged with the version it was read at.
///
/// Hand the snapshot back to [`Store::write_key_if_unchanged`]; the write only
/// lands if nobody else wrote the key in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySnapshot {
    pub key: MonitorKey,
    pub state: KeyState,
    pub version: u64,
}

/// The quota record as read. `usage` is `None` before the first spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub usage: Option<QuotaUsage>,
    pub version: u64,
}

/// Result of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed,
    /// The record changed since the snapshot was taken; nothing was written
    Conflict,
}

impl WriteOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, WriteOutcome::Committed)
    }
}

/// A committed change to one key, as published on the change feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub key: MonitorKey,
    pub before: KeyState,
    pub after: KeyState,
}

/// Main store trait
pub trait Store: Send + Sync {
    // Per-key state

    fn read_key(&self, key: &MonitorKey) -> StoreResult<KeySnapshot>;

    /// Replace the key's state with `next` if its version still matches `base`.
    fn write_key_if_unchanged(&self, base: &KeySnapshot, next: KeyState)
    -> StoreResult<WriteOutcome>;

    /// Keys that currently hold a session or a cooldown
    fn list_keys(&self) -> StoreResult<Vec<MonitorKey>>;

    // Quota

    fn read_quota(&self) -> StoreResult<QuotaSnapshot>;

    fn write_quota_if_unchanged(
        &self,
        base: &QuotaSnapshot,
        next: QuotaUsage,
    ) -> StoreResult<WriteOutcome>;

    // Change feed

    /// Receive every committed key write that changed the key's state.
    fn subscribe(&self) -> broadcast::Receiver<StateChange>;

    // Audit log

    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Most recent first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Health

    fn is_healthy(&self) -> bool;
}
