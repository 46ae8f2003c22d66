//! Core events emitted by the engine

use chrono::{DateTime, Local};
use gatehouse_util::MonitorKey;

/// Events emitted by the core engine for the service to fan out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// A duration session was cut off by its wake-up; surfaces showing the
    /// key should check access again
    SessionExpired {
        key: MonitorKey,
        cooldown_ends_at: DateTime<Local>,
    },

    PolicyReloaded { monitored_sites: usize },
}
