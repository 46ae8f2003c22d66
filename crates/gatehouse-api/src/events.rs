//! Event types for gatehoused -> client streaming

use chrono::{DateTime, Local};
use gatehouse_util::MonitorKey;
use serde::{Deserialize, Serialize};

use crate::{KeyState, QuotaStatus, API_VERSION};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Local>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: gatehouse_util::now(),
            payload,
        }
    }
}

/// All possible events from the service to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Session or cooldown for a key was written
    StateChanged {
        key: MonitorKey,
        before: KeyState,
        after: KeyState,
    },

    /// A duration session ran out while surfaces may be idle; every surface
    /// showing `key` should check access again
    SessionExpired {
        key: MonitorKey,
        cooldown_ends_at: DateTime<Local>,
    },

    QuotaChanged(QuotaStatus),

    PolicyReloaded {
        monitored_sites: usize,
    },

    /// Service is shutting down
    Shutdown,
}
