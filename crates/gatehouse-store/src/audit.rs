//! Audit event types

use chrono::{DateTime, Local};
use gatehouse_api::{SessionEndReason, SessionKind};
use gatehouse_util::MonitorKey;
use serde::{Deserialize, Serialize};

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    ServiceStarted,

    ServiceStopped,

    /// Policy loaded/reloaded
    PolicyLoaded { monitored_sites: usize },

    SessionStarted {
        key: MonitorKey,
        kind: SessionKind,
        /// End instant of a duration session
        ends_at: Option<DateTime<Local>>,
        /// Target of a count session
        target_count: Option<u32>,
    },

    SessionEnded {
        key: MonitorKey,
        kind: SessionKind,
        reason: SessionEndReason,
    },

    CooldownStarted {
        key: MonitorKey,
        ends_at: DateTime<Local>,
    },

    /// A quota unit was spent to end a cooldown
    BypassUsed { key: MonitorKey, units_used: u32 },

    /// Config reload requested
    ConfigReloaded { success: bool },

    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Assigned by the store
    pub id: i64,

    pub timestamp: DateTime<Local>,

    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0,
            timestamp: gatehouse_util::now(),
            event,
        }
    }
}
