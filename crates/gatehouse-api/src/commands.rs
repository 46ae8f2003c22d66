//! Command types for the gatehoused protocol

use gatehouse_util::{ClientId, MonitorKey};
use serde::{Deserialize, Serialize};

use crate::{
    ClientRole, Decision, HealthStatus, KeyStatus, QuotaStatus, SessionRequest, StartDenied,
    StartedSession, API_VERSION,
};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    pub api_version: u32,
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u64,
    pub api_version: u32,
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes for the protocol.
///
/// Clients must treat any error in reply to `CheckAccess` as a deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    PermissionDenied,
    RateLimited,
    StoreUnavailable,
    /// Too many concurrent writers on one key; retry
    Contention,
    ConfigError,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// A browsing surface is about to show `target`
    CheckAccess { target: String },

    StartSession {
        target: String,
        request: SessionRequest,
    },

    /// Activity ping from a surface showing an unlimited session
    Heartbeat { target: String },

    /// Spend a quota unit to end a cooldown with an unlimited session
    Bypass { target: String },

    GetKeyStatus { target: String },

    GetQuota,

    /// Reload configuration (admin only)
    ReloadConfig,

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    UnsubscribeEvents,

    GetHealth,

    /// Ping for keepalive
    Ping,
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Access {
        key: MonitorKey,
        decision: Decision,
    },
    /// Target is not a monitored destination; always allowed
    NotMonitored,
    SessionStarted(StartedSession),
    StartDenied {
        reason: StartDenied,
    },
    HeartbeatAccepted,
    KeyStatus(KeyStatus),
    Quota(QuotaStatus),
    ConfigReloaded {
        monitored_sites: usize,
    },
    Subscribed {
        client_id: ClientId,
    },
    Unsubscribed,
    Health(HealthStatus),
    Pong,
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
}
