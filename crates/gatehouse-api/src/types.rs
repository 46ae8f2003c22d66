//! Shared types for the gatehoused data model and API

use chrono::{DateTime, Local};
use gatehouse_util::{ItemId, MonitorKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Session kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Open-ended, ends after the user goes idle
    Unlimited,
    /// Fixed wall-clock length
    Duration,
    /// Fixed number of distinct items
    Count,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Unlimited => "unlimited",
            SessionKind::Duration => "duration",
            SessionKind::Count => "count",
        }
    }
}

/// Progress of a count session.
///
/// `items_counted` always equals the number of ids in `counted_item_ids`.
/// `cooldown_ends_at` is set once, when the target is reached or first
/// exceeded, and never moved afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountProgress {
    target_count: u32,
    counted_item_ids: BTreeSet<ItemId>,
    items_counted: u32,
    cooldown_ends_at: Option<DateTime<Local>>,
}

impl CountProgress {
    pub fn new(target_count: u32) -> Self {
        Self {
            target_count,
            counted_item_ids: BTreeSet::new(),
            items_counted: 0,
            cooldown_ends_at: None,
        }
    }

    /// Rebuild progress from stored parts; the counter is derived from the set.
    pub fn from_parts(
        target_count: u32,
        counted_item_ids: BTreeSet<ItemId>,
        cooldown_ends_at: Option<DateTime<Local>>,
    ) -> Self {
        Self {
            target_count,
            items_counted: counted_item_ids.len() as u32,
            counted_item_ids,
            cooldown_ends_at,
        }
    }

    pub fn target_count(&self) -> u32 {
        self.target_count
    }

    pub fn items_counted(&self) -> u32 {
        self.items_counted
    }

    pub fn counted_item_ids(&self) -> &BTreeSet<ItemId> {
        &self.counted_item_ids
    }

    pub fn cooldown_ends_at(&self) -> Option<DateTime<Local>> {
        self.cooldown_ends_at
    }

    pub fn has_counted(&self, item: &ItemId) -> bool {
        self.counted_item_ids.contains(item)
    }

    pub fn is_complete(&self) -> bool {
        self.items_counted >= self.target_count
    }

    pub fn remaining(&self) -> u32 {
        self.target_count.saturating_sub(self.items_counted)
    }

    /// Count a new item. Returns false if it was already counted.
    pub fn record(&mut self, item: ItemId) -> bool {
        if !self.counted_item_ids.insert(item) {
            return false;
        }
        self.items_counted = self.counted_item_ids.len() as u32;
        true
    }

    /// Set the cooldown end unless one is already set; returns the value in force.
    pub fn start_cooldown(&mut self, ends_at: DateTime<Local>) -> DateTime<Local> {
        *self.cooldown_ends_at.get_or_insert(ends_at)
    }
}

/// Kind-specific session fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionTerms {
    Unlimited,
    Duration {
        ends_at: DateTime<Local>,
        /// Fixed at creation as `ends_at` plus the duration cooldown
        cooldown_ends_at: DateTime<Local>,
    },
    Count(CountProgress),
}

/// A negotiated access session for one monitoring key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub started_at: DateTime<Local>,
    pub last_active_at: DateTime<Local>,
    pub terms: SessionTerms,
}

impl Session {
    pub fn unlimited(now: DateTime<Local>) -> Self {
        Self {
            started_at: now,
            last_active_at: now,
            terms: SessionTerms::Unlimited,
        }
    }

    pub fn duration(
        now: DateTime<Local>,
        ends_at: DateTime<Local>,
        cooldown_ends_at: DateTime<Local>,
    ) -> Self {
        Self {
            started_at: now,
            last_active_at: now,
            terms: SessionTerms::Duration {
                ends_at,
                cooldown_ends_at,
            },
        }
    }

    pub fn count(now: DateTime<Local>, target_count: u32) -> Self {
        Self {
            started_at: now,
            last_active_at: now,
            terms: SessionTerms::Count(CountProgress::new(target_count)),
        }
    }

    pub fn kind(&self) -> SessionKind {
        match self.terms {
            SessionTerms::Unlimited => SessionKind::Unlimited,
            SessionTerms::Duration { .. } => SessionKind::Duration,
            SessionTerms::Count(_) => SessionKind::Count,
        }
    }

    /// End instant of a duration session
    pub fn ends_at(&self) -> Option<DateTime<Local>> {
        match self.terms {
            SessionTerms::Duration { ends_at, .. } => Some(ends_at),
            _ => None,
        }
    }

    /// Cooldown end already decided for this session, if any
    pub fn cooldown_ends_at(&self) -> Option<DateTime<Local>> {
        match &self.terms {
            SessionTerms::Unlimited => None,
            SessionTerms::Duration {
                cooldown_ends_at, ..
            } => Some(*cooldown_ends_at),
            SessionTerms::Count(progress) => progress.cooldown_ends_at(),
        }
    }

    pub fn count_progress(&self) -> Option<&CountProgress> {
        match &self.terms {
            SessionTerms::Count(progress) => Some(progress),
            _ => None,
        }
    }

    pub fn count_progress_mut(&mut self) -> Option<&mut CountProgress> {
        match &mut self.terms {
            SessionTerms::Count(progress) => Some(progress),
            _ => None,
        }
    }
}

/// Blocking period after a session ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cooldown {
    pub ends_at: DateTime<Local>,
}

impl Cooldown {
    pub fn until(ends_at: DateTime<Local>) -> Self {
        Self { ends_at }
    }

    pub fn is_active(&self, now: DateTime<Local>) -> bool {
        now < self.ends_at
    }
}

/// Everything stored for one monitoring key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyState {
    pub session: Option<Session>,
    pub cooldown: Option<Cooldown>,
}

impl KeyState {
    pub fn is_empty(&self) -> bool {
        self.session.is_none() && self.cooldown.is_none()
    }
}

/// Daily quota usage record (singleton)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub cycle_start: DateTime<Local>,
    pub units_used: u32,
}

/// Outcome of evaluating an access attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    /// No session and no cooldown: the user has to start a session first
    DenyStartRequired,
    DenyCooldown {
        remaining: Duration,
        ends_at: DateTime<Local>,
        /// A quota unit is available to end the cooldown early
        bypass_eligible: bool,
    },
    /// Count session target reached; only already-counted items stay reachable
    DenyLimitReached,
    DenySessionExpired,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Parameters the user picked when starting a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionRequest {
    Unlimited,
    Duration { minutes: u32 },
    Count { items: u32 },
}

impl SessionRequest {
    pub fn kind(&self) -> SessionKind {
        match self {
            SessionRequest::Unlimited => SessionKind::Unlimited,
            SessionRequest::Duration { .. } => SessionKind::Duration,
            SessionRequest::Count { .. } => SessionKind::Count,
        }
    }
}

/// Why a session start or bypass was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StartDenied {
    /// Daily unlimited quota spent for this cycle
    NoQuota,
    InvalidParameter { message: String },
    /// Only a quota-funded unlimited session may end a cooldown early
    CooldownActive { ends_at: DateTime<Local> },
    NotMonitored,
}

/// A session that was just created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedSession {
    pub key: MonitorKey,
    pub session: Session,
    /// Whether an active cooldown was cleared to make room for it
    pub bypassed_cooldown: bool,
}

/// Why a session record went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    /// Duration elapsed; a cooldown follows
    Expired,
    /// Unlimited session idle for too long
    IdleTimeout,
    /// Count session untouched for too long
    Abandoned,
    /// Count session cooldown elapsed
    CooldownElapsed,
    /// A new session was started in its place
    Replaced,
}

/// Quota view for clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    pub cycle_start: DateTime<Local>,
    pub next_reset: DateTime<Local>,
}

/// Read-only view of one key for overlays and prompts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatus {
    pub key: MonitorKey,
    pub monitored: bool,
    pub state: KeyState,
    /// Time left in a duration session
    pub session_remaining: Option<Duration>,
    /// Items left in a count session
    pub items_remaining: Option<u32>,
    pub cooldown_remaining: Option<Duration>,
}

/// Role for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Browser integration - checks access, starts sessions, bypasses
    Shell,
    /// Local admin - can also reload config
    Admin,
    /// Read-only observer
    Observer,
}

impl ClientRole {
    pub fn can_negotiate(&self) -> bool {
        matches!(self, ClientRole::Shell | ClientRole::Admin)
    }

    pub fn can_reload_config(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub store_ok: bool,
    pub monitored_sites: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 10, h, m, 0).unwrap()
    }

    #[test]
    fn count_progress_tracks_distinct_items() {
        let mut progress = CountProgress::new(2);
        assert!(progress.record(ItemId::new("a")));
        assert!(!progress.record(ItemId::new("a")));
        assert_eq!(progress.items_counted(), 1);
        assert!(!progress.is_complete());

        assert!(progress.record(ItemId::new("b")));
        assert_eq!(progress.items_counted(), 2);
        assert_eq!(progress.remaining(), 0);
        assert!(progress.is_complete());
    }

    #[test]
    fn count_cooldown_is_set_once() {
        let mut progress = CountProgress::new(1);
        assert_eq!(progress.start_cooldown(t(12, 30)), t(12, 30));
        assert_eq!(progress.start_cooldown(t(13, 0)), t(12, 30));
        assert_eq!(progress.cooldown_ends_at(), Some(t(12, 30)));
    }

    #[test]
    fn from_parts_derives_counter() {
        let ids: BTreeSet<ItemId> = ["x", "y", "z"].into_iter().map(ItemId::from).collect();
        let progress = CountProgress::from_parts(5, ids, None);
        assert_eq!(progress.items_counted(), 3);
        assert_eq!(progress.remaining(), 2);
    }

    #[test]
    fn session_accessors() {
        let session = Session::duration(t(12, 0), t(12, 15), t(12, 45));
        assert_eq!(session.kind(), SessionKind::Duration);
        assert_eq!(session.ends_at(), Some(t(12, 15)));
        assert_eq!(session.cooldown_ends_at(), Some(t(12, 45)));

        let session = Session::unlimited(t(12, 0));
        assert_eq!(session.kind(), SessionKind::Unlimited);
        assert_eq!(session.cooldown_ends_at(), None);
        assert!(session.count_progress().is_none());
    }

    #[test]
    fn decision_serialization() {
        let decision = Decision::DenyCooldown {
            remaining: Duration::from_secs(600),
            ends_at: t(13, 0),
            bypass_eligible: true,
        };
        let json = serde_json::to_string(&decision).unwrap();
        assert!(json.contains("\"decision\":\"deny_cooldown\""));
        let parsed: Decision = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, decision);
        assert!(!parsed.is_allowed());
    }

    #[test]
    fn session_request_wire_format() {
        let req: SessionRequest = serde_json::from_str(r#"{"kind":"count","items":3}"#).unwrap();
        assert_eq!(req, SessionRequest::Count { items: 3 });
        assert_eq!(req.kind(), SessionKind::Count);
    }

    #[test]
    fn roles() {
        assert!(ClientRole::Shell.can_negotiate());
        assert!(!ClientRole::Shell.can_reload_config());
        assert!(ClientRole::Admin.can_reload_config());
        assert!(!ClientRole::Observer.can_negotiate());
    }
}
