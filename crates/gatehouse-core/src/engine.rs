//! Core decision engine

use chrono::{DateTime, Local};
use gatehouse_api::{
    Decision, KeyState, KeyStatus, Session, SessionKind, SessionRequest, StartDenied,
    StartedSession,
};
use gatehouse_config::Policy;
use gatehouse_host_api::WakeScheduler;
use gatehouse_store::{AuditEvent, AuditEventType, KeySnapshot, Store, WriteOutcome};
use gatehouse_util::{
    canonicalize_target, extract_item_id, format_duration, non_negative, ItemId, MonitorKey,
};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::transition::{
    check_request, evaluate_state, expire_duration, start_state, Ended, Transition, Verdict,
};
use crate::{CoreError, CoreEvent, CoreResult};

/// Attempts at a read-decide-write before giving up on a busy key
pub(crate) const MAX_CAS_ATTEMPTS: usize = 16;

/// Result of an access attempt on an arbitrary target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessOutcome {
    /// Not a monitored destination (or not a URL with a host at all)
    NotMonitored,
    Decided { key: MonitorKey, decision: Decision },
}

enum WakeAction {
    Expire {
        transition: Transition,
        cooldown_ends_at: DateTime<Local>,
    },
    Early(DateTime<Local>),
    Stale,
}

/// The core decision engine.
///
/// Shared by reference across tasks and threads; all mutable state lives in
/// the store.
pub struct CoreEngine {
    policy: RwLock<Arc<Policy>>,
    pub(crate) store: Arc<dyn Store>,
    scheduler: Arc<dyn WakeScheduler>,
    /// Held while a key's wake-up is brought in line with its stored session
    wake_sync: Mutex<()>,
}

impl CoreEngine {
    pub fn new(policy: Policy, store: Arc<dyn Store>, scheduler: Arc<dyn WakeScheduler>) -> Self {
        info!(
            monitored_sites = policy.sites.len(),
            daily_unlimited = policy.quota.daily_unlimited,
            reset_time = %policy.quota.reset_time,
            "Core engine initialized"
        );

        let engine = Self {
            policy: RwLock::new(Arc::new(policy)),
            store,
            scheduler,
            wake_sync: Mutex::new(()),
        };
        engine.audit(AuditEventType::PolicyLoaded {
            monitored_sites: engine.policy().sites.len(),
        });
        engine
    }

    /// Current policy
    pub fn policy(&self) -> Arc<Policy> {
        self.policy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reload_policy(&self, policy: Policy) -> CoreEvent {
        let monitored_sites = policy.sites.len();
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(policy);

        self.audit(AuditEventType::PolicyLoaded { monitored_sites });
        info!(monitored_sites, "Policy reloaded");

        CoreEvent::PolicyReloaded { monitored_sites }
    }

    fn audit(&self, event: AuditEventType) {
        if let Err(e) = self.store.append_audit(AuditEvent::new(event)) {
            warn!(error = %e, "Failed to append audit event");
        }
    }

    /// Monitoring key for a target, if the target is monitored
    pub fn monitored_key(&self, target: &str) -> Option<MonitorKey> {
        let key = canonicalize_target(target).ok()?;
        self.policy().is_monitored(&key).then_some(key)
    }

    /// Run one read-decide-write on `key`, retrying on conflicting writes.
    ///
    /// `decide` may run several times and must not have side effects. It
    /// returns the state to store (unchanged state means no write) and a value
    /// passed back to the caller along with the snapshot it was decided on.
    fn update_key<T>(
        &self,
        key: &MonitorKey,
        mut decide: impl FnMut(&KeyState) -> (KeyState, T),
    ) -> CoreResult<(KeySnapshot, T)> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let snapshot = self.store.read_key(key)?;
            let (next, out) = decide(&snapshot.state);
            if next == snapshot.state {
                return Ok((snapshot, out));
            }

            match self.store.write_key_if_unchanged(&snapshot, next)? {
                WriteOutcome::Committed => return Ok((snapshot, out)),
                WriteOutcome::Conflict => {
                    debug!(key = %key, attempt, "Key changed underneath, retrying");
                }
            }
        }

        warn!(key = %key, attempts = MAX_CAS_ATTEMPTS, "Giving up on contended key");
        Err(CoreError::Contention {
            key: key.clone(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Side effects of a committed transition
    fn record_transition(
        &self,
        key: &MonitorKey,
        ended: Option<Ended>,
        cooldown_started: Option<DateTime<Local>>,
    ) {
        if let Some(ended) = ended {
            info!(key = %key, kind = ended.kind.as_str(), reason = ?ended.reason, "Session ended");
            self.audit(AuditEventType::SessionEnded {
                key: key.clone(),
                kind: ended.kind,
                reason: ended.reason,
            });
        }

        if let Some(ends_at) = cooldown_started {
            info!(key = %key, ends_at = %ends_at, "Cooldown started");
            self.audit(AuditEventType::CooldownStarted {
                key: key.clone(),
                ends_at,
            });
        }
    }

    /// Point the key's wake-up at the stored duration session, or cancel it
    /// if there is none.
    ///
    /// Reads the key afresh under `wake_sync`, so whichever caller syncs last
    /// after a commit sees the newest session. Runs after every commit that
    /// may have created, replaced or ended a duration session.
    fn sync_wake_up(&self, key: &MonitorKey) {
        let _guard = self.wake_sync.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = match self.store.read_key(key) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Lazy expiry in `evaluate` still cuts the session off.
                warn!(key = %key, error = %e, "Could not read key to sync wake-up");
                return;
            }
        };

        match snapshot.state.session.as_ref().and_then(Session::ends_at) {
            Some(ends_at) => self.scheduler.schedule_at(key, ends_at),
            None => self.scheduler.cancel(key),
        }
    }

    /// Decide an access attempt on a monitored key.
    pub fn evaluate(
        &self,
        key: &MonitorKey,
        now: DateTime<Local>,
        item: Option<&ItemId>,
    ) -> CoreResult<Decision> {
        let cooldowns = self.policy().cooldowns;
        let (_, transition) = self.update_key(key, |state| {
            let transition = evaluate_state(state, now, item, &cooldowns);
            (transition.next.clone(), transition)
        })?;
        self.record_transition(key, transition.ended, transition.cooldown_started);
        if transition
            .ended
            .is_some_and(|ended| ended.kind == SessionKind::Duration)
        {
            self.sync_wake_up(key);
        }

        let decision = match transition.verdict {
            Verdict::Allow => Decision::Allow,
            Verdict::StartRequired => Decision::DenyStartRequired,
            Verdict::LimitReached => Decision::DenyLimitReached,
            Verdict::SessionExpired => Decision::DenySessionExpired,
            Verdict::Cooldown { ends_at } => Decision::DenyCooldown {
                remaining: non_negative(ends_at - now),
                ends_at,
                bypass_eligible: self.quota_remaining(now)? > 0,
            },
        };

        if let Decision::DenyCooldown { remaining, .. } = &decision {
            debug!(key = %key, remaining = %format_duration(*remaining), "Access denied by cooldown");
        } else {
            debug!(key = %key, item = ?item, decision = ?decision, "Access evaluated");
        }
        Ok(decision)
    }

    /// Derive the key and item from a target and decide.
    pub fn on_access_attempt(&self, target: &str, now: DateTime<Local>) -> CoreResult<AccessOutcome> {
        let Some(key) = self.monitored_key(target) else {
            return Ok(AccessOutcome::NotMonitored);
        };
        let item = extract_item_id(target);
        let decision = self.evaluate(&key, now, item.as_ref())?;
        Ok(AccessOutcome::Decided { key, decision })
    }

    /// Start a session on the target's key, replacing any session it holds.
    ///
    /// Unlimited sessions cost one quota unit and clear an active cooldown.
    pub fn start_session(
        &self,
        target: &str,
        request: SessionRequest,
        now: DateTime<Local>,
    ) -> CoreResult<Result<StartedSession, StartDenied>> {
        let Some(key) = self.monitored_key(target) else {
            return Ok(Err(StartDenied::NotMonitored));
        };
        if let Err(denied) = check_request(&request) {
            return Ok(Err(denied));
        }

        let spent = if request == SessionRequest::Unlimited {
            match self.spend_unit(now)? {
                Ok(status) => Some(status),
                Err(denied) => {
                    info!(key = %key, "Unlimited session denied, no quota left");
                    return Ok(Err(denied));
                }
            }
        } else {
            None
        };

        let item = extract_item_id(target);
        let cooldowns = self.policy().cooldowns;
        let (before, result) = self.update_key(&key, |state| {
            match start_state(state, now, request, item.as_ref(), &cooldowns) {
                Ok(start) => (start.next.clone(), Ok(start)),
                Err(denied) => (state.clone(), Err(denied)),
            }
        })?;

        let start = match result {
            Ok(start) => start,
            Err(denied) => {
                info!(key = %key, kind = request.kind().as_str(), reason = ?denied, "Session start denied");
                return Ok(Err(denied));
            }
        };

        self.record_transition(&key, start.ended, start.cooldown_started);

        let had_duration = before
            .state
            .session
            .as_ref()
            .is_some_and(|s| s.kind() == SessionKind::Duration);
        if had_duration || start.session.kind() == SessionKind::Duration {
            self.sync_wake_up(&key);
        }

        let session = &start.session;
        info!(
            key = %key,
            kind = session.kind().as_str(),
            ends_at = ?session.ends_at(),
            bypassed_cooldown = start.bypassed_cooldown,
            "Session started"
        );
        self.audit(AuditEventType::SessionStarted {
            key: key.clone(),
            kind: session.kind(),
            ends_at: session.ends_at(),
            target_count: session.count_progress().map(|p| p.target_count()),
        });
        if start.bypassed_cooldown {
            self.audit(AuditEventType::BypassUsed {
                key: key.clone(),
                units_used: spent.map(|s| s.used).unwrap_or_default(),
            });
        }

        Ok(Ok(StartedSession {
            key,
            session: start.session,
            bypassed_cooldown: start.bypassed_cooldown,
        }))
    }

    /// Spend a quota unit to replace a cooldown with an unlimited session.
    pub fn bypass(
        &self,
        target: &str,
        now: DateTime<Local>,
    ) -> CoreResult<Result<StartedSession, StartDenied>> {
        self.start_session(target, SessionRequest::Unlimited, now)
    }

    /// Activity ping for an unlimited session. Returns whether the session is
    /// still alive; other session kinds are left alone.
    pub fn heartbeat(&self, target: &str, now: DateTime<Local>) -> CoreResult<bool> {
        let Some(key) = self.monitored_key(target) else {
            return Ok(false);
        };

        let cooldowns = self.policy().cooldowns;
        let (_, transition) = self.update_key(&key, |state| match &state.session {
            Some(session) if session.kind() == SessionKind::Unlimited => {
                let transition = evaluate_state(state, now, None, &cooldowns);
                (transition.next.clone(), Some(transition))
            }
            _ => (state.clone(), None),
        })?;

        let Some(transition) = transition else {
            return Ok(false);
        };
        self.record_transition(&key, transition.ended, transition.cooldown_started);
        Ok(transition.verdict == Verdict::Allow)
    }

    /// Handle a fired wake-up for a duration session that ends at `scheduled_for`.
    ///
    /// Does nothing if the session was replaced or removed in the meantime.
    pub fn handle_wake(
        &self,
        key: &MonitorKey,
        scheduled_for: DateTime<Local>,
        now: DateTime<Local>,
    ) -> CoreResult<Option<CoreEvent>> {
        let (_, action) = self.update_key(key, |state| {
            let session = state.session.as_ref();
            match session.and_then(Session::ends_at) {
                Some(ends_at) if ends_at == scheduled_for => {
                    if now < ends_at {
                        return (state.clone(), WakeAction::Early(ends_at));
                    }
                    match (expire_duration(state, now), session.and_then(Session::cooldown_ends_at)) {
                        (Some(transition), Some(cooldown_ends_at)) => (
                            transition.next.clone(),
                            WakeAction::Expire {
                                transition,
                                cooldown_ends_at,
                            },
                        ),
                        _ => (state.clone(), WakeAction::Stale),
                    }
                }
                _ => (state.clone(), WakeAction::Stale),
            }
        })?;

        match action {
            WakeAction::Stale => {
                // A stale wake-up may have displaced the live session's one
                debug!(key = %key, scheduled_for = %scheduled_for, "Stale wake-up ignored");
                self.sync_wake_up(key);
                Ok(None)
            }
            WakeAction::Early(ends_at) => {
                debug!(key = %key, ends_at = %ends_at, "Wake-up fired early, rescheduling");
                self.sync_wake_up(key);
                Ok(None)
            }
            WakeAction::Expire {
                transition,
                cooldown_ends_at,
            } => {
                self.record_transition(key, transition.ended, transition.cooldown_started);
                self.sync_wake_up(key);
                Ok(Some(CoreEvent::SessionExpired {
                    key: key.clone(),
                    cooldown_ends_at,
                }))
            }
        }
    }

    /// Re-arm wake-ups for stored duration sessions, expiring overdue ones.
    /// Called once at service start.
    pub fn reschedule_pending(&self, now: DateTime<Local>) -> CoreResult<Vec<CoreEvent>> {
        let mut events = Vec::new();
        for key in self.store.list_keys()? {
            let snapshot = self.store.read_key(&key)?;
            let Some(ends_at) = snapshot.state.session.as_ref().and_then(Session::ends_at) else {
                continue;
            };

            if ends_at > now {
                self.sync_wake_up(&key);
            } else if let Some(event) = self.handle_wake(&key, ends_at, now)? {
                events.push(event);
            }
        }

        info!(expired = events.len(), "Pending duration sessions rescheduled");
        Ok(events)
    }

    /// Read-only view of one key
    pub fn key_status(&self, key: &MonitorKey, now: DateTime<Local>) -> CoreResult<KeyStatus> {
        let snapshot = self.store.read_key(key)?;
        let state = snapshot.state;

        let session_remaining = state
            .session
            .as_ref()
            .and_then(Session::ends_at)
            .map(|ends_at| non_negative(ends_at - now));
        let items_remaining = state
            .session
            .as_ref()
            .and_then(Session::count_progress)
            .map(|p| p.remaining());
        let cooldown_remaining = state
            .cooldown
            .filter(|c| c.is_active(now))
            .map(|c| non_negative(c.ends_at - now));

        Ok(KeyStatus {
            key: key.clone(),
            monitored: self.policy().is_monitored(key),
            state,
            session_remaining,
            items_remaining,
            cooldown_remaining,
        })
    }
}
