//! Per-key state transitions
//!
//! Pure functions from the stored state of one key (plus the current time)
//! to a verdict and the state to write back. The engine wraps them in a
//! compare-and-swap loop; nothing here touches the store.

use chrono::{DateTime, Local};
use gatehouse_api::{
    Cooldown, CountProgress, KeyState, Session, SessionEndReason, SessionKind, SessionRequest,
    SessionTerms, StartDenied,
};
use gatehouse_config::CooldownPolicy;
use gatehouse_util::{non_negative, ItemId};
use std::time::Duration;

/// Unlimited sessions end after this long without activity
pub const UNLIMITED_IDLE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Count sessions are dropped after this long without a new item
pub const COUNT_ABANDON_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Minimum spacing between `last_active_at` writes
pub const ACTIVITY_WRITE_THROTTLE: Duration = Duration::from_secs(5);

pub const MAX_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_COUNT_ITEMS: u32 = 1000;

/// Verdict before quota lookups are folded in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Allow,
    StartRequired,
    Cooldown { ends_at: DateTime<Local> },
    LimitReached,
    SessionExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ended {
    pub kind: SessionKind,
    pub reason: SessionEndReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Transition {
    pub verdict: Verdict,
    pub next: KeyState,
    pub ended: Option<Ended>,
    /// Set when this transition creates a cooldown end that did not exist before
    pub cooldown_started: Option<DateTime<Local>>,
}

impl Transition {
    fn keep(state: &KeyState, verdict: Verdict) -> Self {
        Self {
            verdict,
            next: state.clone(),
            ended: None,
            cooldown_started: None,
        }
    }
}

fn elapsed(since: DateTime<Local>, now: DateTime<Local>) -> Duration {
    non_negative(now - since)
}

fn touched(session: &Session, now: DateTime<Local>) -> Option<Session> {
    if elapsed(session.last_active_at, now) <= ACTIVITY_WRITE_THROTTLE {
        return None;
    }
    Some(Session {
        last_active_at: now,
        ..session.clone()
    })
}

fn allow_with_touch(state: &KeyState, session: &Session, now: DateTime<Local>) -> Transition {
    match touched(session, now) {
        Some(session) => Transition {
            verdict: Verdict::Allow,
            next: KeyState {
                session: Some(session),
                cooldown: state.cooldown,
            },
            ended: None,
            cooldown_started: None,
        },
        None => Transition::keep(state, Verdict::Allow),
    }
}

/// Decide an access attempt against the stored state of one key.
pub(crate) fn evaluate_state(
    state: &KeyState,
    now: DateTime<Local>,
    item: Option<&ItemId>,
    cooldowns: &CooldownPolicy,
) -> Transition {
    if let Some(session) = &state.session {
        return match &session.terms {
            SessionTerms::Unlimited => evaluate_unlimited(state, session, now),
            SessionTerms::Duration { ends_at, .. } => {
                if now > *ends_at {
                    expire_duration(state, now).unwrap_or_else(|| Transition::keep(state, Verdict::Allow))
                } else {
                    Transition::keep(state, Verdict::Allow)
                }
            }
            SessionTerms::Count(progress) => {
                evaluate_count(state, session, progress, now, item, cooldowns)
            }
        };
    }

    match state.cooldown {
        Some(cooldown) if cooldown.is_active(now) => Transition::keep(
            state,
            Verdict::Cooldown {
                ends_at: cooldown.ends_at,
            },
        ),
        // Elapsed cooldowns are cleaned up on first sight
        Some(_) => Transition {
            verdict: Verdict::StartRequired,
            next: KeyState::default(),
            ended: None,
            cooldown_started: None,
        },
        None => Transition::keep(state, Verdict::StartRequired),
    }
}

fn evaluate_unlimited(state: &KeyState, session: &Session, now: DateTime<Local>) -> Transition {
    if elapsed(session.last_active_at, now) > UNLIMITED_IDLE_TIMEOUT {
        return Transition {
            verdict: Verdict::SessionExpired,
            next: KeyState {
                session: None,
                cooldown: state.cooldown,
            },
            ended: Some(Ended {
                kind: SessionKind::Unlimited,
                reason: SessionEndReason::IdleTimeout,
            }),
            cooldown_started: None,
        };
    }
    allow_with_touch(state, session, now)
}

/// End a duration session and enter its precomputed cooldown.
///
/// Shared by the lazy check and the wake-up path so both land on the same
/// cooldown end. Returns `None` if the key holds no duration session.
pub(crate) fn expire_duration(state: &KeyState, now: DateTime<Local>) -> Option<Transition> {
    let session = state.session.as_ref()?;
    let SessionTerms::Duration {
        cooldown_ends_at, ..
    } = session.terms
    else {
        return None;
    };

    // A cooldown that already ran out is not worth writing
    let cooldown = (cooldown_ends_at > now).then(|| Cooldown::until(cooldown_ends_at));

    Some(Transition {
        verdict: Verdict::SessionExpired,
        next: KeyState {
            session: None,
            cooldown,
        },
        ended: Some(Ended {
            kind: SessionKind::Duration,
            reason: SessionEndReason::Expired,
        }),
        cooldown_started: cooldown.map(|c| c.ends_at),
    })
}

fn evaluate_count(
    state: &KeyState,
    session: &Session,
    progress: &CountProgress,
    now: DateTime<Local>,
    item: Option<&ItemId>,
    cooldowns: &CooldownPolicy,
) -> Transition {
    if let Some(cooldown_ends_at) = progress.cooldown_ends_at() {
        if now > cooldown_ends_at {
            return Transition {
                verdict: Verdict::SessionExpired,
                next: KeyState::default(),
                ended: Some(Ended {
                    kind: SessionKind::Count,
                    reason: SessionEndReason::CooldownElapsed,
                }),
                cooldown_started: None,
            };
        }
    }

    if elapsed(session.last_active_at, now) > COUNT_ABANDON_TIMEOUT {
        return Transition {
            verdict: Verdict::SessionExpired,
            next: KeyState {
                session: None,
                cooldown: state.cooldown,
            },
            ended: Some(Ended {
                kind: SessionKind::Count,
                reason: SessionEndReason::Abandoned,
            }),
            cooldown_started: None,
        };
    }

    let Some(item) = item.filter(|item| !progress.has_counted(item)) else {
        return allow_with_touch(state, session, now);
    };

    let mut progress = progress.clone();
    let had_cooldown = progress.cooldown_ends_at().is_some();

    if progress.is_complete() {
        // Over the limit: keep the history so counted items stay reachable
        let ends_at = progress.start_cooldown(now + cooldowns.after_count);
        return Transition {
            verdict: Verdict::LimitReached,
            next: KeyState {
                session: Some(Session {
                    terms: SessionTerms::Count(progress),
                    ..session.clone()
                }),
                cooldown: Some(Cooldown::until(ends_at)),
            },
            ended: None,
            cooldown_started: (!had_cooldown).then_some(ends_at),
        };
    }

    progress.record(item.clone());
    let mut cooldown = state.cooldown;
    let mut cooldown_started = None;
    if progress.is_complete() {
        // The final item may still be watched
        let ends_at = progress.start_cooldown(now + cooldowns.after_count);
        cooldown = Some(Cooldown::until(ends_at));
        if !had_cooldown {
            cooldown_started = Some(ends_at);
        }
    }

    Transition {
        verdict: Verdict::Allow,
        next: KeyState {
            session: Some(Session {
                started_at: session.started_at,
                last_active_at: now,
                terms: SessionTerms::Count(progress),
            }),
            cooldown,
        },
        ended: None,
        cooldown_started,
    }
}

/// Outcome of starting a session on one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StartTransition {
    pub next: KeyState,
    pub session: Session,
    /// Sessions that ended on the way: lazily expired or replaced
    pub ended: Option<Ended>,
    pub cooldown_started: Option<DateTime<Local>>,
    pub bypassed_cooldown: bool,
}

pub(crate) fn check_request(request: &SessionRequest) -> Result<(), StartDenied> {
    let invalid = |message: String| Err(StartDenied::InvalidParameter { message });
    match *request {
        SessionRequest::Unlimited => Ok(()),
        SessionRequest::Duration { minutes } if minutes == 0 || minutes > MAX_DURATION_MINUTES => {
            invalid(format!("minutes must be between 1 and {MAX_DURATION_MINUTES}"))
        }
        SessionRequest::Count { items } if items == 0 || items > MAX_COUNT_ITEMS => {
            invalid(format!("items must be between 1 and {MAX_COUNT_ITEMS}"))
        }
        _ => Ok(()),
    }
}

/// Replace whatever the key holds with a new session.
///
/// Time-based expiry is applied first, so an overdue duration session turns
/// into its cooldown before the cooldown check runs. Only unlimited sessions
/// (paid for with quota by the caller) may start during a cooldown.
pub(crate) fn start_state(
    state: &KeyState,
    now: DateTime<Local>,
    request: SessionRequest,
    item: Option<&ItemId>,
    cooldowns: &CooldownPolicy,
) -> Result<StartTransition, StartDenied> {
    let settled = evaluate_state(state, now, None, cooldowns);
    let active_cooldown = settled.next.cooldown.filter(|c| c.is_active(now));

    let ended = settled.ended.or_else(|| {
        settled.next.session.as_ref().map(|previous| Ended {
            kind: previous.kind(),
            reason: SessionEndReason::Replaced,
        })
    });

    let mut cooldown_started = None;
    let (session, cooldown) = match request {
        SessionRequest::Unlimited => (Session::unlimited(now), None),
        SessionRequest::Duration { minutes } => {
            if let Some(cooldown) = active_cooldown {
                return Err(StartDenied::CooldownActive {
                    ends_at: cooldown.ends_at,
                });
            }
            let ends_at = now + chrono::Duration::minutes(i64::from(minutes));
            let session = Session::duration(now, ends_at, ends_at + cooldowns.after_duration);
            (session, None)
        }
        SessionRequest::Count { items } => {
            if let Some(cooldown) = active_cooldown {
                return Err(StartDenied::CooldownActive {
                    ends_at: cooldown.ends_at,
                });
            }
            let mut progress = CountProgress::new(items);
            let mut cooldown = None;
            if let Some(item) = item {
                progress.record(item.clone());
            }
            if progress.is_complete() {
                let ends_at = progress.start_cooldown(now + cooldowns.after_count);
                cooldown = Some(Cooldown::until(ends_at));
                cooldown_started = Some(ends_at);
            }
            let session = Session {
                started_at: now,
                last_active_at: now,
                terms: SessionTerms::Count(progress),
            };
            (session, cooldown)
        }
    };

    Ok(StartTransition {
        next: KeyState {
            session: Some(session.clone()),
            cooldown,
        },
        session,
        ended,
        cooldown_started,
        bypassed_cooldown: active_cooldown.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 10, h, m, s).unwrap()
    }

    fn cooldowns() -> CooldownPolicy {
        CooldownPolicy {
            after_duration: chrono::Duration::minutes(30),
            after_count: chrono::Duration::minutes(30),
        }
    }

    fn with_session(session: Session) -> KeyState {
        KeyState {
            session: Some(session),
            cooldown: None,
        }
    }

    fn item(id: &str) -> ItemId {
        ItemId::new(id)
    }

    #[test]
    fn empty_state_requires_start() {
        let tr = evaluate_state(&KeyState::default(), t(12, 0, 0), None, &cooldowns());
        assert_eq!(tr.verdict, Verdict::StartRequired);
        assert!(tr.next.is_empty());
    }

    #[test]
    fn active_cooldown_denies_and_elapsed_one_is_cleaned() {
        let state = KeyState {
            session: None,
            cooldown: Some(Cooldown::until(t(12, 30, 0))),
        };

        let tr = evaluate_state(&state, t(12, 0, 0), None, &cooldowns());
        assert_eq!(
            tr.verdict,
            Verdict::Cooldown {
                ends_at: t(12, 30, 0)
            }
        );
        assert_eq!(tr.next, state);

        let tr = evaluate_state(&state, t(12, 30, 0), None, &cooldowns());
        assert_eq!(tr.verdict, Verdict::StartRequired);
        assert!(tr.next.is_empty());
    }

    #[test]
    fn unlimited_activity_is_throttled() {
        let state = with_session(Session::unlimited(t(12, 0, 0)));

        let tr = evaluate_state(&state, t(12, 0, 5), None, &cooldowns());
        assert_eq!(tr.verdict, Verdict::Allow);
        assert_eq!(tr.next, state, "no write within the throttle window");

        let tr = evaluate_state(&state, t(12, 0, 6), None, &cooldowns());
        assert_eq!(tr.verdict, Verdict::Allow);
        assert_eq!(tr.next.session.unwrap().last_active_at, t(12, 0, 6));
    }

    #[test]
    fn unlimited_idle_timeout_deletes_without_cooldown() {
        let state = with_session(Session::unlimited(t(12, 0, 0)));

        let tr = evaluate_state(&state, t(12, 20, 0), None, &cooldowns());
        assert_eq!(tr.verdict, Verdict::Allow);

        let tr = evaluate_state(&state, t(12, 20, 1), None, &cooldowns());
        assert_eq!(tr.verdict, Verdict::SessionExpired);
        assert!(tr.next.is_empty());
        assert_eq!(tr.ended.unwrap().reason, SessionEndReason::IdleTimeout);
    }

    #[test]
    fn duration_boundary() {
        let ends_at = t(12, 15, 0);
        let state = with_session(Session::duration(t(12, 0, 0), ends_at, t(12, 45, 0)));
        let ms = chrono::Duration::milliseconds(1);

        let tr = evaluate_state(&state, ends_at - ms, None, &cooldowns());
        assert_eq!(tr.verdict, Verdict::Allow);
        assert_eq!(tr.next, state);

        let tr = evaluate_state(&state, ends_at + ms, None, &cooldowns());
        assert_eq!(tr.verdict, Verdict::SessionExpired);
        assert!(tr.next.session.is_none());
        assert_eq!(tr.next.cooldown, Some(Cooldown::until(t(12, 45, 0))));
        assert_eq!(tr.cooldown_started, Some(t(12, 45, 0)));
    }

    #[test]
    fn duration_cooldown_uses_precomputed_end_even_when_checked_late() {
        let state = with_session(Session::duration(t(12, 0, 0), t(12, 15, 0), t(12, 45, 0)));

        let tr = evaluate_state(&state, t(12, 40, 0), None, &cooldowns());
        assert_eq!(tr.next.cooldown, Some(Cooldown::until(t(12, 45, 0))));

        // Checked after the cooldown would have ended: nothing left to write
        let tr = evaluate_state(&state, t(13, 0, 0), None, &cooldowns());
        assert_eq!(tr.verdict, Verdict::SessionExpired);
        assert!(tr.next.is_empty());
    }

    #[test]
    fn count_session_walkthrough() {
        let cd = cooldowns();
        let mut state = with_session(Session::count(t(12, 0, 0), 3));

        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let tr = evaluate_state(&state, t(12, i as u32 + 1, 0), Some(&item(id)), &cd);
            assert_eq!(tr.verdict, Verdict::Allow);
            state = tr.next;
        }

        let session = state.session.clone().unwrap();
        let progress = session.count_progress().unwrap();
        assert_eq!(progress.items_counted(), 3);
        assert_eq!(progress.cooldown_ends_at(), Some(t(12, 33, 0)));
        assert_eq!(state.cooldown, Some(Cooldown::until(t(12, 33, 0))));

        // A fourth distinct item is refused, history kept, count unchanged
        let tr = evaluate_state(&state, t(12, 10, 0), Some(&item("d")), &cd);
        assert_eq!(tr.verdict, Verdict::LimitReached);
        let progress = tr.next.session.as_ref().unwrap().count_progress().unwrap().clone();
        assert_eq!(progress.items_counted(), 3);
        assert_eq!(progress.cooldown_ends_at(), Some(t(12, 33, 0)));
        assert_eq!(tr.cooldown_started, None);

        // Revisiting a counted item is fine
        let tr = evaluate_state(&state, t(12, 11, 0), Some(&item("b")), &cd);
        assert_eq!(tr.verdict, Verdict::Allow);
        assert_eq!(
            tr.next.session.unwrap().count_progress().unwrap().items_counted(),
            3
        );

        // After the cooldown everything is forgotten
        let tr = evaluate_state(&state, t(12, 33, 1), Some(&item("b")), &cd);
        assert_eq!(tr.verdict, Verdict::SessionExpired);
        assert!(tr.next.is_empty());
        assert_eq!(tr.ended.unwrap().reason, SessionEndReason::CooldownElapsed);
    }

    #[test]
    fn count_limit_without_prior_cooldown_starts_one() {
        // A stored session at its target but without a cooldown end (e.g. an
        // older record) gets one on the first refused item.
        let progress = CountProgress::from_parts(1, [item("a")].into_iter().collect(), None);
        let state = with_session(Session {
            started_at: t(12, 0, 0),
            last_active_at: t(12, 0, 0),
            terms: SessionTerms::Count(progress),
        });

        let tr = evaluate_state(&state, t(12, 5, 0), Some(&item("b")), &cooldowns());
        assert_eq!(tr.verdict, Verdict::LimitReached);
        assert_eq!(tr.cooldown_started, Some(t(12, 35, 0)));
        assert_eq!(tr.next.cooldown, Some(Cooldown::until(t(12, 35, 0))));
    }

    #[test]
    fn count_abandonment_creates_no_cooldown() {
        let state = with_session(Session::count(t(12, 0, 0), 3));
        let tr = evaluate_state(&state, t(14, 0, 1), Some(&item("a")), &cooldowns());
        assert_eq!(tr.verdict, Verdict::SessionExpired);
        assert!(tr.next.is_empty());
        assert_eq!(tr.ended.unwrap().reason, SessionEndReason::Abandoned);
    }

    #[test]
    fn count_without_item_only_touches() {
        let state = with_session(Session::count(t(12, 0, 0), 3));
        let tr = evaluate_state(&state, t(12, 1, 0), None, &cooldowns());
        assert_eq!(tr.verdict, Verdict::Allow);
        let session = tr.next.session.unwrap();
        assert_eq!(session.last_active_at, t(12, 1, 0));
        assert_eq!(session.count_progress().unwrap().items_counted(), 0);
    }

    #[test]
    fn start_duration_refused_during_cooldown() {
        let state = KeyState {
            session: None,
            cooldown: Some(Cooldown::until(t(12, 30, 0))),
        };
        let result = start_state(
            &state,
            t(12, 0, 0),
            SessionRequest::Duration { minutes: 10 },
            None,
            &cooldowns(),
        );
        assert_eq!(
            result.unwrap_err(),
            StartDenied::CooldownActive {
                ends_at: t(12, 30, 0)
            }
        );
    }

    #[test]
    fn start_over_overdue_duration_hits_its_cooldown() {
        let state = with_session(Session::duration(t(12, 0, 0), t(12, 15, 0), t(12, 45, 0)));
        let result = start_state(
            &state,
            t(12, 20, 0),
            SessionRequest::Count { items: 2 },
            None,
            &cooldowns(),
        );
        assert!(matches!(result, Err(StartDenied::CooldownActive { .. })));
    }

    #[test]
    fn unlimited_start_clears_cooldown() {
        let state = KeyState {
            session: None,
            cooldown: Some(Cooldown::until(t(12, 30, 0))),
        };
        let start = start_state(
            &state,
            t(12, 0, 0),
            SessionRequest::Unlimited,
            None,
            &cooldowns(),
        )
        .unwrap();

        assert!(start.bypassed_cooldown);
        assert!(start.next.cooldown.is_none());
        assert_eq!(start.session.kind(), SessionKind::Unlimited);
    }

    #[test]
    fn start_count_counts_starting_item() {
        let start = start_state(
            &KeyState::default(),
            t(12, 0, 0),
            SessionRequest::Count { items: 1 },
            Some(&item("a")),
            &cooldowns(),
        )
        .unwrap();

        let progress = start.session.count_progress().unwrap();
        assert_eq!(progress.items_counted(), 1);
        assert_eq!(progress.cooldown_ends_at(), Some(t(12, 30, 0)));
        assert_eq!(start.next.cooldown, Some(Cooldown::until(t(12, 30, 0))));
    }

    #[test]
    fn replacing_a_live_session_is_reported() {
        let state = with_session(Session::unlimited(t(12, 0, 0)));
        let start = start_state(
            &state,
            t(12, 1, 0),
            SessionRequest::Duration { minutes: 5 },
            None,
            &cooldowns(),
        )
        .unwrap();

        assert_eq!(
            start.ended,
            Some(Ended {
                kind: SessionKind::Unlimited,
                reason: SessionEndReason::Replaced
            })
        );
        assert_eq!(start.session.ends_at(), Some(t(12, 6, 0)));
        assert_eq!(start.session.cooldown_ends_at(), Some(t(12, 36, 0)));
    }

    #[test]
    fn request_bounds() {
        assert!(check_request(&SessionRequest::Unlimited).is_ok());
        assert!(check_request(&SessionRequest::Duration { minutes: 0 }).is_err());
        assert!(check_request(&SessionRequest::Duration { minutes: 15 }).is_ok());
        assert!(check_request(&SessionRequest::Count { items: 0 }).is_err());
        assert!(check_request(&SessionRequest::Count { items: MAX_COUNT_ITEMS + 1 }).is_err());
    }
}
