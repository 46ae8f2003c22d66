//! Wake-up scheduler backed by tokio tasks

use chrono::{DateTime, Local};
use gatehouse_util::{non_negative, MonitorKey};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::{HostError, HostResult, WakeEvent, WakeScheduler};

/// Longest single sleep. Tokio timers run on the monotonic clock, which stops
/// while the machine is suspended, so the wall clock is re-checked at least
/// this often.
const MAX_SLEEP_STEP: Duration = Duration::from_secs(30);

/// One tokio task per pending key, each sleeping until its wall-clock instant
pub struct TokioScheduler {
    tasks: Mutex<HashMap<MonitorKey, JoinHandle<()>>>,
    event_tx: mpsc::UnboundedSender<WakeEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<WakeEvent>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tasks: Mutex::new(HashMap::new()),
            event_tx: tx,
            event_rx: Mutex::new(Some(rx)),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<MonitorKey, JoinHandle<()>>> {
        // A panic while holding the lock leaves nothing half-updated.
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of wake-ups not yet fired or cancelled
    pub fn pending(&self) -> usize {
        self.tasks().values().filter(|h| !h.is_finished()).count()
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn sleep_until_wall_clock(at: DateTime<Local>) {
    loop {
        let remaining = non_negative(at - gatehouse_util::now());
        if remaining.is_zero() {
            return;
        }
        tokio::time::sleep(remaining.min(MAX_SLEEP_STEP)).await;
    }
}

impl WakeScheduler for TokioScheduler {
    fn schedule_at(&self, key: &MonitorKey, at: DateTime<Local>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "No tokio runtime; wake-up not scheduled");
            return;
        };

        let tx = self.event_tx.clone();
        let task_key = key.clone();
        let handle = runtime.spawn(async move {
            sleep_until_wall_clock(at).await;
            trace!(key = %task_key, at = %at, "Wake-up fired");
            let _ = tx.send(WakeEvent { key: task_key, at });
        });

        let mut tasks = self.tasks();
        tasks.retain(|_, h| !h.is_finished());
        if let Some(previous) = tasks.insert(key.clone(), handle) {
            previous.abort();
        }
        debug!(key = %key, at = %at, "Wake-up scheduled");
    }

    fn cancel(&self, key: &MonitorKey) {
        if let Some(handle) = self.tasks().remove(key) {
            handle.abort();
            debug!(key = %key, "Wake-up cancelled");
        }
    }

    fn subscribe(&self) -> HostResult<mpsc::UnboundedReceiver<WakeEvent>> {
        self.event_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(HostError::AlreadySubscribed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MonitorKey {
        MonitorKey::new("youtube.com")
    }

    #[tokio::test]
    async fn fires_at_scheduled_instant() {
        let scheduler = TokioScheduler::new();
        let mut rx = scheduler.subscribe().unwrap();

        let at = gatehouse_util::now() + chrono::Duration::milliseconds(50);
        scheduler.schedule_at(&key(), at);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, WakeEvent { key: key(), at });
        assert!(gatehouse_util::now() >= at);
    }

    #[tokio::test]
    async fn past_instant_fires_immediately() {
        let scheduler = TokioScheduler::new();
        let mut rx = scheduler.subscribe().unwrap();

        scheduler.schedule_at(&key(), gatehouse_util::now() - chrono::Duration::minutes(5));
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(event.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancel_prevents_fire_and_is_idempotent() {
        let scheduler = TokioScheduler::new();
        let mut rx = scheduler.subscribe().unwrap();

        scheduler.schedule_at(&key(), gatehouse_util::now() + chrono::Duration::milliseconds(50));
        scheduler.cancel(&key());
        scheduler.cancel(&key());
        scheduler.cancel(&MonitorKey::new("never-scheduled.example"));

        let event = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(event.is_err(), "cancelled wake-up must not fire");
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn rescheduling_replaces_pending_wake_up() {
        let scheduler = TokioScheduler::new();
        let mut rx = scheduler.subscribe().unwrap();

        let later = gatehouse_util::now() + chrono::Duration::milliseconds(80);
        scheduler.schedule_at(&key(), gatehouse_util::now() + chrono::Duration::seconds(60));
        scheduler.schedule_at(&key(), later);
        assert_eq!(scheduler.pending(), 1);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.at, later);
    }

    #[test]
    fn second_subscribe_fails() {
        let scheduler = TokioScheduler::new();
        assert!(scheduler.subscribe().is_ok());
        assert!(matches!(
            scheduler.subscribe(),
            Err(HostError::AlreadySubscribed)
        ));
    }
}
