//! Mock scheduler for testing

use chrono::{DateTime, Local};
use gatehouse_util::MonitorKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::{HostError, HostResult, WakeEvent, WakeScheduler};

/// Records scheduling calls and fires wake-ups only when told to
pub struct MockScheduler {
    pending: Arc<Mutex<HashMap<MonitorKey, DateTime<Local>>>>,
    /// Every `schedule_at` call, in order
    pub scheduled_calls: Arc<Mutex<Vec<(MonitorKey, DateTime<Local>)>>>,
    /// Every `cancel` call, in order
    pub cancel_calls: Arc<Mutex<Vec<MonitorKey>>>,
    event_tx: mpsc::UnboundedSender<WakeEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<WakeEvent>>>,
}

impl MockScheduler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            scheduled_calls: Arc::new(Mutex::new(Vec::new())),
            cancel_calls: Arc::new(Mutex::new(Vec::new())),
            event_tx: tx,
            event_rx: Mutex::new(Some(rx)),
        }
    }

    /// Pending wake-up instant for a key
    pub fn pending_at(&self, key: &MonitorKey) -> Option<DateTime<Local>> {
        self.pending.lock().unwrap().get(key).copied()
    }

    /// Fire the pending wake-up for `key`, returning the event that was sent.
    pub fn fire(&self, key: &MonitorKey) -> Option<WakeEvent> {
        let at = self.pending.lock().unwrap().remove(key)?;
        let event = WakeEvent {
            key: key.clone(),
            at,
        };
        let _ = self.event_tx.send(event.clone());
        Some(event)
    }
}

impl Default for MockScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeScheduler for MockScheduler {
    fn schedule_at(&self, key: &MonitorKey, at: DateTime<Local>) {
        self.pending.lock().unwrap().insert(key.clone(), at);
        self.scheduled_calls.lock().unwrap().push((key.clone(), at));
    }

    fn cancel(&self, key: &MonitorKey) {
        self.pending.lock().unwrap().remove(key);
        self.cancel_calls.lock().unwrap().push(key.clone());
    }

    fn subscribe(&self) -> HostResult<mpsc::UnboundedReceiver<WakeEvent>> {
        self.event_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(HostError::AlreadySubscribed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_delivers_pending_wake_up_once() {
        let scheduler = MockScheduler::new();
        let mut rx = scheduler.subscribe().unwrap();
        let key = MonitorKey::new("reddit.com");
        let at = gatehouse_util::now();

        scheduler.schedule_at(&key, at);
        assert_eq!(scheduler.pending_at(&key), Some(at));

        assert!(scheduler.fire(&key).is_some());
        assert!(scheduler.fire(&key).is_none());
        assert_eq!(rx.try_recv().unwrap(), WakeEvent { key, at });
    }

    #[test]
    fn cancel_clears_pending() {
        let scheduler = MockScheduler::new();
        let key = MonitorKey::new("reddit.com");

        scheduler.schedule_at(&key, gatehouse_util::now());
        scheduler.cancel(&key);
        assert!(scheduler.pending_at(&key).is_none());
        assert!(scheduler.fire(&key).is_none());
        assert_eq!(scheduler.cancel_calls.lock().unwrap().len(), 1);
    }
}
