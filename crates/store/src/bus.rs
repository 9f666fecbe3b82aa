use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc;

pub const MAX_SUBSCRIBERS: usize = 100;

/// Change-notification bus embedded in the store. Subscribers receive a
/// notification (not a payload) and re-read the task list; a capacity-1 slot
/// per subscriber coalesces bursts and delivery never blocks the store.
pub struct NotifyBus {
    slots: Mutex<HashMap<u64, mpsc::Sender<()>>>,
    next_id: AtomicU64,
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<()>,
}

impl NotifyBus {
    pub fn new() -> Self {
        NotifyBus {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber. Returns `None` when the subscription cap
    /// is reached; the caller surfaces a "too many" signal.
    pub fn subscribe(&self) -> Option<Subscription> {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() >= MAX_SUBSCRIBERS {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        slots.insert(id, tx);
        Some(Subscription { id, rx })
    }

    pub fn unsubscribe(&self, id: u64) {
        self.slots.lock().unwrap().remove(&id);
    }

    /// Non-blocking deposit into every slot; a full slot means the
    /// subscriber already has a pending wakeup and the signal is dropped.
    pub fn notify_all(&self) {
        let mut dead = Vec::new();
        {
            let slots = self.slots.lock().unwrap();
            for (id, tx) in slots.iter() {
                match tx.try_send(()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
                    Err(mpsc::error::TrySendError::Closed(())) => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            let mut slots = self.slots.lock().unwrap();
            for id in dead {
                slots.remove(&id);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

impl Default for NotifyBus {
    fn default() -> Self {
        Self::new()
    }
}
