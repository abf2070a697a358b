//! Per-subscriber two-lane queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::{Event, Priority};

/// What happened when an event was pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Queued,
    /// The ordinary lane was full and its oldest event was discarded.
    DroppedOldest,
    Closed,
}

#[derive(Debug, Default)]
struct Lanes {
    algedonic: VecDeque<Arc<Event>>,
    ordinary: VecDeque<Arc<Event>>,
    dropped: u64,
    closed: bool,
}

/// Bounded inbox owned by one subscriber.
///
/// The ordinary lane holds at most `capacity` events and sheds its oldest
/// entry when full. The algedonic lane is unbounded and always drained
/// first.
#[derive(Debug)]
pub(crate) struct Inbox {
    lanes: Mutex<Lanes>,
    notify: Notify,
    capacity: usize,
}

impl Inbox {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&self, event: Arc<Event>) -> PushOutcome {
        let outcome = {
            let mut lanes = self.lock();
            if lanes.closed {
                return PushOutcome::Closed;
            }
            match event.priority {
                Priority::Algedonic => {
                    lanes.algedonic.push_back(event);
                    PushOutcome::Queued
                }
                Priority::Ordinary => {
                    let mut outcome = PushOutcome::Queued;
                    if lanes.ordinary.len() >= self.capacity {
                        lanes.ordinary.pop_front();
                        lanes.dropped += 1;
                        outcome = PushOutcome::DroppedOldest;
                    }
                    lanes.ordinary.push_back(event);
                    outcome
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    pub(crate) fn try_pop(&self) -> Option<Arc<Event>> {
        let mut lanes = self.lock();
        match lanes.algedonic.pop_front() {
            Some(event) => Some(event),
            None => lanes.ordinary.pop_front(),
        }
    }

    /// Wait for the next event. Returns `None` once closed and drained.
    pub(crate) async fn pop(&self) -> Option<Arc<Event>> {
        loop {
            // Registered before the check so `close` reaches every waiter.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut lanes = self.lock();
                if let Some(event) = lanes.algedonic.pop_front() {
                    return Some(event);
                }
                if let Some(event) = lanes.ordinary.pop_front() {
                    return Some(event);
                }
                if lanes.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        let lanes = self.lock();
        lanes.algedonic.len() + lanes.ordinary.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
