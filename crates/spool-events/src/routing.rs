//! Event bus routing helpers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};

use crate::payloads::{DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId};

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    replay: Arc<Mutex<VecDeque<EventEnvelope>>>,
    replay_capacity: usize,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Construct a bus with a custom replay capacity; zero is raised to one.
    #[must_use]
    pub fn with_capacity(replay_capacity: usize) -> Self {
        let replay_capacity = replay_capacity.max(1);
        let (sender, _) = broadcast::channel(replay_capacity);
        Self {
            sender,
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(replay_capacity))),
            replay_capacity,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Construct a bus with the default replay capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish an event, assigning it the next sequential identifier.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };
        {
            let mut replay = self.lock_replay();
            if replay.len() == self.replay_capacity {
                let _ = replay.pop_front();
            }
            replay.push_back(envelope.clone());
        }
        // No subscribers is not an error; the replay ring still keeps the event.
        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe, replaying buffered events newer than `since_id` first.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let receiver = self.sender.subscribe();
        let backlog = since_id.map_or_else(VecDeque::new, |since| {
            self.lock_replay()
                .iter()
                .filter(|envelope| envelope.id > since)
                .cloned()
                .collect()
        });
        let replayed_through = backlog.back().map(|envelope: &EventEnvelope| envelope.id);
        EventStream {
            backlog,
            receiver,
            replayed_through,
        }
    }

    /// Last assigned identifier, if any events have been published.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.lock_replay().back().map(|envelope| envelope.id)
    }

    fn lock_replay(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        self.replay.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscriber handle yielding the replay backlog first, then live events.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
    replayed_through: Option<EventId>,
}

impl EventStream {
    /// Receive the next event; `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Some(envelope);
        }
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => {
                    // Skip live copies of events already served from the backlog.
                    if self
                        .replayed_through
                        .is_some_and(|replayed| envelope.id <= replayed)
                    {
                        continue;
                    }
                    return Some(envelope);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
