//! Per-session bounded event queue

use super::StreamEvent;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;

/// A held subscription slot. Dropping it frees the slot.
pub(super) struct Permit {
    live: Arc<AtomicUsize>,
}

impl Permit {
    pub(super) fn acquire(live: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        live.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n < limit).then_some(n + 1)
        })
        .ok()
        .map(|_| Self { live: live.clone() })
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(super) struct SubscriberSlot {
    pub(super) id: u64,
    pub(super) connected_at: Instant,
    pub(super) _permit: Permit,
}

pub(super) struct ChannelState {
    pub(super) queue: VecDeque<StreamEvent>,
    pub(super) subscriber: Option<SubscriberSlot>,
    pub(super) closed: bool,
    /// Subscriber attached when the channel closed; only it drains the rest
    pub(super) closed_owner: Option<u64>,
    pub(super) dropped: u64,
    next_sequence: u64,
}

impl ChannelState {
    /// Stamp and enqueue, evicting the oldest event when full
    pub(super) fn push(&mut self, event: StreamEvent, capacity: usize) -> u64 {
        let event = self.stamp(event);
        let sequence = event.sequence;
        if self.queue.len() >= capacity {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_back(event);
        sequence
    }

    /// Give an event the next sequence number without queueing it
    pub(super) fn stamp(&mut self, mut event: StreamEvent) -> StreamEvent {
        self.next_sequence += 1;
        event.sequence = self.next_sequence;
        event
    }

    /// A connection greeting sorts just before the first event its
    /// subscriber will read
    pub(super) fn greet(&self, mut greeting: StreamEvent) -> StreamEvent {
        greeting.sequence = self
            .queue
            .front()
            .map_or(self.next_sequence, |e| e.sequence.saturating_sub(1));
        greeting
    }

    /// Whose stream this is: the attached subscriber, or once closed, the
    /// one that was attached at the time
    pub(super) fn owner(&self) -> Option<u64> {
        if self.closed {
            self.closed_owner
        } else {
            self.subscriber_id()
        }
    }

    pub(super) fn subscriber_id(&self) -> Option<u64> {
        self.subscriber.as_ref().map(|s| s.id)
    }
}

pub(super) struct Channel {
    pub(super) session_id: String,
    pub(super) capacity: usize,
    pub(super) notify: Notify,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub(super) fn new(session_id: &str, capacity: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            capacity: capacity.max(1),
            notify: Notify::new(),
            state: Mutex::new(ChannelState {
                queue: VecDeque::new(),
                subscriber: None,
                closed: false,
                closed_owner: None,
                dropped: 0,
                next_sequence: 0,
            }),
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an event and wake the subscriber. `None` once closed.
    pub(super) fn publish(&self, event: StreamEvent) -> Option<u64> {
        let mut state = self.lock();
        if state.closed {
            tracing::debug!(session_id = %self.session_id, kind = ?event.kind, "Channel closed, event dropped");
            return None;
        }
        let dropped_before = state.dropped;
        let sequence = state.push(event, self.capacity);
        if state.dropped > dropped_before {
            tracing::debug!(session_id = %self.session_id, sequence, "Channel full, oldest event dropped");
        }
        drop(state);

        self.notify.notify_waiters();
        Some(sequence)
    }
}
