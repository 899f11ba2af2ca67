//! Per-session event broker
//!
//! Each session owns one bounded channel. Producers publish without ever
//! waiting: when the queue is full the oldest event is evicted. At most one
//! subscriber reads a channel; a new subscription takes over from the old one.

mod channel;
mod event;

pub use event::StreamEvent;
#[cfg(test)]
pub use event::EventKind;

use channel::{Channel, Permit, SubscriberSlot};
use futures::stream::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Events buffered per session before the oldest are dropped
pub const CHANNEL_CAPACITY: usize = 256;

/// Maximum concurrent subscriptions across all sessions
pub const MAX_SUBSCRIPTIONS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("Connection limit exceeded ({limit} concurrent streams)")]
    ConnectionLimitExceeded { limit: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub channels: usize,
    pub live_subscriptions: usize,
    pub max_subscriptions: usize,
    pub dropped_events: u64,
}

pub struct EventBroker {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    live: Arc<AtomicUsize>,
    next_subscriber: AtomicU64,
    capacity: usize,
    max_subscriptions: usize,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroker {
    pub fn new() -> Self {
        Self::with_limits(CHANNEL_CAPACITY, MAX_SUBSCRIPTIONS)
    }

    pub fn with_limits(capacity: usize, max_subscriptions: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            live: Arc::new(AtomicUsize::new(0)),
            next_subscriber: AtomicU64::new(1),
            capacity,
            max_subscriptions,
        }
    }

    fn channel(&self, session_id: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Create the session's channel if it does not exist yet, returning a
    /// sender bound to it
    pub fn open_channel(&self, session_id: &str) -> EventSender {
        if let Some(channel) = self.channel(session_id) {
            return EventSender { channel };
        }
        let channel = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Channel::new(session_id, self.capacity)))
            .clone();
        EventSender { channel }
    }

    /// Attach a subscriber to the session's channel.
    ///
    /// A session that already has a subscriber hands its slot to the new one
    /// and the old stream ends with `session_end`. Otherwise a slot is taken
    /// from the global limit before any channel is allocated.
    pub fn subscribe(&self, session_id: &str) -> Result<Subscription, BrokerError> {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(channel) = channels.get(session_id) {
            let mut state = channel.lock();
            if let Some(slot) = state.subscriber.as_mut() {
                let previous = slot.id;
                slot.id = id;
                slot.connected_at = Instant::now();
                let greeting = state.greet(StreamEvent::session_start(session_id));
                drop(state);
                channel.notify.notify_waiters();
                tracing::info!(
                    session_id = %session_id,
                    previous_subscriber = previous,
                    subscriber = id,
                    "Subscription superseded"
                );
                return Ok(Subscription::new(channel.clone(), id, greeting));
            }
        }

        let permit = Permit::acquire(&self.live, self.max_subscriptions).ok_or_else(|| {
            tracing::warn!(
                session_id = %session_id,
                limit = self.max_subscriptions,
                "Subscription rejected, connection limit reached"
            );
            BrokerError::ConnectionLimitExceeded {
                limit: self.max_subscriptions,
            }
        })?;

        let channel = channels
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Channel::new(session_id, self.capacity)))
            .clone();
        let greeting = {
            let mut state = channel.lock();
            state.subscriber = Some(SubscriberSlot {
                id,
                connected_at: Instant::now(),
                _permit: permit,
            });
            state.greet(StreamEvent::session_start(session_id))
        };
        drop(channels);

        tracing::info!(
            session_id = %session_id,
            subscriber = id,
            live = self.live.load(Ordering::SeqCst),
            "Subscription opened"
        );
        Ok(Subscription::new(channel, id, greeting))
    }

    /// Queue an event for the session. Returns the assigned sequence number,
    /// or `None` when the session has no open channel.
    #[cfg(test)]
    pub fn publish(&self, session_id: &str, event: StreamEvent) -> Option<u64> {
        let Some(channel) = self.channel(session_id) else {
            tracing::debug!(session_id = %session_id, kind = ?event.kind, "No channel, event dropped");
            return None;
        };
        channel.publish(event)
    }

    /// Close the channel without notifying the subscriber beyond ending its stream
    pub fn close_channel(&self, session_id: &str) {
        self.shutdown_channel(session_id, None);
    }

    /// Force-close a channel on expiry, delivering a terminal error event to a
    /// connected subscriber when the queue has room for it
    pub fn expire_channel(&self, session_id: &str, reason: &str) {
        self.shutdown_channel(session_id, Some(reason));
    }

    fn shutdown_channel(&self, session_id: &str, error: Option<&str>) {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        let Some(channel) = removed else {
            return;
        };

        let mut state = channel.lock();
        if let (Some(reason), true) = (error, state.subscriber.is_some()) {
            if state.queue.len() < channel.capacity {
                state.push(StreamEvent::error(session_id, reason), channel.capacity);
            } else {
                tracing::warn!(session_id = %session_id, "Channel full, expiry notice not delivered");
            }
        }
        state.closed_owner = state.subscriber_id();
        state.subscriber = None;
        state.closed = true;
        drop(state);

        channel.notify.notify_waiters();
        tracing::info!(session_id = %session_id, "Channel closed");
    }

    /// Detach subscribers connected for longer than `max_age`
    pub fn close_stale_subscriptions(&self, max_age: Duration) -> usize {
        let channels: Vec<Arc<Channel>> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut closed = 0;
        for channel in channels {
            let mut state = channel.lock();
            let stale = state
                .subscriber
                .as_ref()
                .is_some_and(|s| s.connected_at.elapsed() >= max_age);
            if stale {
                state.subscriber = None;
                drop(state);
                channel.notify.notify_waiters();
                tracing::info!(session_id = %channel.session_id, "Stale subscription closed");
                closed += 1;
            }
        }
        closed
    }

    pub fn live_subscriptions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn has_channel(&self, session_id: &str) -> bool {
        self.channel(session_id).is_some()
    }

    pub fn stats(&self) -> BrokerStats {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        BrokerStats {
            channels: channels.len(),
            live_subscriptions: self.live_subscriptions(),
            max_subscriptions: self.max_subscriptions,
            dropped_events: channels.values().map(|c| c.lock().dropped).sum(),
        }
    }
}

/// Write side bound to one channel instance. Once that channel closes,
/// publishing through it is a no-op even if the session id gets a new channel.
#[derive(Clone)]
pub struct EventSender {
    channel: Arc<Channel>,
}

impl EventSender {
    pub fn publish(&self, event: StreamEvent) -> Option<u64> {
        self.channel.publish(event)
    }
}

/// Read side of a session channel.
///
/// Ends when the channel closes (after draining what is queued) or when a
/// newer subscription takes over. Dropping it releases the subscription slot.
pub struct Subscription {
    channel: Arc<Channel>,
    id: u64,
    greeting: Option<StreamEvent>,
    finished: bool,
}

impl Subscription {
    fn new(channel: Arc<Channel>, id: u64, greeting: StreamEvent) -> Self {
        Self {
            channel,
            id,
            greeting: Some(greeting),
            finished: false,
        }
    }

    /// Next event, or `None` once the stream is over
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        if let Some(greeting) = self.greeting.take() {
            return Some(greeting);
        }

        loop {
            // Registered before the state check so a publish in between is not missed
            let notified = self.channel.notify.notified();
            {
                let mut state = self.channel.lock();
                // Checked before `closed` so a stream that was taken over never
                // drains what its successor is owed
                if state.owner() != Some(self.id) {
                    self.finished = true;
                    let end = StreamEvent::session_end(&self.channel.session_id, "superseded");
                    return Some(state.stamp(end));
                }
                if state.closed {
                    let next = state.queue.pop_front();
                    if next.is_none() {
                        self.finished = true;
                    }
                    return next;
                }
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
            }
            notified.await;
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.channel.lock();
        if state.subscriber_id() == Some(self.id) {
            state.subscriber = None;
            tracing::debug!(
                session_id = %self.channel.session_id,
                subscriber = self.id,
                "Subscriber disconnected"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(sub: &mut Subscription) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_subscribe_starts_with_session_start() {
        let broker = EventBroker::new();
        let mut sub = broker.subscribe("s1").unwrap();

        let first = next(&mut sub).await;
        assert_eq!(first.kind, EventKind::SessionStart);
        assert_eq!(first.sequence, 0);
        assert_eq!(broker.live_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_publish_delivers_in_order_with_sequences() {
        let broker = EventBroker::new();
        let mut sub = broker.subscribe("s1").unwrap();
        next(&mut sub).await;

        broker.publish("s1", StreamEvent::thinking("s1", 1, "a"));
        broker.publish("s1", StreamEvent::partial_response("s1", "b"));
        broker.publish("s1", StreamEvent::final_response("s1", "c"));

        let events = [next(&mut sub).await, next(&mut sub).await, next(&mut sub).await];
        let contents: Vec<_> = events.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["a", "b", "c"]);
        let sequences: Vec<_> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, [1, 2, 3]);
    }

    #[tokio::test]
    async fn test_publish_wakes_waiting_subscriber() {
        let broker = Arc::new(EventBroker::new());
        let mut sub = broker.subscribe("s1").unwrap();
        next(&mut sub).await;

        let reader = tokio::spawn(async move { sub.recv().await });
        tokio::task::yield_now().await;
        broker.publish("s1", StreamEvent::final_response("s1", "done"));

        let event = reader.await.unwrap().unwrap();
        assert_eq!(event.content, "done");
    }

    #[tokio::test]
    async fn test_full_channel_drops_oldest() {
        let broker = EventBroker::with_limits(4, MAX_SUBSCRIPTIONS);
        broker.open_channel("s1");
        for i in 1..=6 {
            broker.publish("s1", StreamEvent::partial_response("s1", i.to_string()));
        }

        let mut sub = broker.subscribe("s1").unwrap();
        next(&mut sub).await;
        let mut contents = Vec::new();
        for _ in 0..4 {
            contents.push(next(&mut sub).await.content);
        }
        assert_eq!(contents, ["3", "4", "5", "6"]);
        assert_eq!(broker.stats().dropped_events, 2);
    }

    #[test]
    fn test_publish_without_channel_is_dropped() {
        let broker = EventBroker::new();
        assert_eq!(broker.publish("nobody", StreamEvent::final_response("nobody", "x")), None);
    }

    #[test]
    fn test_open_channel_is_idempotent() {
        let broker = EventBroker::new();
        broker.open_channel("s1");
        broker.publish("s1", StreamEvent::partial_response("s1", "kept"));
        broker.open_channel("s1");

        assert_eq!(broker.stats().channels, 1);
        assert_eq!(broker.publish("s1", StreamEvent::partial_response("s1", "x")), Some(2));
    }

    #[tokio::test]
    async fn test_new_subscription_supersedes_old() {
        let broker = EventBroker::new();
        let mut old = broker.subscribe("s1").unwrap();
        next(&mut old).await;

        let mut new = broker.subscribe("s1").unwrap();
        assert_eq!(broker.live_subscriptions(), 1);

        let end = next(&mut old).await;
        assert_eq!(end.kind, EventKind::SessionEnd);
        assert!(old.recv().await.is_none());

        next(&mut new).await;
        broker.publish("s1", StreamEvent::final_response("s1", "for new"));
        assert_eq!(next(&mut new).await.content, "for new");

        // Dropping the superseded subscription must not free the new one's slot
        drop(old);
        assert_eq!(broker.live_subscriptions(), 1);
    }

    #[test]
    fn test_connection_limit() {
        let broker = EventBroker::new();
        let subs: Vec<_> = (0..MAX_SUBSCRIPTIONS)
            .map(|i| broker.subscribe(&format!("s{i}")).unwrap())
            .collect();

        let rejected = broker.subscribe("one-too-many");
        assert_eq!(
            rejected.err(),
            Some(BrokerError::ConnectionLimitExceeded { limit: MAX_SUBSCRIPTIONS })
        );
        assert!(!broker.has_channel("one-too-many"));
        assert_eq!(broker.live_subscriptions(), MAX_SUBSCRIPTIONS);

        // Existing sessions keep working and may still reconnect
        assert!(broker.publish("s0", StreamEvent::final_response("s0", "ok")).is_some());
        let _again = broker.subscribe("s1").unwrap();

        drop(subs);
        assert_eq!(broker.live_subscriptions(), 1);
        assert!(broker.subscribe("one-too-many").is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_respect_limit() {
        let broker = Arc::new(EventBroker::new());
        let handles: Vec<_> = (0..=MAX_SUBSCRIPTIONS)
            .map(|i| {
                let broker = broker.clone();
                tokio::spawn(async move { broker.subscribe(&format!("session-{i}")) })
            })
            .collect();

        let mut held = Vec::new();
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(sub) => held.push(sub),
                Err(BrokerError::ConnectionLimitExceeded { .. }) => rejected += 1,
            }
        }
        assert_eq!(held.len(), MAX_SUBSCRIPTIONS);
        assert_eq!(rejected, 1);
    }

    #[tokio::test]
    async fn test_disconnect_frees_slot_but_keeps_channel() {
        let broker = EventBroker::new();
        let sub = broker.subscribe("s1").unwrap();
        drop(sub);

        assert_eq!(broker.live_subscriptions(), 0);
        assert!(broker.has_channel("s1"));
        broker.publish("s1", StreamEvent::final_response("s1", "buffered"));

        let mut sub = broker.subscribe("s1").unwrap();
        next(&mut sub).await;
        assert_eq!(next(&mut sub).await.content, "buffered");
    }

    #[tokio::test]
    async fn test_expire_delivers_error_then_ends() {
        let broker = EventBroker::new();
        let mut sub = broker.subscribe("s1").unwrap();
        next(&mut sub).await;
        broker.publish("s1", StreamEvent::partial_response("s1", "pending"));

        broker.expire_channel("s1", "session expired");

        assert_eq!(next(&mut sub).await.content, "pending");
        let error = next(&mut sub).await;
        assert_eq!(error.kind, EventKind::Error);
        assert_eq!(error.metadata["error"], "session expired");
        assert!(sub.recv().await.is_none());
        assert_eq!(broker.live_subscriptions(), 0);
        assert!(!broker.has_channel("s1"));
    }

    #[tokio::test]
    async fn test_expire_full_channel_skips_notice() {
        let broker = EventBroker::with_limits(2, MAX_SUBSCRIPTIONS);
        let mut sub = broker.subscribe("s1").unwrap();
        next(&mut sub).await;
        broker.publish("s1", StreamEvent::partial_response("s1", "a"));
        broker.publish("s1", StreamEvent::partial_response("s1", "b"));

        broker.expire_channel("s1", "expired");

        assert_eq!(next(&mut sub).await.content, "a");
        assert_eq!(next(&mut sub).await.content, "b");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connection_events_follow_channel_sequence() {
        let broker = EventBroker::new();
        let mut first = broker.subscribe("s1").unwrap();
        next(&mut first).await;
        for i in 1..=3 {
            broker.publish("s1", StreamEvent::partial_response("s1", i.to_string()));
        }
        for _ in 0..3 {
            next(&mut first).await;
        }
        broker.publish("s1", StreamEvent::partial_response("s1", "queued"));

        let mut second = broker.subscribe("s1").unwrap();
        let end = next(&mut first).await;
        assert_eq!(end.kind, EventKind::SessionEnd);
        assert!(end.sequence > 3);

        let start = next(&mut second).await;
        assert_eq!(start.kind, EventKind::SessionStart);
        assert_eq!(start.sequence, 3);
        let queued = next(&mut second).await;
        assert_eq!(queued.content, "queued");
        assert_eq!(queued.sequence, 4);
    }

    #[tokio::test]
    async fn test_superseded_stream_leaves_closed_queue_to_successor() {
        let broker = EventBroker::new();
        let mut old = broker.subscribe("s1").unwrap();
        next(&mut old).await;
        let mut new = broker.subscribe("s1").unwrap();
        next(&mut new).await;

        broker.publish("s1", StreamEvent::final_response("s1", "for new"));
        broker.close_channel("s1");

        assert_eq!(next(&mut old).await.kind, EventKind::SessionEnd);
        assert!(old.recv().await.is_none());
        assert_eq!(next(&mut new).await.content, "for new");
        assert!(new.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_sender_is_bound_to_one_channel() {
        let broker = EventBroker::new();
        let stale = broker.open_channel("s1");
        broker.close_channel("s1");

        let fresh = broker.open_channel("s1");
        let mut sub = broker.subscribe("s1").unwrap();
        next(&mut sub).await;

        assert_eq!(stale.publish(StreamEvent::final_response("s1", "old turn")), None);
        assert!(fresh.publish(StreamEvent::final_response("s1", "new turn")).is_some());
        assert_eq!(next(&mut sub).await.content, "new turn");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_subscriptions_are_closed() {
        let broker = EventBroker::new();
        let mut old = broker.subscribe("old").unwrap();
        next(&mut old).await;

        tokio::time::advance(Duration::from_secs(3600)).await;
        let _fresh = broker.subscribe("fresh").unwrap();

        assert_eq!(broker.close_stale_subscriptions(Duration::from_secs(3600)), 1);
        assert_eq!(next(&mut old).await.kind, EventKind::SessionEnd);
        assert_eq!(broker.live_subscriptions(), 1);
    }
}
