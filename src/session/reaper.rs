//! Background eviction of idle sessions

use super::ConversationStore;
use crate::broker::EventBroker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often the reaper sweeps by default
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

const EXPIRY_NOTICE: &str = "세션이 만료되었습니다. 새 세션을 시작해주세요.";

/// Notified for every session the reaper evicts
pub trait ExpiryListener: Send + Sync {
    fn session_expired(&self, session_id: &str);
}

pub struct SessionReaper {
    store: Arc<ConversationStore>,
    broker: Arc<EventBroker>,
    listeners: Vec<Arc<dyn ExpiryListener>>,
    interval: Duration,
    max_connection_age: Option<Duration>,
}

impl SessionReaper {
    pub fn new(store: Arc<ConversationStore>, broker: Arc<EventBroker>) -> Self {
        Self {
            store,
            broker,
            listeners: Vec::new(),
            interval: REAP_INTERVAL,
            max_connection_age: None,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_connection_age(mut self, age: Duration) -> Self {
        self.max_connection_age = Some(age);
        self
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn ExpiryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Run one sweep, returning the ids of the evicted sessions
    pub fn sweep(&self) -> Vec<String> {
        let expired = self.store.sweep_expired();
        for session_id in &expired {
            self.broker.expire_channel(session_id, EXPIRY_NOTICE);
            for listener in &self.listeners {
                listener.session_expired(session_id);
            }
        }

        let stale = self
            .max_connection_age
            .map_or(0, |age| self.broker.close_stale_subscriptions(age));

        if !expired.is_empty() || stale > 0 {
            tracing::info!(
                expired = expired.len(),
                stale_connections = stale,
                remaining = self.store.active_count(),
                "Session sweep complete"
            );
        }
        expired
    }

    /// Sweep on a fixed interval until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::info!("Session reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
        })
    }
}
