//! Distributed event-bus adapter (spec §4.3): channel-pattern pub/sub for
//! job and cache events, wrapped in the circuit breaker, with upstream
//! subscription dedup so N local subscribers to the same pattern share one
//! transport subscription. Grounded on `rcommerce-core`'s
//! `cache::pubsub::{RedisPubSub, BroadcastManager}` — this module plays the
//! same role the `BroadcastManager` does there (local fan-out plus a
//! distributed transport underneath), generalized from cache-invalidation
//! messages to the job-event envelope.

use crate::circuit_breaker::{BreakerState, CircuitBreaker, CircuitError};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use wildmatch::WildMatch;

/// A soft ceiling on serialized payload size; crossing it is logged but
/// never blocks the publish (spec §4.3 "Publish path").
const PAYLOAD_WARN_BYTES: usize = 64 * 1024;

/// The cross-process event envelope (spec §3 "Event envelope").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub origin_id: String,
    pub correlation_id: Option<String>,
    pub sequence: Option<u64>,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, data: Value, origin_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: chrono::Utc::now(),
            origin_id: origin_id.into(),
            correlation_id: None,
            sequence: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("PUBLISH failed for channel {channel:?}: {message}")]
    Publish { channel: String, message: String },

    #[error("breaker open (resets in {reset_timeout_ms}ms)")]
    BreakerOpen { reset_timeout_ms: u64 },
}

impl<E: std::error::Error> From<CircuitError<E>> for EventBusError {
    fn from(err: CircuitError<E>) -> Self {
        match err {
            CircuitError::Open { reset_timeout_ms, .. } => EventBusError::BreakerOpen { reset_timeout_ms },
            CircuitError::Inner(inner) => EventBusError::Publish {
                channel: String::new(),
                message: inner.to_string(),
            },
        }
    }
}

/// The health shape exposed by `health_check` (spec §4.3 "Health check").
#[derive(Debug, Clone)]
pub struct BusHealth {
    pub healthy: bool,
    pub connected: bool,
    pub breaker_state: BreakerState,
    pub detail: Option<String>,
}

/// An async callback invoked for every inbound event whose type matches
/// the subscriber's pattern.
pub type EventHandler = Arc<dyn Fn(EventEnvelope) + Send + Sync>;

/// The bus contract: publish an envelope, subscribe a pattern, report
/// health. Transport-agnostic so tests can swap in a local-only bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), EventBusError>;

    /// Returns an unsubscribe closure. When the pattern's last handler is
    /// removed, the upstream subscription for that pattern is released.
    fn subscribe(&self, pattern: &str, handler: EventHandler) -> Box<dyn FnOnce() + Send>;

    async fn health_check(&self) -> BusHealth;
}

struct PatternSubscription {
    pattern: WildMatch,
    handlers: DashMap<u64, EventHandler>,
}

/// In-process transport: every published envelope is broadcast to every
/// local pattern subscription whose pattern matches. Used standalone for a
/// single-process deployment, or composed by a distributed adapter (e.g.
/// one built on `redis::aio::PubSub`) as the "local fan-out" half of the
/// pattern `rcommerce-core`'s `BroadcastManager` establishes.
pub struct LocalEventBus {
    origin_id: String,
    breaker: CircuitBreaker,
    patterns: Arc<DashMap<String, PatternSubscription>>,
    next_handler_id: AtomicU64,
    connected: AtomicBool,
}

impl LocalEventBus {
    pub fn new(origin_id: impl Into<String>) -> Self {
        Self::with_breaker(origin_id, CircuitBreaker::new(Default::default()))
    }

    pub fn with_breaker(origin_id: impl Into<String>, breaker: CircuitBreaker) -> Self {
        Self {
            origin_id: origin_id.into(),
            breaker,
            patterns: Arc::new(DashMap::new()),
            next_handler_id: AtomicU64::new(0),
            connected: AtomicBool::new(true),
        }
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    fn dispatch(&self, envelope: &EventEnvelope) {
        for entry in self.patterns.iter() {
            if !entry.pattern.matches(&envelope.event_type) {
                continue;
            }
            for handler in entry.handlers.iter() {
                let handler = handler.value().clone();
                let envelope = envelope.clone();
                // One handler panicking must not stop dispatch to others
                // (spec §4.3 "Message dispatch"); run each on its own task
                // so a panicking callback can't unwind through the caller.
                tokio::spawn(async move {
                    let result = std::panic::AssertUnwindSafe(async { handler(envelope) })
                        .catch_unwind()
                        .await;
                    if result.is_err() {
                        warn!("event handler panicked during dispatch");
                    }
                });
            }
        }
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), EventBusError> {
        let channel = format!("events:{}", envelope.event_type);
        let size = serde_json::to_vec(&envelope).map(|v| v.len()).unwrap_or(0);
        if size > PAYLOAD_WARN_BYTES {
            warn!(channel = %channel, bytes = size, "event payload above soft size threshold");
        }

        let envelope_for_breaker = envelope.clone();
        let bus = self;
        self.breaker
            .execute(|| async move {
                bus.dispatch(&envelope_for_breaker);
                Ok::<_, std::convert::Infallible>(())
            })
            .await
            .map_err(|err: CircuitError<std::convert::Infallible>| match err {
                CircuitError::Open { reset_timeout_ms, .. } => EventBusError::BreakerOpen { reset_timeout_ms },
                CircuitError::Inner(never) => match never {},
            })?;
        debug!(channel = %channel, "event published");
        Ok(())
    }

    fn subscribe(&self, pattern: &str, handler: EventHandler) -> Box<dyn FnOnce() + Send> {
        let handler_id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.patterns
            .entry(pattern.to_string())
            .or_insert_with(|| PatternSubscription {
                pattern: WildMatch::new(pattern),
                handlers: DashMap::new(),
            })
            .handlers
            .insert(handler_id, handler);

        let patterns = self.patterns.clone();
        let pattern = pattern.to_string();
        Box::new(move || {
            if let Some(sub) = patterns.get(&pattern) {
                sub.handlers.remove(&handler_id);
                let empty = sub.handlers.is_empty();
                drop(sub);
                if empty {
                    patterns.remove(&pattern);
                }
            }
        })
    }

    async fn health_check(&self) -> BusHealth {
        let connected = self.connected.load(Ordering::SeqCst);
        let breaker_state = self.breaker.state().await;
        let healthy = connected && breaker_state != BreakerState::Open;
        BusHealth {
            healthy,
            connected,
            breaker_state,
            detail: (!healthy).then(|| format!("connected={connected} breaker={breaker_state:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[tokio::test]
    async fn matching_pattern_receives_event() {
        let bus = LocalEventBus::new("proc-a");
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let _unsub = bus.subscribe(
            "job:*",
            Arc::new(move |e: EventEnvelope| received_clone.lock().unwrap().push(e.event_type)),
        );

        bus.publish(EventEnvelope::new("job:completed", Value::Null, "proc-a"))
            .await
            .unwrap();
        bus.publish(EventEnvelope::new("cache:set", Value::Null, "proc-a"))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let seen = received.lock().unwrap().clone();
        assert_eq!(seen, vec!["job:completed".to_string()]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_releases_pattern() {
        let bus = LocalEventBus::new("proc-a");
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let unsubscribe = bus.subscribe("job:*", Arc::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(EventEnvelope::new("job:queued", Value::Null, "proc-a"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        unsubscribe();
        assert!(bus.patterns.is_empty());

        bus.publish(EventEnvelope::new("job:queued", Value::Null, "proc-a"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shared_pattern_dedupes_to_one_upstream_entry() {
        let bus = LocalEventBus::new("proc-a");
        let _a = bus.subscribe("job:*", Arc::new(|_| {}));
        let _b = bus.subscribe("job:*", Arc::new(|_| {}));
        assert_eq!(bus.patterns.len(), 1);
        assert_eq!(bus.patterns.get("job:*").unwrap().handlers.len(), 2);
    }

    #[tokio::test]
    async fn healthy_when_connected_and_breaker_closed() {
        let bus = LocalEventBus::new("proc-a");
        let health = bus.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.breaker_state, BreakerState::Closed);
    }
}
