//! In-process pub/sub for request-lifecycle and log events.
//!
//! Each subscriber owns a bounded queue; publishing never blocks. A full or
//! closed queue drops that subscriber instead of slowing the publisher.
//! The subscriber set is copied before iteration so a handler unsubscribing
//! mid-dispatch cannot deadlock the bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};

/// Per-subscriber queue depth. Slow SSE consumers fall behind fast — a small
/// buffer bounds memory and lets the bus shed them early.
const SUBSCRIBER_QUEUE: usize = 64;

/// Hard cap on concurrent request-event subscribers.
pub const MAX_REQUEST_SUBSCRIBERS: usize = 200;

// ── Event types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestEvent {
    Start {
        id: String,
        timestamp: i64,
        method: String,
        path: String,
        account_id: Option<String>,
        status_code: u16,
        agent_used: Option<String>,
    },
    Summary {
        id: String,
        #[serde(flatten)]
        summary: Value,
    },
    Payload {
        id: String,
    },
}

impl RequestEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Start { id, .. } | Self::Summary { id, .. } | Self::Payload { id } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub timestamp: i64,
    pub level: String,
    pub target: String,
    pub message: String,
}

// ── Bus ─────────────────────────────────────────────────────────────────

struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<Arc<T>>,
}

pub struct Topic<T> {
    name: &'static str,
    max_subscribers: usize,
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber<T>>>,
}

impl<T: Send + Sync + 'static> Topic<T> {
    fn new(name: &'static str, max_subscribers: usize) -> Self {
        Self {
            name,
            max_subscribers,
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a subscriber. Returns `None` when the topic is full.
    pub async fn subscribe(&self) -> Option<Subscription<T>> {
        let mut subs = self.subscribers.write().await;
        if subs.len() >= self.max_subscribers {
            tracing::warn!(
                "event bus: `{}` at subscriber cap ({}), rejecting",
                self.name,
                self.max_subscribers
            );
            return None;
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        subs.push(Subscriber { id, tx });
        Some(Subscription { id, rx })
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.write().await.retain(|s| s.id != id);
    }

    /// Fan an event out. Subscribers whose queue is full or closed are
    /// unregistered.
    pub async fn publish(&self, event: T) {
        let event = Arc::new(event);
        // Copy-on-iterate: snapshot the sender list, drop the lock, send.
        let snapshot: Vec<(u64, mpsc::Sender<Arc<T>>)> = {
            let subs = self.subscribers.read().await;
            subs.iter().map(|s| (s.id, s.tx.clone())).collect()
        };
        let mut dead: Vec<u64> = Vec::new();
        for (id, tx) in snapshot {
            if tx.try_send(event.clone()).is_err() {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            let mut subs = self.subscribers.write().await;
            subs.retain(|s| !dead.contains(&s.id));
            tracing::debug!(
                "event bus: dropped {} slow subscriber(s) from `{}`",
                dead.len(),
                self.name
            );
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<Arc<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<T>> {
        self.rx.recv().await
    }
}

/// The two logical topics of the system.
pub struct EventBus {
    pub requests: Topic<RequestEvent>,
    pub logs: Topic<LogEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            requests: Topic::new("request.events", MAX_REQUEST_SUBSCRIBERS),
            logs: Topic::new("log.events", MAX_REQUEST_SUBSCRIBERS),
        }
    }

    pub fn start_event(
        &self,
        id: &str,
        timestamp: i64,
        method: &str,
        path: &str,
        agent_used: Option<String>,
    ) -> RequestEvent {
        RequestEvent::Start {
            id: id.to_string(),
            timestamp,
            method: method.to_string(),
            path: path.to_string(),
            account_id: None,
            status_code: 0,
            agent_used,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// SSE frame for one event: `data: <json>\n\n`.
pub fn sse_frame<T: Serialize>(event: &T) -> String {
    let data = serde_json::to_string(event)
        .unwrap_or_else(|_| json!({ "error": "encode failed" }).to_string());
    format!("data: {data}\n\n")
}

/// Initial SSE control frame every stream starts with.
pub const SSE_CONNECTED: &str = "event: connected\ndata: ok\n\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let topic: Topic<String> = Topic::new("test", 10);
        let mut a = topic.subscribe().await.unwrap();
        let mut b = topic.subscribe().await.unwrap();

        topic.publish("hello".to_string()).await;

        assert_eq!(a.recv().await.unwrap().as_str(), "hello");
        assert_eq!(b.recv().await.unwrap().as_str(), "hello");
    }

    #[tokio::test]
    async fn full_queue_drops_the_subscriber() {
        let topic: Topic<u32> = Topic::new("test", 10);
        let _stalled = topic.subscribe().await.unwrap();

        // Overflow the bounded queue without draining.
        for i in 0..(SUBSCRIBER_QUEUE as u32 + 1) {
            topic.publish(i).await;
        }
        assert_eq!(topic.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn subscriber_cap_is_enforced() {
        let topic: Topic<u32> = Topic::new("test", 2);
        let _a = topic.subscribe().await.unwrap();
        let _b = topic.subscribe().await.unwrap();
        assert!(topic.subscribe().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_subscriber() {
        let topic: Topic<u32> = Topic::new("test", 10);
        let a = topic.subscribe().await.unwrap();
        let _b = topic.subscribe().await.unwrap();
        topic.unsubscribe(a.id()).await;
        assert_eq!(topic.subscriber_count().await, 1);
    }
}
