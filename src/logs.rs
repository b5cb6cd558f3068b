//! Log capture: a tracing layer mirrors records into the event bus (for the
//! SSE stream) and a bounded ring buffer (for the history endpoint).
//!
//! `Layer::on_event` runs in sync context, so records travel through an
//! unbounded channel to a forwarder task that does the async publish.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::events::{EventBus, LogEvent};

const HISTORY_CAPACITY: usize = 1000;

pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEvent>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn push(&self, event: LogEvent) {
        let mut entries = self.entries.lock().expect("log buffer poisoned");
        if entries.len() == HISTORY_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    /// Most recent `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEvent> {
        let entries = self.entries.lock().expect("log buffer poisoned");
        entries
            .iter()
            .skip(entries.len().saturating_sub(limit))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("log buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tracing layer ───────────────────────────────────────────────────────

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

/// Mirrors INFO+ records into the buffer and the forwarder channel.
pub struct LogCaptureLayer {
    buffer: Arc<LogBuffer>,
    tx: mpsc::UnboundedSender<LogEvent>,
}

impl LogCaptureLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { buffer, tx }, rx)
    }
}

impl<S: tracing::Subscriber> Layer<S> for LogCaptureLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > tracing::Level::INFO {
            return;
        }
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        let log_event = LogEvent {
            timestamp: chrono::Utc::now().timestamp_millis(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.message,
        };
        self.buffer.push(log_event.clone());
        let _ = self.tx.send(log_event);
    }
}

/// Drains the layer channel into the event bus.
pub fn spawn_forwarder(
    mut rx: mpsc::UnboundedReceiver<LogEvent>,
    events: Arc<EventBus>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            events.logs.publish(event).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(message: &str) -> LogEvent {
        LogEvent {
            timestamp: 0,
            level: "INFO".into(),
            target: "test".into(),
            message: message.into(),
        }
    }

    #[test]
    fn ring_buffer_caps_and_keeps_newest() {
        let buffer = LogBuffer::new();
        for i in 0..(HISTORY_CAPACITY + 10) {
            buffer.push(event(&format!("line-{i}")));
        }
        assert_eq!(buffer.len(), HISTORY_CAPACITY);
        let recent = buffer.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].message, format!("line-{}", HISTORY_CAPACITY + 9));
    }

    #[test]
    fn recent_returns_oldest_first() {
        let buffer = LogBuffer::new();
        buffer.push(event("a"));
        buffer.push(event("b"));
        buffer.push(event("c"));
        let recent = buffer.recent(2);
        assert_eq!(recent[0].message, "b");
        assert_eq!(recent[1].message, "c");
    }
}
