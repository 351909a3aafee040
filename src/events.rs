//! In-process event bus.
//!
//! A closed set of event kinds fans out to registered handlers. Handlers for
//! one publish run concurrently as child tasks; a panicking or erroring
//! handler is logged and dropped without touching its siblings. The publish
//! call returns once every handler has completed or failed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

const MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExecutionFill,
    BreakingNews,
    Disclosure,
    HotSymbol,
    RegimeChange,
    ScheduleTick,
    PipelineComplete,
    OrderSubmitted,
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::ExecutionFill => "execution_fill",
            EventKind::BreakingNews => "breaking_news",
            EventKind::Disclosure => "disclosure",
            EventKind::HotSymbol => "hot_symbol",
            EventKind::RegimeChange => "regime_change",
            EventKind::ScheduleTick => "schedule_tick",
            EventKind::PipelineComplete => "pipeline_complete",
            EventKind::OrderSubmitted => "order_submitted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub symbol: Option<String>,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, symbol: Option<&str>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            symbol: symbol.map(|s| s.to_string()),
            payload,
            ts: Utc::now(),
        }
    }
}

/// A single "receive event" capability. Registration is keyed by `name()`,
/// which makes `subscribe` idempotent per (kind, handler identity).
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    history: Mutex<VecDeque<Event>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
        }
    }

    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut subs = self.subscribers.write();
        let entry = subs.entry(kind).or_default();
        if entry.iter().any(|h| h.name() == handler.name()) {
            debug!(
                kind = kind.as_str(),
                handler = handler.name(),
                "handler already subscribed"
            );
            return;
        }
        info!(
            kind = kind.as_str(),
            handler = handler.name(),
            "event handler subscribed"
        );
        entry.push(handler);
    }

    /// Publish an event: record it, then run every matching handler as its
    /// own task and wait for all of them. No back-pressure and no retry.
    pub async fn publish(&self, event: Event) {
        {
            let mut history = self.history.lock();
            if history.len() >= MAX_HISTORY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subs = self.subscribers.read();
            match subs.get(&event.kind) {
                Some(list) => list.clone(),
                None => {
                    debug!(kind = event.kind.as_str(), "no subscribers for event");
                    return;
                }
            }
        };

        debug!(
            kind = event.kind.as_str(),
            symbol = event.symbol.as_deref().unwrap_or("-"),
            handlers = handlers.len(),
            "publishing event"
        );

        let mut tasks = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let event = event.clone();
            tasks.push(tokio::spawn(async move {
                let name = handler.name().to_string();
                if let Err(e) = handler.handle(event).await {
                    error!(handler = %name, error = %e, "event handler failed");
                }
            }));
        }

        for task in tasks {
            if let Err(e) = task.await {
                // A panicking handler lands here; siblings keep running.
                error!(error = %e, "event handler panicked");
            }
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.read().get(&kind).map_or(0, |v| v.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        name: String,
        hits: AtomicUsize,
    }

    impl Counter {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                hits: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EventHandler for Counter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, _event: Event) -> anyhow::Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Bomb;

    #[async_trait]
    impl EventHandler for Bomb {
        fn name(&self) -> &str {
            "bomb"
        }

        async fn handle(&self, _event: Event) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    fn event(kind: EventKind) -> Event {
        Event::new(kind, Some("005930"), serde_json::json!({}))
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_per_handler_name() {
        let bus = EventBus::new();
        let counter = Counter::new("c1");
        bus.subscribe(EventKind::HotSymbol, counter.clone());
        bus.subscribe(EventKind::HotSymbol, counter.clone());
        assert_eq!(bus.subscriber_count(EventKind::HotSymbol), 1);

        bus.publish(event(EventKind::HotSymbol)).await;
        assert_eq!(counter.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_affect_siblings() {
        let bus = EventBus::new();
        let counter = Counter::new("survivor");
        bus.subscribe(EventKind::BreakingNews, Arc::new(Bomb));
        bus.subscribe(EventKind::BreakingNews, counter.clone());

        bus.publish(event(EventKind::BreakingNews)).await;
        assert_eq!(counter.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let bus = EventBus::new();
        for _ in 0..150 {
            bus.publish(event(EventKind::ScheduleTick)).await;
        }
        assert_eq!(bus.recent(usize::MAX).len(), MAX_HISTORY);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(event(EventKind::RegimeChange)).await;
        assert_eq!(bus.recent(10).len(), 1);
    }
}
