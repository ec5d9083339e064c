//! In-process publish/subscribe bus for lifecycle events.

use conductor_core::{Event, TopicFilter};
use futures_util::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Default channel capacity. Slow subscribers lose the oldest events
/// beyond this.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out channel shared by every queue and service.
///
/// Publishing never blocks: events go into a bounded ring buffer and a
/// subscriber that falls behind skips ahead.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        tracing::trace!(topic = %event.topic, "publish");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events whose topic matches `filter` (`*`, `prefix.*` or
    /// an exact topic). Only events published after this call are seen.
    pub fn subscribe(&self, filter: impl Into<TopicFilter>) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            filter: filter.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

/// A filtered view of the bus.
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
    filter: TopicFilter,
}

impl EventSubscription {
    /// Wait for the next matching event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event.topic) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged, skipping ahead");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(&event.topic) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged, skipping ahead");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Event> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}
