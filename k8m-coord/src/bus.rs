//! An in-process publish/subscribe registry for coordination events
//!
//! Plugins that must react to process-wide transitions (for instance, gaining
//! or losing leadership) subscribe to a topic on the [`EventBus`] instead of
//! polling shared state. Delivery is best-effort and at-most-once: every
//! subscription is a channel with room for a single event, and a publisher
//! never waits for a slow subscriber. When a subscriber's channel is full the
//! event is dropped for that subscriber only.
//!
//! Because delivery may be lossy, consumers that care about the *current*
//! state should also consult the state directly; see
//! [`Leadership::subscribe`](crate::leadership::Leadership::subscribe).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc::{self, error::TrySendError};

/// A process-wide event bus
///
/// The bus is cheap to clone; clones share the same subscription registry.
#[derive(Clone, Debug, Default)]
pub struct EventBus(Arc<RwLock<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>);

/// Receives events published to a single topic
pub type Subscription = mpsc::Receiver<Event>;

/// Identifies a topic on the [`EventBus`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    /// This instance acquired leadership.
    LeaderElected,

    /// This instance lost (or released) leadership.
    LeaderLost,
}

/// An event published on the [`EventBus`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// The topic the event was published to.
    pub kind: EventType,

    /// The identity of the instance that produced the event, if known.
    pub source: Option<String>,

    /// When the event was produced.
    pub at: DateTime<Utc>,
}

// === impl Event ===

impl Event {
    /// Creates an event of the given type stamped with the current time
    pub fn new(kind: EventType) -> Self {
        Self {
            kind,
            source: None,
            at: Utc::now(),
        }
    }

    /// Records the identity of the instance producing the event
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// === impl EventBus ===

impl EventBus {
    const SUBSCRIPTION_CAPACITY: usize = 1;

    /// Creates an empty event bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscription to the given topic
    ///
    /// The returned channel buffers at most one undelivered event.
    pub fn subscribe(&self, kind: EventType) -> Subscription {
        let (tx, rx) = mpsc::channel(Self::SUBSCRIPTION_CAPACITY);
        self.0.write().entry(kind).or_default().push(tx);
        rx
    }

    /// Publishes an event to every subscriber of its topic without blocking
    ///
    /// Returns the number of subscribers that accepted the event. Subscribers
    /// whose channel is full miss the event; subscribers that have been
    /// dropped are removed from the registry.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind;
        let mut delivered = 0;
        let mut closed = false;
        {
            let topics = self.0.read();
            let Some(subscribers) = topics.get(&kind) else {
                tracing::trace!(?kind, "No subscribers");
                return 0;
            };
            for tx in subscribers {
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!(?kind, "Subscriber is not keeping up; dropping event");
                    }
                    Err(TrySendError::Closed(_)) => closed = true,
                }
            }
        }

        if closed {
            if let Some(subscribers) = self.0.write().get_mut(&kind) {
                subscribers.retain(|tx| !tx.is_closed());
            }
        }

        delivered
    }

    /// Returns the number of live subscriptions to the given topic
    pub fn subscribers(&self, kind: EventType) -> usize {
        self.0
            .read()
            .get(&kind)
            .map(|subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    #[tokio::test]
    async fn delivers_to_every_subscriber_of_a_topic() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(EventType::LeaderElected);
        let mut b = bus.subscribe(EventType::LeaderElected);
        let mut lost = bus.subscribe(EventType::LeaderLost);

        let delivered = bus.publish(Event::new(EventType::LeaderElected).with_source("pod-a"));
        assert_eq!(delivered, 2);

        let ev = a.recv().await.expect("event");
        assert_eq!(ev.kind, EventType::LeaderElected);
        assert_eq!(ev.source.as_deref(), Some("pod-a"));
        assert_eq!(b.recv().await.expect("event").kind, EventType::LeaderElected);
        assert_eq!(lost.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn publish_never_blocks_on_a_full_subscriber() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe(EventType::LeaderLost);

        assert_eq!(bus.publish(Event::new(EventType::LeaderLost).with_source("first")), 1);
        // The channel already holds an event, so this one is dropped.
        assert_eq!(bus.publish(Event::new(EventType::LeaderLost).with_source("second")), 0);

        let ev = slow.recv().await.expect("event");
        assert_eq!(ev.source.as_deref(), Some("first"));
        assert_eq!(slow.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn prunes_dropped_subscribers() {
        let bus = EventBus::new();
        let rx = bus.subscribe(EventType::LeaderElected);
        let _kept = bus.subscribe(EventType::LeaderElected);
        assert_eq!(bus.subscribers(EventType::LeaderElected), 2);

        drop(rx);
        assert_eq!(bus.publish(Event::new(EventType::LeaderElected)), 1);
        assert_eq!(bus.0.read()[&EventType::LeaderElected].len(), 1);
    }

    #[test]
    fn publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(Event::new(EventType::LeaderElected)), 0);
    }
}
