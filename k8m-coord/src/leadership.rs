//! Process-wide leadership state

use crate::bus::{EventBus, EventType, Subscription};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Tracks whether this process is currently the elected leader
///
/// The state starts unset and is only written by the leader elector's
/// callbacks. Any number of readers may consult it to gate singleton work.
#[derive(Clone, Debug, Default)]
pub struct Leadership(Arc<AtomicBool>);

/// A stream of leadership transitions that starts from the current state
///
/// Bus events only wake the stream; every item reflects
/// [`Leadership::is_leader`] at the time it is yielded, so reordered or
/// dropped events cannot leave a subscriber in the wrong state.
///
/// Created by [`Leadership::subscribe`].
#[derive(Debug)]
pub struct LeadershipEvents {
    leadership: Leadership,
    elected: Subscription,
    lost: Subscription,
    last: EventType,
}

// === impl Leadership ===

impl Leadership {
    /// Returns true if this process currently holds leadership
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Records a leadership transition, returning the prior state
    pub(crate) fn set(&self, leader: bool) -> bool {
        self.0.swap(leader, Ordering::AcqRel)
    }

    /// Subscribes to both leadership topics on the given bus
    ///
    /// Because the bus may drop events for a slow subscriber, the returned
    /// stream first yields [`EventType::LeaderElected`] when this process
    /// already leads at subscription time.
    pub fn subscribe(&self, bus: &EventBus) -> LeadershipEvents {
        // Subscribe before the first sample so that a concurrent transition
        // is observed either through the sample or through a wakeup.
        let elected = bus.subscribe(EventType::LeaderElected);
        let lost = bus.subscribe(EventType::LeaderLost);
        LeadershipEvents {
            leadership: self.clone(),
            elected,
            lost,
            last: EventType::LeaderLost,
        }
    }

    fn current(&self) -> EventType {
        if self.is_leader() {
            EventType::LeaderElected
        } else {
            EventType::LeaderLost
        }
    }
}

// === impl LeadershipEvents ===

impl LeadershipEvents {
    /// Waits for the next leadership transition
    ///
    /// Transitions alternate, starting with [`EventType::LeaderElected`].
    /// Returns `None` once the bus can no longer deliver events.
    pub async fn next(&mut self) -> Option<EventType> {
        loop {
            let current = self.leadership.current();
            if current != self.last {
                self.last = current;
                return Some(current);
            }

            tokio::select! {
                Some(_) = self.elected.recv() => {}
                Some(_) = self.lost.recv() => {}
                else => return None,
            }
            while self.elected.try_recv().is_ok() {}
            while self.lost.try_recv().is_ok() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Event;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[tokio::test]
    async fn replays_current_leadership() {
        let bus = EventBus::new();
        let leadership = Leadership::default();
        assert!(!leadership.set(true));

        let mut events = leadership.subscribe(&bus);
        assert_eq!(events.next().await, Some(EventType::LeaderElected));

        // The publication that raced with the subscription is collapsed.
        bus.publish(Event::new(EventType::LeaderElected));
        leadership.set(false);
        bus.publish(Event::new(EventType::LeaderLost));
        assert_eq!(events.next().await, Some(EventType::LeaderLost));
    }

    #[tokio::test]
    async fn waits_for_transitions_when_not_leading() {
        let bus = EventBus::new();
        let leadership = Leadership::default();
        let mut events = leadership.subscribe(&bus);

        {
            let mut next = task::spawn(events.next());
            assert_pending!(next.poll());
        }

        leadership.set(true);
        bus.publish(Event::new(EventType::LeaderElected));
        let mut next = task::spawn(events.next());
        assert_ready_eq!(next.poll(), Some(EventType::LeaderElected));
    }

    #[tokio::test]
    async fn settles_on_the_current_state() {
        let bus = EventBus::new();
        let leadership = Leadership::default();
        let mut events = leadership.subscribe(&bus);

        // Both transitions are queued before the subscriber runs.
        leadership.set(true);
        bus.publish(Event::new(EventType::LeaderElected));
        leadership.set(false);
        bus.publish(Event::new(EventType::LeaderLost));

        let mut next = task::spawn(events.next());
        assert_pending!(next.poll());
        drop(next);
        assert!(!leadership.is_leader());

        leadership.set(true);
        bus.publish(Event::new(EventType::LeaderElected));
        assert_eq!(events.next().await, Some(EventType::LeaderElected));
    }

    #[tokio::test]
    async fn dropped_events_do_not_hide_transitions() {
        let bus = EventBus::new();
        let leadership = Leadership::default();
        let mut events = leadership.subscribe(&bus);

        leadership.set(true);
        bus.publish(Event::new(EventType::LeaderElected));
        assert_eq!(events.next().await, Some(EventType::LeaderElected));

        // The first loss fills the channel; the second is dropped.
        leadership.set(false);
        bus.publish(Event::new(EventType::LeaderLost));
        leadership.set(true);
        bus.publish(Event::new(EventType::LeaderElected));
        leadership.set(false);
        assert_eq!(bus.publish(Event::new(EventType::LeaderLost)), 0);

        assert_eq!(events.next().await, Some(EventType::LeaderLost));
        let mut next = task::spawn(events.next());
        assert_pending!(next.poll());
    }
}
