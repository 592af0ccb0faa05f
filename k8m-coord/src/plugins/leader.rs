//! Runs the leader election and announces its outcome
//!
//! While the module runs, the process campaigns for leadership. Transitions
//! are recorded in the shared [`Leadership`] state and published on the
//! [`EventBus`] so that other modules can start or stop singleton work.

use crate::{
    bus::{Event, EventBus, EventType},
    leader::{LeaderCallbacks, LeaderElector},
    leadership::Leadership,
    plugin::{BaseContext, BoxError, Lifecycle, Module},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The module's registered name
pub const NAME: &str = "leader";

/// Describes the leader-election module
pub fn module(elector: LeaderElector) -> Module {
    Module::new(NAME, LeaderPlugin { elector })
        .with_title("Leader election")
        .with_version(super::VERSION)
        .with_description("Elects a single replica to run cluster-wide background work")
}

struct LeaderPlugin {
    elector: LeaderElector,
}

/// Records leadership transitions and publishes them on the bus
#[derive(Clone, Debug)]
pub struct Announcer {
    identity: String,
    bus: EventBus,
    leadership: Leadership,
}

#[async_trait::async_trait]
impl Lifecycle for LeaderPlugin {
    async fn start(&self, ctx: &BaseContext) -> Result<(), BoxError> {
        let announcer = Announcer::new(self.elector.identity(), ctx.bus(), ctx.leadership());
        self.elector
            .clone()
            .spawn(Arc::new(announcer), ctx.shutdown().clone(), ctx.tasks());
        Ok(())
    }
}

// === impl Announcer ===

impl Announcer {
    /// Creates an announcer for the given identity
    pub fn new(identity: &str, bus: &EventBus, leadership: &Leadership) -> Self {
        Self {
            identity: identity.to_string(),
            bus: bus.clone(),
            leadership: leadership.clone(),
        }
    }

    fn announce(&self, leader: bool) {
        let kind = if leader {
            EventType::LeaderElected
        } else {
            EventType::LeaderLost
        };
        let was_leader = self.leadership.set(leader);
        let delivered = self
            .bus
            .publish(Event::new(kind).with_source(self.identity.clone()));
        info!(identity = %self.identity, leader, was_leader, delivered, "Leadership changed");
    }
}

impl LeaderCallbacks for Announcer {
    fn started_leading(&self, _leading: CancellationToken) {
        self.announce(true);
    }

    fn stopped_leading(&self) {
        self.announce(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginManager;

    #[tokio::test]
    async fn standalone_leader_announces_leadership() {
        let shutdown = CancellationToken::new();
        let manager = PluginManager::builder()
            .with_shutdown(shutdown.clone())
            .build();
        let mut elected = manager.bus().subscribe(EventType::LeaderElected);
        let mut lost = manager.bus().subscribe(EventType::LeaderLost);

        manager
            .register(module(LeaderElector::standalone("solo")))
            .expect("register");
        manager.start().await.expect("start");

        let event = elected.recv().await.expect("elected");
        assert_eq!(event.source.as_deref(), Some("solo"));
        assert!(manager.leadership().is_leader());

        shutdown.cancel();
        let event = lost.recv().await.expect("lost");
        assert_eq!(event.kind, EventType::LeaderLost);
        assert!(!manager.leadership().is_leader());
    }
}
