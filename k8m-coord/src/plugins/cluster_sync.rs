//! Mirrors other replicas' cluster connections
//!
//! Every replica watches the cluster Leases. The leader additionally sweeps
//! lapsed Leases, starting when it is elected and stopping when it loses
//! leadership.

use crate::{
    bus::EventType,
    coordinator::{ConnectionHandler, LeaseCoordinator},
    leadership::LeadershipEvents,
    plugin::{BaseContext, BoxError, Lifecycle, Module},
};
use std::sync::Arc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

/// The module's registered name
pub const NAME: &str = "cluster-sync";

/// Describes the cluster-sync module. It depends on the leader module.
pub fn module(coordinator: LeaseCoordinator, handler: Arc<dyn ConnectionHandler>) -> Module {
    Module::new(
        NAME,
        ClusterSync {
            coordinator,
            handler,
        },
    )
    .with_title("Cluster sync")
    .with_version(super::VERSION)
    .with_description("Propagates cluster connections between replicas")
    .depends_on(super::leader::NAME)
}

/// A [`ConnectionHandler`] that only logs
#[derive(Clone, Debug, Default)]
pub struct LogConnections(());

struct ClusterSync {
    coordinator: LeaseCoordinator,
    handler: Arc<dyn ConnectionHandler>,
}

#[async_trait::async_trait]
impl Lifecycle for ClusterSync {
    async fn start(&self, ctx: &BaseContext) -> Result<(), BoxError> {
        let shutdown = ctx.shutdown().clone();

        let watcher = self.coordinator.clone();
        let handler = self.handler.clone();
        ctx.spawn({
            let shutdown = shutdown.clone();
            async move { watcher.run_watcher(handler, shutdown).await }
        });

        // Subscribe before returning so that no transition is missed.
        let events = ctx.leadership().subscribe(ctx.bus());
        let coordinator = self.coordinator.clone();
        let tasks = ctx.tasks().clone();
        ctx.spawn(sweep_while_leading(coordinator, events, shutdown, tasks));
        Ok(())
    }
}

async fn sweep_while_leading(
    coordinator: LeaseCoordinator,
    mut events: LeadershipEvents,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    let mut sweeping: Option<CancellationToken> = None;
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next() => event,
        };
        match event {
            Some(EventType::LeaderElected) => {
                if sweeping.is_none() {
                    let token = shutdown.child_token();
                    let coordinator = coordinator.clone();
                    let cleanup = token.clone();
                    tasks.spawn(async move { coordinator.run_leader_cleanup(cleanup).await });
                    sweeping = Some(token);
                }
            }
            Some(EventType::LeaderLost) => {
                if let Some(token) = sweeping.take() {
                    info!("Lost leadership; no longer sweeping cluster leases");
                    token.cancel();
                }
            }
            None => {
                debug!("Leadership events ended");
                break;
            }
        }
    }
    if let Some(token) = sweeping {
        token.cancel();
    }
}

#[async_trait::async_trait]
impl ConnectionHandler for LogConnections {
    async fn on_connect(&self, cluster: &str) {
        info!(%cluster, "Cluster connected by another replica");
    }

    async fn on_disconnect(&self, cluster: &str) {
        info!(%cluster, "Cluster disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::{Event, EventBus},
        coordinator::{CoordinationParams, Error, LeaseEvents, LeaseStore},
        leadership::Leadership,
    };
    use futures_util::StreamExt;
    use k8s_openapi::api::coordination::v1::Lease;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{self, Duration};

    /// Counts sweeps; holds no Leases.
    #[derive(Default)]
    struct Sweeps(AtomicUsize);

    #[async_trait::async_trait]
    impl LeaseStore for Sweeps {
        async fn get(&self, _: &str) -> Result<Option<Lease>, Error> {
            Ok(None)
        }

        async fn create(&self, lease: Lease) -> Result<Lease, Error> {
            Ok(lease)
        }

        async fn replace(&self, lease: Lease) -> Result<Lease, Error> {
            Ok(lease)
        }

        async fn delete(&self, name: &str, _: Option<&str>) -> Result<(), Error> {
            Err(Error::NotFound(name.to_string()))
        }

        async fn list(&self) -> Result<Vec<Lease>, Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        fn watch(&self) -> LeaseEvents {
            futures_util::stream::pending().boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_only_while_leading() {
        let store = Arc::new(Sweeps::default());
        let shutdown = CancellationToken::new();
        let coordinator = LeaseCoordinator::new(
            store.clone(),
            "me",
            CoordinationParams::default(),
            shutdown.clone(),
        );
        let bus = EventBus::new();
        let leadership = Leadership::default();
        let tasks = TaskTracker::new();
        tokio::spawn(sweep_while_leading(
            coordinator,
            leadership.subscribe(&bus),
            shutdown.clone(),
            tasks.clone(),
        ));

        time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.0.load(Ordering::SeqCst), 0);

        leadership.set(true);
        bus.publish(Event::new(EventType::LeaderElected));
        time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.0.load(Ordering::SeqCst), 2);

        leadership.set(false);
        bus.publish(Event::new(EventType::LeaderLost));
        time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.0.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        tasks.close();
        tasks.wait().await;
    }
}
