#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Runs a k8m replica with a leader-gated inspection job.
//!
//! Start several replicas against the same cluster to watch leadership move
//! between them and to see each replica mirror the others' `--connect`ed
//! clusters.

use anyhow::Result;
use k8m_coord::{
    coordinator::{ConnectionHandler, CoordinationArgs},
    leader::ElectionArgs,
    log::LogArgs,
    plugin::{BaseContext, BoxError, EnableContext, Lifecycle, Module},
    plugins, ClientArgs, EventType, Runtime,
};
use std::sync::Arc;
use tracing::info;

#[derive(Clone, clap::Parser)]
#[clap(version)]
struct Args {
    #[clap(flatten)]
    log: LogArgs,

    #[clap(flatten)]
    client: ClientArgs,

    #[clap(flatten)]
    election: ElectionArgs,

    #[clap(flatten)]
    coordination: CoordinationArgs,

    /// How often the leader inspects clusters
    #[arg(long, default_value = "@every 30s")]
    schedule: String,

    /// Clusters this replica announces as connected
    #[arg(long = "connect")]
    clusters: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    use clap::Parser;

    let Args {
        log,
        client,
        election,
        coordination,
        schedule,
        clusters,
    } = Args::parse();

    let rt = Runtime::builder()
        .with_log(log.filter()?, log.log_format)
        .with_client(client)
        .with_election(election)
        .with_coordination(coordination)
        .with_connection_handler(Arc::new(Mirror))
        .with_registrar(move |manager| {
            manager.register(
                Module::new("inspection", Inspection)
                    .with_title("Cluster inspection")
                    .with_version("0.1.0")
                    .depends_on(plugins::leader::NAME)
                    .with_cron(schedule),
            )
        })
        .build()
        .await?;
    info!(identity = %rt.identity(), standalone = rt.client().is_none(), "Built runtime");

    let coordinator = rt.coordinator().cloned();
    if let Some(coordinator) = coordinator.as_ref() {
        for cluster in &clusters {
            coordinator.ensure_on_connect(cluster).await?;
        }
    }

    rt.run().await?;

    if let Some(coordinator) = coordinator {
        for cluster in &clusters {
            coordinator.ensure_on_disconnect(cluster).await?;
        }
    }
    Ok(())
}

/// Schedules its cron entries only while this replica leads.
struct Inspection;

#[async_trait::async_trait]
impl Lifecycle for Inspection {
    async fn enable(&self, ctx: &EnableContext) -> Result<(), BoxError> {
        info!(version = %ctx.meta().version, "Inspection enabled");
        Ok(())
    }

    async fn start(&self, ctx: &BaseContext) -> Result<(), BoxError> {
        let mut events = ctx.leadership().subscribe(ctx.bus());
        let scheduler = ctx.scheduler().clone();
        let shutdown = ctx.shutdown().clone();
        ctx.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.next() => event,
                };
                let res = match event {
                    Some(EventType::LeaderElected) => scheduler.ensure_all(),
                    Some(EventType::LeaderLost) => scheduler.remove_all(),
                    None => return,
                };
                if let Err(error) = res {
                    tracing::warn!(%error, "Failed to update inspection schedule");
                }
            }
        });
        Ok(())
    }

    async fn start_cron(&self, ctx: &BaseContext, spec: &str) -> Result<(), BoxError> {
        if ctx.leadership().is_leader() {
            info!(%spec, "Inspecting clusters");
        }
        Ok(())
    }
}

/// Logs clusters connected by other replicas.
struct Mirror;

#[async_trait::async_trait]
impl ConnectionHandler for Mirror {
    async fn on_connect(&self, cluster: &str) {
        info!(%cluster, "Mirroring remote cluster connection");
    }

    async fn on_disconnect(&self, cluster: &str) {
        info!(%cluster, "Forgetting cluster connection");
    }
}
