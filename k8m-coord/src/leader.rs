//! Uses a Lease to establish leadership among k8m replicas
//!
//! A [`LeaderElector`] campaigns for a single, fixed Lease. The replica that
//! holds it is notified through [`LeaderCallbacks::started_leading`] with a
//! token that is cancelled when leadership is lost, and
//! [`LeaderCallbacks::stopped_leading`] fires once that happens. When no
//! Kubernetes client is available the elector leads unconditionally, so that a
//! single instance running outside of a cluster remains fully functional.

use crate::{
    client::Client,
    lease::{self, Claim, ClaimParams, LeaseLock},
};
use k8s_openapi::{api::coordination::v1 as coordv1, apimachinery::pkg::apis::meta::v1 as metav1};
use std::sync::Arc;
use tokio::{
    sync::watch,
    time::{self, Duration},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

/// Receives leadership transitions
///
/// Callbacks are invoked from the elector's task and must return promptly;
/// long-running work should be spawned and bound to the provided token.
pub trait LeaderCallbacks: Send + Sync + 'static {
    /// This replica became the leader. `leading` is cancelled when leadership
    /// is lost or the process shuts down.
    fn started_leading(&self, leading: CancellationToken);

    /// This replica is no longer the leader.
    fn stopped_leading(&self);
}

/// Identifies the leader-election Lease and this replica
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectionParams {
    /// The Lease's name.
    pub name: String,

    /// The Lease's namespace.
    pub namespace: String,

    /// This replica's identity.
    pub identity: String,

    /// Lease timing.
    pub claim: ClaimParams,
}

/// Configures leader election
#[derive(Clone, Debug)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct ElectionArgs {
    /// The name of the leader-election Lease.
    #[cfg_attr(
        feature = "clap",
        clap(long = "leader-lease-name", default_value = ElectionArgs::DEFAULT_LEASE_NAME)
    )]
    pub lease_name: String,

    /// The namespace of the leader-election Lease. Detected when unset.
    #[cfg_attr(feature = "clap", clap(long = "leader-namespace"))]
    pub namespace: Option<String>,

    /// How long a leader's claim is valid after it was last renewed.
    #[cfg_attr(
        feature = "clap",
        clap(
            long = "leader-lease-duration",
            default_value = "60s",
            value_parser = crate::duration::parse
        )
    )]
    pub lease_duration: Duration,

    /// How long the leader may fail to renew before it steps down.
    #[cfg_attr(
        feature = "clap",
        clap(
            long = "leader-renew-deadline",
            default_value = "50s",
            value_parser = crate::duration::parse
        )
    )]
    pub renew_deadline: Duration,

    /// How often the leader renews and other replicas retry.
    #[cfg_attr(
        feature = "clap",
        clap(
            long = "leader-retry-period",
            default_value = "10s",
            value_parser = crate::duration::parse
        )
    )]
    pub retry_period: Duration,

    /// This replica's identity. Generated when unset.
    #[cfg_attr(feature = "clap", clap(long, env = "K8M_IDENTITY"))]
    pub identity: Option<String>,
}

/// Campaigns for leadership
#[derive(Clone)]
pub struct LeaderElector {
    client: Option<Client>,
    params: ElectionParams,
}

/// Indicates that a campaign failed; it is retried after the retry period
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The leader-election Lease could not be created
    #[error("failed to create lease: {0}")]
    Create(#[source] kube_client::Error),

    /// The lock could not be claimed or renewed
    #[error(transparent)]
    Lease(#[from] lease::Error),

    /// The lock's task panicked
    #[error("lease task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Returns a per-process identity derived from the pod or host name
///
/// The name is taken from `POD_NAME`, `HOSTNAME` or `/etc/hostname` and
/// suffixed with a random UUID, so that a restarted process never inherits its
/// predecessor's claims.
pub fn instance_identity() -> String {
    let host = ["POD_NAME", "HOSTNAME"]
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "k8m".to_string());
    format!("{host}_{}", uuid::Uuid::new_v4())
}

// === impl ElectionArgs ===

impl ElectionArgs {
    /// The default name of the leader-election Lease
    pub const DEFAULT_LEASE_NAME: &'static str = "k8m-leader-election";

    /// Resolves the election parameters, using `namespace` when no namespace
    /// is configured
    pub fn into_params(self, namespace: impl FnOnce() -> String) -> ElectionParams {
        ElectionParams {
            name: self.lease_name,
            namespace: self.namespace.unwrap_or_else(namespace),
            identity: self.identity.unwrap_or_else(instance_identity),
            claim: ClaimParams {
                lease_duration: self.lease_duration,
                renew_deadline: self.renew_deadline,
                retry_period: self.retry_period,
            },
        }
    }
}

impl Default for ElectionArgs {
    fn default() -> Self {
        let claim = ClaimParams::default();
        Self {
            lease_name: Self::DEFAULT_LEASE_NAME.to_string(),
            namespace: None,
            lease_duration: claim.lease_duration,
            renew_deadline: claim.renew_deadline,
            retry_period: claim.retry_period,
            identity: None,
        }
    }
}

// === impl LeaderElector ===

impl LeaderElector {
    /// Creates an elector. Without a client, the elector leads unconditionally.
    pub fn new(client: Option<Client>, params: ElectionParams) -> Self {
        Self { client, params }
    }

    /// Creates an elector that leads unconditionally
    pub fn standalone(identity: impl Into<String>) -> Self {
        Self {
            client: None,
            params: ElectionParams {
                name: ElectionArgs::DEFAULT_LEASE_NAME.to_string(),
                namespace: "default".to_string(),
                identity: identity.into(),
                claim: ClaimParams::default(),
            },
        }
    }

    /// This replica's identity
    #[inline]
    pub fn identity(&self) -> &str {
        &self.params.identity
    }

    /// Starts campaigning on a tracked task.
    ///
    /// In standalone mode, [`LeaderCallbacks::started_leading`] is invoked
    /// before this returns. Otherwise the campaign retries until `shutdown` is
    /// cancelled; on shutdown the Lease is released if held, so that another
    /// replica may take over promptly.
    pub fn spawn(
        self,
        callbacks: Arc<dyn LeaderCallbacks>,
        shutdown: CancellationToken,
        tasks: &TaskTracker,
    ) -> tokio::task::JoinHandle<()> {
        let Self { client, params } = self;
        let Some(client) = client else {
            let identity = params.identity;
            info!(%identity, "No Kubernetes client; leading as a standalone instance");
            let leading = shutdown.child_token();
            callbacks.started_leading(leading.clone());
            return tasks.spawn(async move {
                shutdown.cancelled().await;
                leading.cancel();
                callbacks.stopped_leading();
                info!(%identity, "Stopped leading");
            });
        };

        tasks.spawn(campaign(client, params, callbacks, shutdown))
    }
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("standalone", &self.client.is_none())
            .field("params", &self.params)
            .finish()
    }
}

async fn campaign(
    client: Client,
    params: ElectionParams,
    callbacks: Arc<dyn LeaderCallbacks>,
    shutdown: CancellationToken,
) {
    let api = lease::Api::namespaced(client, &params.namespace);
    info!(
        identity = %params.identity,
        lease = %params.name,
        namespace = %params.namespace,
        "Campaigning for leadership"
    );
    loop {
        if let Err(error) = elect(&api, &params, &*callbacks, &shutdown).await {
            warn!(%error, lease = %params.name, "Leader election failed");
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = time::sleep(params.claim.retry_period) => {}
        }
    }
}

async fn elect(
    api: &lease::Api,
    params: &ElectionParams,
    callbacks: &dyn LeaderCallbacks,
    shutdown: &CancellationToken,
) -> Result<(), Error> {
    create_lease(api, &params.name).await?;
    let lock = LeaseLock::init(api.clone(), &params.name, &params.identity).await?;
    let (claims, task) = lock.spawn(params.claim.clone()).await?;
    follow_claims(
        claims,
        &params.identity,
        params.claim.renew_grace(),
        callbacks,
        shutdown,
    )
    .await;
    // The receiver has been dropped, so the lock releases the Lease (if it is
    // held) and completes.
    task.await??;
    Ok(())
}

async fn create_lease(api: &lease::Api, name: &str) -> Result<(), Error> {
    let lease = coordv1::Lease {
        metadata: metav1::ObjectMeta {
            name: Some(name.to_string()),
            labels: Some([("app".to_string(), "k8m".to_string())].into()),
            ..Default::default()
        },
        spec: Some(Default::default()),
    };
    match api.create(&Default::default(), &lease).await {
        Ok(_) => {
            info!(lease = %name, "Created leader-election lease");
            Ok(())
        }
        Err(kube_client::Error::Api(kube_core::ErrorResponse { code, .. }))
            if code == hyper::StatusCode::CONFLICT.as_u16() =>
        {
            Ok(())
        }
        Err(error) => Err(Error::Create(error)),
    }
}

/// Translates observed claims into leadership callbacks until shutdown or
/// until the claims stop updating.
///
/// Leadership is lost as soon as the held claim passes its renew deadline,
/// even if the lock is still retrying a renewal.
async fn follow_claims(
    mut claims: watch::Receiver<Arc<Claim>>,
    identity: &str,
    grace: Duration,
    callbacks: &dyn LeaderCallbacks,
    shutdown: &CancellationToken,
) {
    let mut leading: Option<CancellationToken> = None;
    loop {
        let claim = claims.borrow_and_update().clone();
        match (leading.is_some(), claim.is_leading(identity, grace)) {
            (false, true) => {
                info!(%identity, "Started leading");
                let token = shutdown.child_token();
                callbacks.started_leading(token.clone());
                leading = Some(token);
            }
            (true, false) => {
                if let Some(token) = leading.take() {
                    token.cancel();
                }
                callbacks.stopped_leading();
                info!(%identity, holder = %claim.holder, "Stopped leading");
            }
            _ => {}
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = claims.changed() => {
                if res.is_err() {
                    break;
                }
            }
            _ = claim.expire_with_grace(grace), if leading.is_some() => {
                warn!(%identity, "Failed to renew leadership before the deadline");
            }
        }
    }

    if let Some(token) = leading.take() {
        token.cancel();
        callbacks.stopped_leading();
        info!(%identity, "Stopped leading");
    }
}
