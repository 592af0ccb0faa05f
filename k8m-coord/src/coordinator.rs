//! Propagates cluster connections between replicas through Leases
//!
//! When a replica connects to a managed cluster it creates a Lease named after
//! the cluster and keeps renewing it; when it disconnects it deletes the
//! Lease. Every replica watches these Leases and mirrors them: a newly
//! observed, valid Lease held by another replica is reported as a connection
//! and a deleted Lease as a disconnection. The leader periodically deletes
//! Leases whose holder stopped renewing them, so that the connections of a
//! crashed replica are eventually forgotten everywhere.

use crate::errors::LogAndSleep;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1 as metav1,
};
use kube_runtime::watcher;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

mod store;

pub use self::store::{KubeLeases, LeaseEvents, LeaseStore};

/// Prefix of every cluster Lease's name
pub const LEASE_PREFIX: &str = "k8m-cluster-";

/// Annotation carrying the unencoded cluster identifier
pub const CLUSTER_ID_ANNOTATION: &str = "k8m.io/cluster-id";

const CLUSTER_ID_LABEL: &str = "clusterID";
const LABEL_VALUE_MAX: usize = 63;

/// Reacts to clusters connected or disconnected by other replicas
#[async_trait::async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Another replica holds a live connection to the cluster.
    async fn on_connect(&self, cluster: &str);

    /// The cluster's connection Lease was deleted.
    async fn on_disconnect(&self, cluster: &str);
}

/// Indicates an error reading or writing cluster Leases
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error was received from the Kubernetes API
    #[error("lease request failed: {0}")]
    Api(#[from] kube_client::Error),

    /// The Lease already exists
    #[error("lease {0} already exists")]
    AlreadyExists(String),

    /// The Lease does not exist
    #[error("lease {0} not found")]
    NotFound(String),

    /// The Lease was modified concurrently
    #[error("lease {0} was modified concurrently")]
    Conflict(String),

    /// The Lease watch failed
    #[error("lease watch failed: {0}")]
    Watch(#[from] watcher::Error),
}

/// Configures cluster-connection propagation
#[derive(Clone, Debug)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct CoordinationArgs {
    /// The namespace holding cluster Leases. Detected when unset.
    #[cfg_attr(feature = "clap", clap(long = "coordination-namespace"))]
    pub namespace: Option<String>,

    /// How long a cluster Lease is valid after it was last renewed.
    #[cfg_attr(
        feature = "clap",
        clap(
            long = "cluster-lease-duration",
            default_value = "60s",
            value_parser = crate::duration::parse
        )
    )]
    pub lease_duration: Duration,

    /// How often connected clusters' Leases are renewed. Defaults to a third
    /// of the Lease duration, and at least 20s.
    #[cfg_attr(
        feature = "clap",
        clap(long = "cluster-renew-interval", value_parser = crate::duration::parse)
    )]
    pub renew_interval: Option<Duration>,

    /// How often the leader deletes lapsed cluster Leases.
    #[cfg_attr(
        feature = "clap",
        clap(
            long = "cluster-cleanup-interval",
            default_value = "30s",
            value_parser = crate::duration::parse
        )
    )]
    pub cleanup_interval: Duration,
}

/// Timing of cluster Leases
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinationParams {
    /// How long a cluster Lease is valid after it was last renewed.
    pub lease_duration: Duration,

    /// How often connected clusters' Leases are renewed.
    pub renew_interval: Duration,

    /// How often the leader deletes lapsed cluster Leases.
    pub cleanup_interval: Duration,
}

/// Creates, renews, deletes and mirrors cluster Leases
#[derive(Clone)]
pub struct LeaseCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn LeaseStore>,
    identity: String,
    params: CoordinationParams,
    shutdown: CancellationToken,
    renewals: Mutex<Renewals>,
}

#[derive(Default)]
struct Renewals {
    next_id: u64,
    by_cluster: HashMap<String, (u64, CancellationToken)>,
}

enum Renewal {
    Renewed,
    Gone,
    TakenOver(String),
}

/// Returns the name of the cluster's Lease: the prefix followed by the hex
/// encoding of the first four bytes of the identifier's SHA-1 digest
pub fn lease_name(cluster: &str) -> String {
    let digest = Sha1::digest(cluster.as_bytes());
    let mut name = String::with_capacity(LEASE_PREFIX.len() + 8);
    name.push_str(LEASE_PREFIX);
    for byte in &digest[..4] {
        name.push_str(&format!("{byte:02x}"));
    }
    name
}

/// Returns true iff the Lease was renewed less than its duration ago
pub fn is_lease_valid(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return false;
    };
    match (spec.renew_time.as_ref(), spec.lease_duration_seconds) {
        (Some(metav1::MicroTime(renewed)), Some(seconds)) => {
            now.signed_duration_since(*renewed) < chrono::Duration::seconds(seconds.into())
        }
        _ => false,
    }
}

/// Recovers the cluster identifier of a cluster Lease
pub fn cluster_id_of(lease: &Lease) -> Option<String> {
    let meta = &lease.metadata;
    if let Some(id) = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(CLUSTER_ID_ANNOTATION))
    {
        return Some(id.clone());
    }
    let encoded = meta.labels.as_ref()?.get(CLUSTER_ID_LABEL)?;
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let bytes = engine
        .decode(encoded.trim_end_matches('='))
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(encoded))
        .ok()?;
    String::from_utf8(bytes).ok()
}

fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        ("app".to_string(), "k8m".to_string()),
        ("type".to_string(), "cluster-sync".to_string()),
    ]);
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(cluster);
    if is_label_value(&encoded) {
        labels.insert(CLUSTER_ID_LABEL.to_string(), encoded);
    }
    labels
}

/// Label values are at most 63 characters, begin and end with an
/// alphanumeric, and otherwise contain only alphanumerics, `-`, `_` and `.`.
fn is_label_value(value: &str) -> bool {
    let bytes = value.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return true;
    };
    bytes.len() <= LABEL_VALUE_MAX
        && first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn seconds(d: Duration) -> i32 {
    d.as_secs().try_into().unwrap_or(i32::MAX)
}

// === impl CoordinationArgs ===

impl CoordinationArgs {
    /// Resolves the Lease timing
    pub fn params(&self) -> CoordinationParams {
        CoordinationParams {
            lease_duration: self.lease_duration,
            renew_interval: self
                .renew_interval
                .unwrap_or_else(|| CoordinationParams::default_renew_interval(self.lease_duration)),
            cleanup_interval: self.cleanup_interval,
        }
    }
}

impl Default for CoordinationArgs {
    fn default() -> Self {
        let params = CoordinationParams::default();
        Self {
            namespace: None,
            lease_duration: params.lease_duration,
            renew_interval: None,
            cleanup_interval: params.cleanup_interval,
        }
    }
}

// === impl CoordinationParams ===

impl CoordinationParams {
    const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(20);

    /// A third of the Lease duration, and at least 20s
    pub fn default_renew_interval(lease_duration: Duration) -> Duration {
        (lease_duration / 3).max(Self::MIN_RENEW_INTERVAL)
    }
}

impl Default for CoordinationParams {
    fn default() -> Self {
        let lease_duration = Duration::from_secs(60);
        Self {
            lease_duration,
            renew_interval: Self::default_renew_interval(lease_duration),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

// === impl LeaseCoordinator ===

impl LeaseCoordinator {
    const WATCH_MIN_BACKOFF: Duration = Duration::from_secs(1);
    const WATCH_MAX_BACKOFF: Duration = Duration::from_secs(30);

    /// Creates a coordinator acting as `identity`.
    ///
    /// Renewal loops stop when `shutdown` is cancelled; their Leases then
    /// lapse and are eventually swept by the leader.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        identity: impl Into<String>,
        params: CoordinationParams,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                identity: identity.into(),
                params,
                shutdown,
                renewals: Mutex::default(),
            }),
        }
    }

    /// This replica's identity
    #[inline]
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// The coordinator's timing
    #[inline]
    pub fn params(&self) -> &CoordinationParams {
        &self.inner.params
    }

    /// Clusters whose Leases this replica is renewing
    pub fn renewing(&self) -> Vec<String> {
        let mut clusters = self
            .inner
            .renewals
            .lock()
            .by_cluster
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        clusters.sort();
        clusters
    }

    /// Announces that this replica connected to `cluster`.
    ///
    /// If the cluster's Lease already exists, whoever holds it, it is left
    /// alone. Otherwise a Lease held by this replica is created and renewed in
    /// the background until [`LeaseCoordinator::ensure_on_disconnect`] is
    /// called, the Lease is deleted or taken over, or the process shuts down.
    pub async fn ensure_on_connect(&self, cluster: &str) -> Result<(), Error> {
        let name = lease_name(cluster);
        if let Some(existing) = self.inner.store.get(&name).await? {
            let holder = existing
                .spec
                .as_ref()
                .and_then(|s| s.holder_identity.as_deref())
                .unwrap_or_default();
            debug!(%cluster, lease = %name, %holder, "Cluster lease already exists");
            return Ok(());
        }

        match self.inner.store.create(self.new_lease(cluster, &name)).await {
            Ok(_) => info!(%cluster, lease = %name, "Created cluster lease"),
            Err(Error::AlreadyExists(_)) => {
                debug!(%cluster, lease = %name, "Cluster lease was created concurrently");
                return Ok(());
            }
            Err(error) => return Err(error),
        }

        self.spawn_renewal(cluster, name);
        Ok(())
    }

    /// Announces that this replica disconnected from `cluster`, stopping its
    /// renewal and deleting the cluster's Lease. A missing Lease is not an
    /// error.
    pub async fn ensure_on_disconnect(&self, cluster: &str) -> Result<(), Error> {
        let renewal = self.inner.renewals.lock().by_cluster.remove(cluster);
        if let Some((_, token)) = renewal {
            token.cancel();
        }

        let name = lease_name(cluster);
        match self.inner.store.delete(&name, None).await {
            Ok(()) => {
                info!(%cluster, lease = %name, "Deleted cluster lease");
                Ok(())
            }
            Err(Error::NotFound(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Mirrors cluster Leases until `shutdown` is cancelled.
    ///
    /// The first observation of a valid Lease held by another replica is
    /// reported through [`ConnectionHandler::on_connect`]; every deletion is
    /// reported through [`ConnectionHandler::on_disconnect`]. When the watch
    /// re-lists, Leases that disappeared in the meantime are reported as
    /// deleted. Watch errors are logged and retried with a backoff.
    pub async fn run_watcher(
        &self,
        handler: Arc<dyn ConnectionHandler>,
        shutdown: CancellationToken,
    ) {
        let events = LogAndSleep::exponential(
            Self::WATCH_MIN_BACKOFF,
            Self::WATCH_MAX_BACKOFF,
            self.inner.store.watch(),
        );
        tokio::pin!(events);

        // Lease name -> cluster, for every Lease observed so far.
        let mut known = HashMap::<String, String>::new();
        let mut relisted: Option<HashSet<String>> = None;
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return,
                event = events.next() => match event {
                    Some(event) => event,
                    None => {
                        warn!("Cluster lease watch ended");
                        return;
                    }
                },
            };

            match event {
                watcher::Event::Init => {
                    trace!("Listing cluster leases");
                    relisted = Some(HashSet::new());
                }
                watcher::Event::InitApply(lease) => {
                    if let (Some(seen), Some(name)) =
                        (relisted.as_mut(), lease.metadata.name.as_ref())
                    {
                        seen.insert(name.clone());
                    }
                    self.observe(&lease, &mut known, &*handler).await;
                }
                watcher::Event::InitDone => {
                    let Some(seen) = relisted.take() else {
                        continue;
                    };
                    let vanished = known
                        .keys()
                        .filter(|name| !seen.contains(*name))
                        .cloned()
                        .collect::<Vec<_>>();
                    for name in vanished {
                        if let Some(cluster) = known.remove(&name) {
                            info!(%cluster, lease = %name, "Cluster lease vanished while re-listing");
                            handler.on_disconnect(&cluster).await;
                        }
                    }
                }
                watcher::Event::Apply(lease) => {
                    self.observe(&lease, &mut known, &*handler).await;
                }
                watcher::Event::Delete(lease) => {
                    if let Some(name) = lease.metadata.name.as_ref() {
                        known.remove(name);
                    }
                    match cluster_id_of(&lease) {
                        Some(cluster) => {
                            debug!(%cluster, "Cluster lease deleted");
                            handler.on_disconnect(&cluster).await;
                        }
                        None => {
                            warn!(lease = ?lease.metadata.name, "Deleted lease has no cluster identifier");
                        }
                    }
                }
            }
        }
    }

    /// Deletes lapsed cluster Leases every cleanup interval until `shutdown`
    /// is cancelled. Only the leader should run this.
    pub async fn run_leader_cleanup(&self, shutdown: CancellationToken) {
        let period = self.inner.params.cleanup_interval;
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?period, "Sweeping lapsed cluster leases");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Stopped sweeping cluster leases");
                    return;
                }
                _ = interval.tick() => {}
            }
            match self.sweep_stale(Utc::now()).await {
                Ok(0) => trace!("No lapsed cluster leases"),
                Ok(deleted) => info!(deleted, "Deleted lapsed cluster leases"),
                Err(error) => warn!(%error, "Failed to list cluster leases"),
            }
        }
    }

    /// Deletes every cluster Lease that is not valid at `now`, returning the
    /// number deleted.
    ///
    /// Each deletion is conditioned on the Lease's observed
    /// `resourceVersion`, so a Lease renewed since it was listed survives.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let mut deleted = 0;
        for lease in self.inner.store.list().await? {
            if is_lease_valid(&lease, now) {
                continue;
            }
            let Some(name) = lease.metadata.name.as_deref() else {
                continue;
            };
            let cluster = cluster_id_of(&lease).unwrap_or_default();
            match self
                .inner
                .store
                .delete(name, lease.metadata.resource_version.as_deref())
                .await
            {
                Ok(()) => {
                    info!(%cluster, lease = %name, "Deleted lapsed cluster lease");
                    deleted += 1;
                }
                Err(Error::NotFound(_) | Error::Conflict(_)) => {
                    debug!(%cluster, lease = %name, "Cluster lease changed since it was listed");
                }
                Err(error) => {
                    warn!(%error, %cluster, lease = %name, "Failed to delete lapsed cluster lease");
                }
            }
        }
        Ok(deleted)
    }

    async fn observe(
        &self,
        lease: &Lease,
        known: &mut HashMap<String, String>,
        handler: &dyn ConnectionHandler,
    ) {
        let Some(name) = lease.metadata.name.as_ref() else {
            return;
        };
        if known.contains_key(name) {
            return;
        }
        let Some(cluster) = cluster_id_of(lease) else {
            warn!(lease = %name, "Lease has no cluster identifier");
            return;
        };
        known.insert(name.clone(), cluster.clone());

        let holder = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            .unwrap_or_default();
        if holder == self.inner.identity {
            return;
        }
        if !is_lease_valid(lease, Utc::now()) {
            debug!(%cluster, %holder, "Ignoring lapsed cluster lease");
            return;
        }
        debug!(%cluster, %holder, "Cluster connected by another replica");
        handler.on_connect(&cluster).await;
    }

    fn new_lease(&self, cluster: &str, name: &str) -> Lease {
        let now = Utc::now();
        Lease {
            metadata: metav1::ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(cluster_labels(cluster)),
                annotations: Some(BTreeMap::from([(
                    CLUSTER_ID_ANNOTATION.to_string(),
                    cluster.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.inner.identity.clone()),
                acquire_time: Some(metav1::MicroTime(now)),
                renew_time: Some(metav1::MicroTime(now)),
                lease_duration_seconds: Some(seconds(self.inner.params.lease_duration)),
                ..Default::default()
            }),
        }
    }

    fn spawn_renewal(&self, cluster: &str, name: String) {
        let token = self.inner.shutdown.child_token();
        let id = {
            let mut renewals = self.inner.renewals.lock();
            renewals.next_id += 1;
            let id = renewals.next_id;
            if let Some((_, prior)) = renewals
                .by_cluster
                .insert(cluster.to_string(), (id, token.clone()))
            {
                prior.cancel();
            }
            id
        };

        let coordinator = self.clone();
        let cluster = cluster.to_string();
        tokio::spawn(async move {
            coordinator.renew_until_stopped(&cluster, &name, &token).await;
            let mut renewals = coordinator.inner.renewals.lock();
            if renewals.by_cluster.get(&cluster).is_some_and(|(i, _)| *i == id) {
                renewals.by_cluster.remove(&cluster);
            }
        });
    }

    async fn renew_until_stopped(&self, cluster: &str, name: &str, token: &CancellationToken) {
        let period = self.inner.params.renew_interval;
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = interval.tick() => {}
            }
            match self.renew(name).await {
                Ok(Renewal::Renewed) => {
                    trace!(%cluster, lease = %name, "Renewed cluster lease");
                }
                Ok(Renewal::Gone) => {
                    info!(%cluster, lease = %name, "Cluster lease was deleted; no longer renewing");
                    return;
                }
                Ok(Renewal::TakenOver(holder)) => {
                    info!(
                        %cluster,
                        lease = %name,
                        %holder,
                        "Cluster lease is held by another replica; no longer renewing"
                    );
                    return;
                }
                Err(error) => {
                    warn!(%error, %cluster, lease = %name, "Failed to renew cluster lease");
                }
            }
        }
    }

    async fn renew(&self, name: &str) -> Result<Renewal, Error> {
        let Some(mut lease) = self.inner.store.get(name).await? else {
            return Ok(Renewal::Gone);
        };
        let spec = lease.spec.get_or_insert_with(Default::default);
        match spec.holder_identity.as_deref() {
            Some(holder) if holder == self.inner.identity => {}
            holder => return Ok(Renewal::TakenOver(holder.unwrap_or_default().to_string())),
        }
        spec.renew_time = Some(metav1::MicroTime(Utc::now()));
        spec.lease_duration_seconds = Some(seconds(self.inner.params.lease_duration));

        match self.inner.store.replace(lease).await {
            Ok(_) => Ok(Renewal::Renewed),
            Err(Error::NotFound(_)) => Ok(Renewal::Gone),
            Err(error) => Err(error),
        }
    }
}

impl std::fmt::Debug for LeaseCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseCoordinator")
            .field("identity", &self.inner.identity)
            .field("params", &self.inner.params)
            .finish_non_exhaustive()
    }
}
