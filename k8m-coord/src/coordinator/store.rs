use super::Error;
use futures_util::{stream::BoxStream, StreamExt, TryStreamExt};
use k8s_openapi::api::coordination::v1::Lease;
use kube_client::api::{Api, DeleteParams, ListParams, PostParams, Preconditions};
use kube_runtime::watcher;

/// A stream of watch events for cluster Leases
pub type LeaseEvents = BoxStream<'static, Result<watcher::Event<Lease>, Error>>;

/// Reads and writes the cluster Leases in the coordination namespace
///
/// Implementations map "not found" and "conflict" responses onto
/// [`Error::NotFound`], [`Error::AlreadyExists`] and [`Error::Conflict`].
#[async_trait::async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Fetches the named Lease, if it exists.
    async fn get(&self, name: &str) -> Result<Option<Lease>, Error>;

    /// Creates a Lease. Fails with [`Error::AlreadyExists`] if the name is
    /// taken.
    async fn create(&self, lease: Lease) -> Result<Lease, Error>;

    /// Replaces a Lease. The Lease's `resourceVersion`, when set, must match
    /// the stored version.
    async fn replace(&self, lease: Lease) -> Result<Lease, Error>;

    /// Deletes the named Lease, optionally only if it still has the given
    /// `resourceVersion`.
    async fn delete(&self, name: &str, resource_version: Option<&str>) -> Result<(), Error>;

    /// Lists all cluster Leases.
    async fn list(&self) -> Result<Vec<Lease>, Error>;

    /// Watches cluster Leases, starting with a full listing.
    fn watch(&self) -> LeaseEvents;
}

/// A [`LeaseStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeLeases {
    api: Api<Lease>,
}

// === impl KubeLeases ===

impl KubeLeases {
    /// Label selector matching cluster Leases
    pub const SELECTOR: &'static str = "app=k8m,type=cluster-sync";

    /// Creates a store for the given namespace
    pub fn new(client: kube_client::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait::async_trait]
impl LeaseStore for KubeLeases {
    async fn get(&self, name: &str) -> Result<Option<Lease>, Error> {
        self.api.get_opt(name).await.map_err(Into::into)
    }

    async fn create(&self, lease: Lease) -> Result<Lease, Error> {
        let name = lease.metadata.name.clone().unwrap_or_default();
        self.api
            .create(&PostParams::default(), &lease)
            .await
            .map_err(|error| classify(error, &name, Error::AlreadyExists))
    }

    async fn replace(&self, lease: Lease) -> Result<Lease, Error> {
        let name = lease.metadata.name.clone().unwrap_or_default();
        self.api
            .replace(&name, &PostParams::default(), &lease)
            .await
            .map_err(|error| classify(error, &name, Error::Conflict))
    }

    async fn delete(&self, name: &str, resource_version: Option<&str>) -> Result<(), Error> {
        let params = DeleteParams {
            preconditions: resource_version.map(|version| Preconditions {
                resource_version: Some(version.to_string()),
                uid: None,
            }),
            ..Default::default()
        };
        self.api
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|error| classify(error, name, Error::Conflict))
    }

    async fn list(&self) -> Result<Vec<Lease>, Error> {
        let leases = self
            .api
            .list(&ListParams::default().labels(Self::SELECTOR))
            .await?;
        Ok(leases.items)
    }

    fn watch(&self) -> LeaseEvents {
        watcher::watcher(
            self.api.clone(),
            watcher::Config::default().labels(Self::SELECTOR),
        )
        .map_err(Error::from)
        .boxed()
    }
}

impl std::fmt::Debug for KubeLeases {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeLeases")
            .field("selector", &Self::SELECTOR)
            .finish_non_exhaustive()
    }
}

fn classify(error: kube_client::Error, name: &str, on_conflict: fn(String) -> Error) -> Error {
    match error {
        kube_client::Error::Api(kube_core::ErrorResponse { code, .. })
            if code == hyper::StatusCode::NOT_FOUND.as_u16() =>
        {
            Error::NotFound(name.to_string())
        }
        kube_client::Error::Api(kube_core::ErrorResponse { code, .. })
            if code == hyper::StatusCode::CONFLICT.as_u16() =>
        {
            on_conflict(name.to_string())
        }
        error => Error::Api(error),
    }
}
