//! A Lease-backed lock for electing a single leader among replicas
//!
//! [`LeaseLock`] holds a [`coordv1::Lease`] on behalf of one identity. The
//! holder renews the Lease every retry period; other replicas re-read it on
//! the same period and claim it once it has expired or been vacated. Writes
//! carry the last observed `resourceVersion`, so concurrent claims conflict
//! rather than overwrite one another.

use backon::{ExponentialBuilder, Retryable};
use k8s_openapi::{api::coordination::v1 as coordv1, apimachinery::pkg::apis::meta::v1 as metav1};
use std::sync::Arc;
use tokio::time::{self, Duration};

/// Holds a Kubernetes `Lease` for a single identity
pub struct LeaseLock {
    api: Api,
    name: String,
    identity: String,
    state: tokio::sync::Mutex<State>,
}

/// Timing used when claiming and renewing a lock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimParams {
    /// How long a claim remains valid after its last renewal.
    pub lease_duration: Duration,

    /// How long the holder may keep failing to renew before it must consider
    /// its claim lost. Must be less than `lease_duration`.
    pub renew_deadline: Duration,

    /// How often the holder renews, and how often other replicas re-read the
    /// Lease.
    pub retry_period: Duration,
}

/// The observed holder of a lock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claim {
    /// The identity of the claim holder.
    pub holder: String,

    /// When the claim was last renewed.
    pub renewed: chrono::DateTime<chrono::Utc>,

    /// When the claim expires unless it is renewed.
    pub expiry: chrono::DateTime<chrono::Utc>,
}

/// Indicates an error interacting with the Lease API
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error was received from the Kubernetes API
    #[error("lease request failed: {0}")]
    Api(#[from] kube_client::Error),

    /// Lease resource does not have a resourceVersion
    #[error("lease does not have a resource version")]
    MissingResourceVersion,

    /// Lease resource does not have a spec
    #[error("lease does not have a spec")]
    MissingSpec,

    /// A Kubernetes API call timed out
    #[error("timed out")]
    Timeout,
}

#[derive(Clone, Debug)]
struct State {
    version: String,
    transitions: i32,
    claim: Option<Arc<Claim>>,
}

/// A namespaced Lease API
pub type Api = kube_client::Api<coordv1::Lease>;

/// The receiving half of a spawned lock: the latest observed claim, updated
/// every retry period, and the task maintaining it.
pub type Spawned = (
    tokio::sync::watch::Receiver<Arc<Claim>>,
    tokio::task::JoinHandle<Result<(), Error>>,
);

// === impl ClaimParams ===

impl ClaimParams {
    /// The time between the renew deadline and the claim's expiry
    #[inline]
    pub fn renew_grace(&self) -> Duration {
        self.lease_duration.saturating_sub(self.renew_deadline)
    }
}

impl Default for ClaimParams {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            renew_deadline: Duration::from_secs(50),
            retry_period: Duration::from_secs(10),
        }
    }
}

// === impl Claim ===

impl Claim {
    /// Returns true iff the claim is still valid according to the system clock
    #[inline]
    pub fn is_current(&self) -> bool {
        chrono::Utc::now() < self.expiry
    }

    /// Returns true iff the claim is still valid for the provided identity
    #[inline]
    pub fn is_current_for(&self, identity: &str) -> bool {
        self.holder == identity && self.is_current()
    }

    /// Returns true iff `identity` holds the claim and has not passed the
    /// point at which it must stop acting as the holder
    pub fn is_leading(&self, identity: &str, grace: Duration) -> bool {
        self.holder == identity && chrono::Utc::now() < self.deadline(grace)
    }

    /// Waits until there is a grace period remaining before the claim expires
    pub async fn expire_with_grace(&self, grace: Duration) {
        if let Ok(remaining) = (self.deadline(grace) - chrono::Utc::now()).to_std() {
            if !remaining.is_zero() {
                time::sleep(remaining).await;
            }
        }
    }

    fn deadline(&self, grace: Duration) -> chrono::DateTime<chrono::Utc> {
        self.expiry - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

// === impl LeaseLock ===

impl LeaseLock {
    const FIELD_MANAGER: &'static str = "k8m";
    const MIN_BACKOFF: Duration = Duration::from_millis(5);
    const API_TIMEOUT: Duration = Duration::from_secs(10);

    /// Initializes the lock's state from the Kubernetes API.
    ///
    /// The named Lease must already exist, or a 404 error is returned.
    pub async fn init(
        api: Api,
        name: impl ToString,
        identity: impl ToString,
    ) -> Result<Self, Error> {
        let name = name.to_string();
        let state = Self::get(&api, &name).await?;
        Ok(Self {
            api,
            name,
            identity: identity.to_string(),
            state: tokio::sync::Mutex::new(state),
        })
    }

    /// The identity this lock claims on behalf of
    #[inline]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the last observed claim without reading the API
    pub async fn claimed(&self) -> Option<Arc<Claim>> {
        self.state.lock().await.claim.clone()
    }

    /// Claims or renews the lock.
    ///
    /// If the lock is held by this identity, it is renewed. If it is held by
    /// another identity whose claim is current, that claim is returned
    /// unchanged. Otherwise, this identity claims it.
    pub async fn ensure_claimed(&self, params: &ClaimParams) -> Result<Arc<Claim>, Error> {
        let mut state = self.state.lock().await;
        loop {
            let held = state.claim.as_ref().map(|c| c.holder == self.identity);
            if held == Some(false) {
                if let Some(claim) = state.claim.as_ref().filter(|c| c.is_current()) {
                    return Ok(claim.clone());
                }
            }

            let res = if held == Some(true) {
                self.renew(&state, params).await
            } else {
                self.acquire(&state, params).await
            };
            match res {
                Ok(next) => {
                    let claim = next.claim.clone().ok_or(Error::MissingSpec)?;
                    *state = next;
                    return Ok(claim);
                }
                Err(e) if Self::is_conflict(&e) => {
                    // Another replica wrote the Lease since it was last read.
                    tracing::debug!(lease = %self.name, "Conflict; re-reading lease");
                    *state = Self::get(&self.api, &self.name).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Releases the lock if it is currently held by this identity, so that
    /// another replica may claim it before the claim would have expired.
    pub async fn vacate(&self) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        let Some(claim) = state.claim.take() else {
            return Ok(false);
        };
        if !claim.is_current_for(&self.identity) {
            state.claim = Some(claim);
            return Ok(false);
        }

        let lease = self
            .patch(&kube_client::api::Patch::Strategic(serde_json::json!({
                "apiVersion": "coordination.k8s.io/v1",
                "kind": "Lease",
                "metadata": {
                    "resourceVersion": state.version,
                },
                "spec": {
                    "acquireTime": Option::<()>::None,
                    "renewTime": Option::<()>::None,
                    "holderIdentity": Option::<()>::None,
                },
            })))
            .await?;
        state.version = lease
            .metadata
            .resource_version
            .ok_or(Error::MissingResourceVersion)?;
        tracing::info!(lease = %self.name, identity = %self.identity, "Released lease");
        Ok(true)
    }

    /// Spawns a task that maintains the lock.
    ///
    /// Every retry period the task renews the claim (when held) or attempts to
    /// take it over (when it has expired or been vacated), publishing the
    /// latest claim to the returned receiver. Transient API errors are retried
    /// with an exponential backoff capped at the retry period.
    ///
    /// When all receivers are dropped, the task vacates the lock and
    /// completes.
    pub async fn spawn(self, params: ClaimParams) -> Result<Spawned, Error> {
        let claim = self.ensure_claimed(&params).await?;
        let (tx, rx) = tokio::sync::watch::channel(claim);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Self::MIN_BACKOFF)
            .with_max_delay(params.retry_period)
            .with_jitter()
            .without_max_times();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = tx.closed() => break,
                    _ = time::sleep(params.retry_period) => {}
                }

                let refresh = (|| self.refresh(&params))
                    .retry(backoff)
                    .when(Self::is_transient)
                    .notify(|error: &Error, after: Duration| {
                        tracing::debug!(%error, ?after, lease = %self.name, "Failed to refresh lease; retrying");
                    });
                let claim = tokio::select! {
                    biased;
                    _ = tx.closed() => break,
                    res = refresh => res?,
                };
                if tx.send(claim).is_err() {
                    break;
                }
            }

            self.vacate().await?;
            Ok(())
        });

        Ok((rx, task))
    }

    /// Re-reads the Lease unless it is held by this identity, then claims or
    /// renews it.
    async fn refresh(&self, params: &ClaimParams) -> Result<Arc<Claim>, Error> {
        let held = self
            .claimed()
            .await
            .is_some_and(|c| c.holder == self.identity);
        if !held {
            let state = Self::get(&self.api, &self.name).await?;
            *self.state.lock().await = state;
        }
        self.ensure_claimed(params).await
    }

    /// Takes over the Lease with a server-side apply, counting a leadership
    /// transition.
    async fn acquire(&self, state: &State, params: &ClaimParams) -> Result<State, Error> {
        let now = chrono::Utc::now();
        let seconds = Self::seconds(params.lease_duration);
        let lease = self
            .patch(&kube_client::api::Patch::Apply(serde_json::json!({
                "apiVersion": "coordination.k8s.io/v1",
                "kind": "Lease",
                "metadata": {
                    "resourceVersion": state.version,
                },
                "spec": {
                    "acquireTime": metav1::MicroTime(now),
                    "renewTime": metav1::MicroTime(now),
                    "holderIdentity": self.identity,
                    "leaseDurationSeconds": seconds,
                    "leaseTransitions": state.transitions + 1,
                },
            })))
            .await?;
        tracing::info!(lease = %self.name, identity = %self.identity, "Acquired lease");
        self.claimed_state(lease, now, seconds, state.transitions + 1)
    }

    /// Refreshes `renewTime` with a strategic merge.
    async fn renew(&self, state: &State, params: &ClaimParams) -> Result<State, Error> {
        let now = chrono::Utc::now();
        let seconds = Self::seconds(params.lease_duration);
        let lease = self
            .patch(&kube_client::api::Patch::Strategic(serde_json::json!({
                "apiVersion": "coordination.k8s.io/v1",
                "kind": "Lease",
                "metadata": {
                    "resourceVersion": state.version,
                },
                "spec": {
                    "renewTime": metav1::MicroTime(now),
                    "leaseDurationSeconds": seconds,
                },
            })))
            .await?;
        tracing::trace!(lease = %self.name, "Renewed lease");
        self.claimed_state(lease, now, seconds, state.transitions)
    }

    fn claimed_state(
        &self,
        lease: coordv1::Lease,
        now: chrono::DateTime<chrono::Utc>,
        seconds: i32,
        transitions: i32,
    ) -> Result<State, Error> {
        let version = lease
            .metadata
            .resource_version
            .ok_or(Error::MissingResourceVersion)?;
        let claim = Claim {
            holder: self.identity.clone(),
            renewed: now,
            expiry: now + chrono::Duration::seconds(seconds.into()),
        };
        Ok(State {
            version,
            transitions,
            claim: Some(Arc::new(claim)),
        })
    }

    async fn patch<P>(&self, patch: &kube_client::api::Patch<P>) -> Result<coordv1::Lease, Error>
    where
        P: serde::Serialize + std::fmt::Debug,
    {
        tracing::trace!(?patch);
        let params = kube_client::api::PatchParams {
            field_manager: Some(Self::FIELD_MANAGER.to_string()),
            force: matches!(patch, kube_client::api::Patch::Apply(_)),
            ..Default::default()
        };
        time::timeout(Self::API_TIMEOUT, self.api.patch(&self.name, &params, patch))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Into::into)
    }

    async fn get(api: &Api, name: &str) -> Result<State, Error> {
        let lease = time::timeout(Self::API_TIMEOUT, api.get(name))
            .await
            .map_err(|_| Error::Timeout)??;
        let version = lease
            .metadata
            .resource_version
            .ok_or(Error::MissingResourceVersion)?;
        let spec = lease.spec.ok_or(Error::MissingSpec)?;
        let transitions = spec.lease_transitions.unwrap_or(0);

        let claim = match (
            spec.holder_identity,
            spec.renew_time,
            spec.lease_duration_seconds,
        ) {
            (Some(holder), Some(metav1::MicroTime(renewed)), Some(seconds)) => {
                let expiry = renewed + chrono::Duration::seconds(seconds.into());
                (expiry > chrono::Utc::now()).then(|| {
                    Arc::new(Claim {
                        holder,
                        renewed,
                        expiry,
                    })
                })
            }
            _ => None,
        };

        Ok(State {
            version,
            transitions,
            claim,
        })
    }

    fn seconds(d: Duration) -> i32 {
        d.as_secs().try_into().unwrap_or(i32::MAX)
    }

    fn is_conflict(err: &Error) -> bool {
        matches!(
            err,
            Error::Api(kube_client::Error::Api(kube_core::ErrorResponse { code, .. }))
                if hyper::StatusCode::from_u16(*code).ok() == Some(hyper::StatusCode::CONFLICT)
        )
    }

    fn is_transient(err: &Error) -> bool {
        !matches!(
            err,
            Error::Api(
                kube_client::Error::Auth(_)
                    | kube_client::Error::Discovery(_)
                    | kube_client::Error::BuildRequest(_)
                    | kube_client::Error::InferConfig(_)
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(holder: &str, renewed_ago: i64, duration: i64) -> Claim {
        let renewed = chrono::Utc::now() - chrono::Duration::seconds(renewed_ago);
        Claim {
            holder: holder.to_string(),
            renewed,
            expiry: renewed + chrono::Duration::seconds(duration),
        }
    }

    #[test]
    fn default_timing() {
        let params = ClaimParams::default();
        assert_eq!(params.lease_duration, Duration::from_secs(60));
        assert_eq!(params.renew_deadline, Duration::from_secs(50));
        assert_eq!(params.retry_period, Duration::from_secs(10));
        assert_eq!(params.renew_grace(), Duration::from_secs(10));
    }

    #[test]
    fn claim_currency() {
        let grace = Duration::from_secs(10);

        let fresh = claim("pod-a_1", 5, 60);
        assert!(fresh.is_current_for("pod-a_1"));
        assert!(!fresh.is_current_for("pod-b_2"));
        assert!(fresh.is_leading("pod-a_1", grace));

        // Past the renew deadline but not yet expired.
        let lapsing = claim("pod-a_1", 55, 60);
        assert!(lapsing.is_current());
        assert!(!lapsing.is_leading("pod-a_1", grace));

        let expired = claim("pod-a_1", 61, 60);
        assert!(!expired.is_current());
    }

    #[tokio::test]
    async fn expire_with_grace_returns_immediately_when_past() {
        let lapsed = claim("pod-a_1", 55, 60);
        tokio::time::timeout(
            Duration::from_secs(1),
            lapsed.expire_with_grace(Duration::from_secs(10)),
        )
        .await
        .expect("must not wait");
    }
}
