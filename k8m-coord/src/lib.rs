//! Coordination primitives for k8m replicas, built on [`kube`]
//!
//! k8m is composed of feature modules that are installed, enabled and started
//! by a [`PluginManager`](plugin::PluginManager). Replicas elect a leader
//! through a Kubernetes Lease so that singleton background work runs exactly
//! once, announce leadership transitions on an in-process
//! [`EventBus`](bus::EventBus), and propagate connections to managed clusters
//! to each other through per-cluster Leases.
//!
//! # Crate Features
//!
//! What functionality is provided by `k8m-coord` is controlled by a number of
//! [Cargo features]. The plugin manager, event bus and leadership state are
//! always available. The following feature flags are available:
//!
//! ### Module Features
//!
//! - **leader**: Enables the [`leader`] and [`lease`] modules (and the
//!   [`client`] module).
//! - **coordination**: Enables the [`coordinator`] module (and the [`client`]
//!   module).
//! - **log**: Enables the [`log`] module.
//! - **runtime**: Enables the [`runtime`], [`shutdown`] and [`plugins`]
//!   modules. Enabling this feature flag also enables the **leader**,
//!   **coordination** and **log** features. This feature is enabled by
//!   default.
//!
//! ### Optional Dependencies
//!
//! - **clap**: Enables support for command-line argument parsing using
//!   [`clap`]. When this feature is enabled, implementations of the
//!   [`clap::Args`] trait are enabled for the [`ClientArgs`],
//!   [`ElectionArgs`](leader::ElectionArgs),
//!   [`CoordinationArgs`](coordinator::CoordinationArgs) and
//!   [`LogArgs`](log::LogArgs) types.
//!
//! ### TLS Features
//!
//! - **rustls-tls**: Use [`rustls`] as the Kubernetes client's TLS
//!   implementation.
//!
//! [`kube`]: https://github.com/kube-rs/kube-rs
//! [Cargo features]: https://doc.rust-lang.org/cargo/reference/features.html
//! [`clap`]: https://crates.io/crates/clap
//! [`clap::Args`]: https://docs.rs/clap/4/clap/trait.Args.html
//! [`rustls`]: https://crates.io/crates/rustls

#![deny(rust_2018_idioms)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod bus;
pub mod duration;
pub mod errors;
pub mod leadership;
pub mod plugin;

#[cfg(any(feature = "leader", feature = "coordination"))]
#[cfg_attr(docsrs, doc(cfg(any(feature = "leader", feature = "coordination"))))]
pub mod client;

#[cfg(feature = "coordination")]
#[cfg_attr(docsrs, doc(cfg(feature = "coordination")))]
pub mod coordinator;

#[cfg(feature = "leader")]
#[cfg_attr(docsrs, doc(cfg(feature = "leader")))]
pub mod leader;

#[cfg(feature = "leader")]
#[cfg_attr(docsrs, doc(cfg(feature = "leader")))]
pub mod lease;

#[cfg(feature = "log")]
#[cfg_attr(docsrs, doc(cfg(feature = "log")))]
pub mod log;

#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub mod plugins;

#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub mod runtime;

#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub mod shutdown;

pub use self::bus::{Event, EventBus, EventType};
pub use self::leadership::Leadership;
pub use self::plugin::{Lifecycle, Module, PluginManager, Status};

#[cfg(any(feature = "leader", feature = "coordination"))]
pub use self::client::ClientArgs;

#[cfg(feature = "coordination")]
pub use self::coordinator::LeaseCoordinator;

#[cfg(feature = "leader")]
pub use self::leader::LeaderElector;

#[cfg(feature = "log")]
pub use self::log::{LogFilter, LogFormat, LogInitError};

#[cfg(feature = "runtime")]
pub use self::runtime::Runtime;
