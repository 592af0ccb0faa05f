//! Pluggable feature modules
//!
//! A [`Module`] bundles a [`Lifecycle`] implementation with descriptive
//! metadata, dependency declarations, cron specs and route-mounting callbacks.
//! The [`PluginManager`] owns every registered module and drives it through
//! its statuses:
//!
//! ```text
//! Discovered --install--> Installed --enable--> Enabled --start--> Running
//!                             ^                    |                  |
//!                             |                    +<-----stop-------+
//!                         Disabled <---disable-----+ (Stopped)
//! ```
//!
//! A module may only be installed once all of its dependencies are installed,
//! and only enabled (or started) once all of its dependencies are enabled.
//! [`PluginManager::start`] installs, enables and starts every module in an
//! order that honors dependencies and `run_after` hints.

mod cron;
mod lifecycle;
mod manager;
mod module;
mod order;
mod status;
mod store;

#[cfg(test)]
mod tests;

pub use self::{
    cron::{CronInfo, EntryId},
    lifecycle::{
        BaseContext, BoxError, EnableContext, InstallContext, Lifecycle, Scheduler,
        UpgradeContext,
    },
    manager::{Builder, PluginManager, PluginSummary, Registrar},
    module::{Meta, Module, RouteFn, RouteGroup, RouteKind},
    status::{Phase, Status},
    store::{MemoryStore, Record, StateStore},
};

/// Errors returned by the [`PluginManager`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A module name was empty or already registered.
    #[error("plugin name {0:?} is empty or already registered")]
    DuplicateName(String),

    /// No module with the given name is registered.
    #[error("plugin {0:?} is not registered")]
    NotRegistered(String),

    /// A dependency has not reached the required status.
    #[error("plugin {name:?} requires {dependency:?} to be {required}")]
    UnmetDependency {
        /// The module being transitioned.
        name: String,
        /// The dependency that is not ready.
        dependency: String,
        /// The minimum status the dependency must have.
        required: Status,
    },

    /// A cron spec could not be parsed.
    #[error("invalid cron expression {spec:?}: {reason}")]
    InvalidCronExpression {
        /// The rejected spec.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A lifecycle hook failed. The module's status is unchanged.
    #[error("plugin {name:?} failed to {phase}: {source}")]
    Lifecycle {
        /// The module whose hook failed.
        name: String,
        /// The phase that failed.
        phase: Phase,
        /// The hook's error.
        #[source]
        source: BoxError,
    },

    /// The module's current status does not permit the requested phase.
    #[error("plugin {name:?} cannot {phase} while {status}")]
    InvalidTransition {
        /// The module being transitioned.
        name: String,
        /// The requested phase.
        phase: Phase,
        /// The module's current status.
        status: Status,
    },
}

impl Error {
    fn lifecycle(name: &str, phase: Phase, source: BoxError) -> Self {
        Self::Lifecycle {
            name: name.to_string(),
            phase,
            source,
        }
    }
}
