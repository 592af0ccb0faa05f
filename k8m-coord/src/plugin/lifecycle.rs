use super::{manager::Shared, Error, Meta, PluginManager};
use crate::{bus::EventBus, leadership::Leadership};
use std::{
    future::Future,
    sync::{Arc, Weak},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// An error returned by a module's lifecycle hook
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The behavior of a pluggable feature module
///
/// Every hook has a no-op default so that a module only implements the phases
/// it cares about. An error aborts only that phase for that module: the
/// manager leaves the module's status unchanged and does not retry.
///
/// Hooks must not call back into the [`PluginManager`]'s status transitions
/// (install, enable, and so on), which are serialized. Scheduling operations
/// through [`BaseContext::scheduler`] are fine.
#[async_trait::async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    /// Called on first activation. Must tolerate being called again (for
    /// example, by creating schemas only if they do not exist).
    async fn install(&self, _ctx: &InstallContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called instead of [`Lifecycle::install`] when a previously installed
    /// version differs from the module's version. Migrations are
    /// forward-only.
    async fn upgrade(&self, _ctx: &UpgradeContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called on every activation, including after a process restart. Must
    /// not duplicate background work.
    async fn enable(&self, _ctx: &EnableContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Hides the module's capabilities without deleting its data.
    async fn disable(&self, _ctx: &BaseContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Removes the module. Owned data is deleted only when
    /// [`InstallContext::keep_data`] is false.
    async fn uninstall(&self, _ctx: &InstallContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Starts the module's background work and returns promptly.
    ///
    /// Work should be spawned with [`BaseContext::spawn`] and should complete
    /// when [`BaseContext::shutdown`] is cancelled.
    async fn start(&self, _ctx: &BaseContext) -> Result<(), BoxError> {
        Ok(())
    }

    /// Runs one scheduled invocation of the given cron spec. An invocation is
    /// skipped while the previous invocation of the same spec is running.
    async fn start_cron(&self, _ctx: &BaseContext, _spec: &str) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Capabilities available to every lifecycle phase
#[derive(Clone, Debug)]
pub struct BaseContext {
    meta: Meta,
    bus: EventBus,
    leadership: Leadership,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    scheduler: Scheduler,
}

/// Capabilities available while installing or uninstalling a module
#[derive(Clone, Debug)]
pub struct InstallContext {
    base: BaseContext,
    keep_data: bool,
}

/// Capabilities available while upgrading a module
#[derive(Clone, Debug)]
pub struct UpgradeContext {
    base: BaseContext,
    from: String,
    to: String,
}

/// Capabilities available while enabling a module
#[derive(Clone, Debug)]
pub struct EnableContext {
    base: BaseContext,
}

/// Manages the cron entries of a single module
#[derive(Clone, Debug)]
pub struct Scheduler {
    shared: Weak<Shared>,
    module: String,
}

// === impl BaseContext ===

impl BaseContext {
    pub(super) fn new(
        meta: Meta,
        shared: &Arc<Shared>,
        shutdown: CancellationToken,
    ) -> Self {
        let scheduler = Scheduler {
            shared: Arc::downgrade(shared),
            module: meta.name.clone(),
        };
        Self {
            meta,
            bus: shared.bus.clone(),
            leadership: shared.leadership.clone(),
            shutdown,
            tasks: shared.tasks.clone(),
            scheduler,
        }
    }

    /// The module's name and version
    #[inline]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// The process-wide event bus
    #[inline]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The process-wide leadership state
    #[inline]
    pub fn leadership(&self) -> &Leadership {
        &self.leadership
    }

    /// A token that is cancelled when the module is stopped, disabled or
    /// uninstalled, or when the process shuts down
    #[inline]
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Manages this module's cron entries
    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The tracker that graceful shutdown waits on
    #[inline]
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Spawns a background task that graceful shutdown waits for
    pub fn spawn<F>(&self, task: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(task)
    }
}

// === impl InstallContext ===

impl InstallContext {
    pub(super) fn new(base: BaseContext, keep_data: bool) -> Self {
        Self { base, keep_data }
    }

    /// Capabilities shared by all phases
    #[inline]
    pub fn base(&self) -> &BaseContext {
        &self.base
    }

    /// The module's name and version
    #[inline]
    pub fn meta(&self) -> &Meta {
        self.base.meta()
    }

    /// When uninstalling, whether the module's data must be preserved
    #[inline]
    pub fn keep_data(&self) -> bool {
        self.keep_data
    }
}

// === impl UpgradeContext ===

impl UpgradeContext {
    pub(super) fn new(base: BaseContext, from: String, to: String) -> Self {
        Self { base, from, to }
    }

    /// Capabilities shared by all phases
    #[inline]
    pub fn base(&self) -> &BaseContext {
        &self.base
    }

    /// The module's name and version
    #[inline]
    pub fn meta(&self) -> &Meta {
        self.base.meta()
    }

    /// The previously installed version
    #[inline]
    pub fn from_version(&self) -> &str {
        &self.from
    }

    /// The version being installed
    #[inline]
    pub fn to_version(&self) -> &str {
        &self.to
    }
}

// === impl EnableContext ===

impl EnableContext {
    pub(super) fn new(base: BaseContext) -> Self {
        Self { base }
    }

    /// Capabilities shared by all phases
    #[inline]
    pub fn base(&self) -> &BaseContext {
        &self.base
    }

    /// The module's name and version
    #[inline]
    pub fn meta(&self) -> &Meta {
        self.base.meta()
    }
}

// === impl Scheduler ===

impl Scheduler {
    fn manager(&self) -> Result<PluginManager, Error> {
        self.shared
            .upgrade()
            .map(PluginManager::from_shared)
            .ok_or_else(|| Error::NotRegistered(self.module.clone()))
    }

    /// Schedules the given cron spec for this module
    pub fn ensure(&self, spec: &str) -> Result<(), Error> {
        self.manager()?.ensure_cron(&self.module, spec)
    }

    /// Removes the given cron spec for this module
    pub fn remove(&self, spec: &str) -> Result<(), Error> {
        self.manager()?.remove_cron(&self.module, spec)
    }

    /// Runs the given cron spec once, immediately
    pub fn run_once(&self, spec: &str) -> Result<(), Error> {
        self.manager()?.run_cron_once(&self.module, spec)
    }

    /// Schedules every cron spec the module declares
    pub fn ensure_all(&self) -> Result<(), Error> {
        self.manager()?.ensure_crons(&self.module)
    }

    /// Removes every cron entry the module has scheduled
    pub fn remove_all(&self) -> Result<(), Error> {
        self.manager()?.remove_crons(&self.module)
    }
}
