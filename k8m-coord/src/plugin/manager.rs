use super::{
    cron::{CronEntry, CronInfo, EntryId, Schedule},
    lifecycle::{BaseContext, EnableContext, InstallContext, UpgradeContext},
    order, Error, MemoryStore, Module, Phase, Record, RouteFn, RouteGroup, RouteKind, StateStore,
    Status,
};
use crate::{bus::EventBus, leadership::Leadership};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::time;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

/// Registers the process's compiled-in modules
///
/// Invoked exactly once, by [`PluginManager::start`].
pub type Registrar = Box<dyn FnOnce(&PluginManager) -> Result<(), Error> + Send>;

/// Registers, sequences and runs pluggable feature modules
///
/// The manager is cheap to clone; clones share the same registry.
///
/// All registry state (modules, statuses, run tokens, cron entries and
/// mounted routes) is guarded by a single lock that is never held across a
/// lifecycle hook or any other I/O. Status transitions are additionally
/// serialized with one another so that two callers cannot interleave the
/// phases of a module.
#[derive(Clone)]
pub struct PluginManager {
    shared: Arc<Shared>,
}

/// Configures a [`PluginManager`]
#[derive(Default)]
#[must_use]
pub struct Builder {
    bus: Option<EventBus>,
    leadership: Option<Leadership>,
    store: Option<Arc<dyn StateStore>>,
    registrar: Option<Registrar>,
    shutdown: Option<CancellationToken>,
    tasks: Option<TaskTracker>,
}

/// Describes a registered module and its status
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    /// The module's unique name.
    pub name: String,
    /// The module's title.
    pub title: String,
    /// The module's version.
    pub version: String,
    /// The module's description.
    pub description: String,
    /// The module's current status.
    pub status: Status,
    /// Modules that must be enabled first.
    pub dependencies: Vec<String>,
    /// Modules that should be started first.
    pub run_after: Vec<String>,
    /// Declared cron schedules.
    pub crons: Vec<String>,
}

pub(crate) struct Shared {
    registry: RwLock<Registry>,
    phases: tokio::sync::Mutex<()>,
    store: Arc<dyn StateStore>,
    registrar: Mutex<Option<Registrar>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    pub(super) bus: EventBus,
    pub(super) leadership: Leadership,
    pub(super) tasks: TaskTracker,
}

#[derive(Default)]
struct Registry {
    modules: HashMap<String, Arc<Module>>,
    order: Vec<String>,
    status: HashMap<String, Status>,
    tokens: HashMap<String, CancellationToken>,
    crons: HashMap<CronKey, CronEntry>,
    next_entry: EntryId,
    mounted: HashSet<(RouteKind, String, String)>,
}

type CronKey = (String, String);

// === impl Builder ===

impl Builder {
    /// Uses the given event bus instead of a private one
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Uses the given leadership state instead of a private one
    pub fn with_leadership(mut self, leadership: Leadership) -> Self {
        self.leadership = Some(leadership);
        self
    }

    /// Persists module state in the given store
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers compiled-in modules when the manager is started
    pub fn with_registrar<F>(mut self, registrar: F) -> Self
    where
        F: FnOnce(&PluginManager) -> Result<(), Error> + Send + 'static,
    {
        self.registrar = Some(Box::new(registrar));
        self
    }

    /// Derives every module's cancellation token from the given token
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Tracks tasks spawned through [`BaseContext::spawn`] on the given tracker
    pub fn with_task_tracker(mut self, tasks: TaskTracker) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Builds the manager
    pub fn build(self) -> PluginManager {
        let shared = Shared {
            registry: RwLock::new(Registry::default()),
            phases: tokio::sync::Mutex::new(()),
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            registrar: Mutex::new(self.registrar),
            started: AtomicBool::new(false),
            shutdown: self.shutdown.unwrap_or_default(),
            bus: self.bus.unwrap_or_default(),
            leadership: self.leadership.unwrap_or_default(),
            tasks: self.tasks.unwrap_or_default(),
        };
        PluginManager {
            shared: Arc::new(shared),
        }
    }
}

// === impl PluginManager ===

impl PluginManager {
    /// Creates a manager builder
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub(super) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// The event bus shared with modules
    #[inline]
    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    /// The leadership state shared with modules
    #[inline]
    pub fn leadership(&self) -> &Leadership {
        &self.shared.leadership
    }

    /// Adds a module to the registry with [`Status::Discovered`]
    pub fn register(&self, module: Module) -> Result<(), Error> {
        let name = module.name().to_string();
        let mut reg = self.shared.registry.write();
        if name.is_empty() || reg.modules.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }
        reg.order.push(name.clone());
        reg.status.insert(name.clone(), Status::Discovered);
        reg.modules.insert(name.clone(), Arc::new(module));
        debug!(plugin = %name, "Registered");
        Ok(())
    }

    /// Returns the named module's status, if it is registered
    pub fn status_of(&self, name: &str) -> Option<Status> {
        self.shared.registry.read().status.get(name).copied()
    }

    /// Returns true if the named module is enabled (or running)
    pub fn is_enabled(&self, name: &str) -> bool {
        self.status_of(name).is_some_and(Status::is_enabled)
    }

    /// Describes every registered module, in registration order
    pub fn describe(&self) -> Vec<PluginSummary> {
        let reg = self.shared.registry.read();
        reg.order
            .iter()
            .filter_map(|name| {
                let module = reg.modules.get(name)?;
                Some(PluginSummary {
                    name: name.clone(),
                    title: module.title().to_string(),
                    version: module.version().to_string(),
                    description: module.description().to_string(),
                    status: reg.status.get(name).copied()?,
                    dependencies: module.dependencies().to_vec(),
                    run_after: module.run_after_hints().to_vec(),
                    crons: module.crons().to_vec(),
                })
            })
            .collect()
    }

    /// Runs the registrar, then installs, enables and starts every module
    ///
    /// Only the first call has an effect. Failures of individual modules are
    /// logged and do not prevent other modules from starting; an error is
    /// returned only if the registrar itself fails.
    pub async fn start(&self) -> Result<(), Error> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            warn!("Plugin manager already started");
            return Ok(());
        }

        let registrar = self.shared.registrar.lock().take();
        if let Some(registrar) = registrar {
            registrar(self)?;
        }

        self.install_all().await;
        self.enable_all().await;
        info!(
            running = self
                .describe()
                .iter()
                .filter(|p| p.status == Status::Running)
                .count(),
            "Plugins started"
        );
        Ok(())
    }

    /// Installs every registered module in startup order, best-effort
    pub async fn install_all(&self) {
        for name in self.startup_order() {
            if let Err(error) = self.install(&name).await {
                warn!(plugin = %name, %error, "Failed to install plugin");
            }
        }
    }

    /// Enables and starts every registered module in startup order,
    /// best-effort
    ///
    /// Modules that were disabled (including those persisted as disabled by a
    /// previous process) are skipped.
    pub async fn enable_all(&self) {
        for name in self.startup_order() {
            match self.status_of(&name) {
                None => continue,
                Some(Status::Disabled) => {
                    debug!(plugin = %name, "Plugin is disabled");
                    continue;
                }
                Some(_) => {}
            }

            if let Err(error) = self.enable(&name).await {
                warn!(plugin = %name, %error, "Failed to enable plugin");
                continue;
            }
            if let Err(error) = self.start_module(&name).await {
                warn!(plugin = %name, %error, "Failed to start plugin");
            }
        }
    }

    /// Installs the named module
    ///
    /// Every dependency must already be installed. If the store records a
    /// different installed version, [`Lifecycle::upgrade`] is invoked instead
    /// of [`Lifecycle::install`]. Installing an installed module is a no-op.
    ///
    /// [`Lifecycle::upgrade`]: super::Lifecycle::upgrade
    /// [`Lifecycle::install`]: super::Lifecycle::install
    pub async fn install(&self, name: &str) -> Result<(), Error> {
        let _phase = self.shared.phases.lock().await;
        let (module, status) = self.lookup(name)?;
        if status.is_installed() {
            trace!(plugin = %name, %status, "Already installed");
            return Ok(());
        }
        self.check_dependencies(&module, Status::Installed)?;

        let base = self.context(&module, self.module_token(name));
        let version = module.version().to_string();
        let persisted = self.shared.store.load(name);
        match persisted.as_ref() {
            Some(Record { version: from, .. }) if *from != version => {
                let ctx = UpgradeContext::new(base, from.clone(), version.clone());
                module
                    .lifecycle()
                    .upgrade(&ctx)
                    .await
                    .map_err(|source| Error::lifecycle(name, Phase::Upgrade, source))?;
                info!(plugin = %name, %from, to = %version, "Upgraded");
            }
            _ => {
                let ctx = InstallContext::new(base, false);
                module
                    .lifecycle()
                    .install(&ctx)
                    .await
                    .map_err(|source| Error::lifecycle(name, Phase::Install, source))?;
                info!(plugin = %name, %version, "Installed");
            }
        }

        // An operator's decision to disable a module survives restarts.
        let status = match persisted {
            Some(Record {
                status: Status::Disabled,
                ..
            }) => Status::Disabled,
            _ => Status::Installed,
        };
        self.transition(&module, status);
        Ok(())
    }

    /// Enables the named module
    ///
    /// Every dependency must already be enabled. Enabling an enabled module is
    /// a no-op.
    pub async fn enable(&self, name: &str) -> Result<(), Error> {
        let _phase = self.shared.phases.lock().await;
        let (module, status) = self.lookup(name)?;
        if status.is_enabled() {
            trace!(plugin = %name, %status, "Already enabled");
            return Ok(());
        }
        if !status.is_installed() {
            return Err(Error::InvalidTransition {
                name: name.to_string(),
                phase: Phase::Enable,
                status,
            });
        }
        self.check_dependencies(&module, Status::Enabled)?;

        let ctx = EnableContext::new(self.context(&module, self.module_token(name)));
        module
            .lifecycle()
            .enable(&ctx)
            .await
            .map_err(|source| Error::lifecycle(name, Phase::Enable, source))?;
        self.transition(&module, Status::Enabled);
        info!(plugin = %name, "Enabled");
        Ok(())
    }

    /// Starts the named module's background work
    ///
    /// The module must be enabled (or stopped) and its dependencies enabled.
    /// Starting a running module is a no-op.
    pub async fn start_module(&self, name: &str) -> Result<(), Error> {
        let _phase = self.shared.phases.lock().await;
        let (module, status) = self.lookup(name)?;
        match status {
            Status::Running => return Ok(()),
            Status::Enabled | Status::Stopped => {}
            status => {
                return Err(Error::InvalidTransition {
                    name: name.to_string(),
                    phase: Phase::Start,
                    status,
                })
            }
        }
        self.check_dependencies(&module, Status::Enabled)?;

        let token = self.shared.shutdown.child_token();
        let ctx = self.context(&module, token.clone());
        if let Err(source) = module.lifecycle().start(&ctx).await {
            token.cancel();
            return Err(Error::lifecycle(name, Phase::Start, source));
        }

        if let Some(prior) = self
            .shared
            .registry
            .write()
            .tokens
            .insert(name.to_string(), token)
        {
            prior.cancel();
        }
        self.transition(&module, Status::Running);
        info!(plugin = %name, "Started");
        Ok(())
    }

    /// Stops the named module's background work and cron entries
    ///
    /// Stopping a module that is not running is a no-op.
    pub async fn stop_module(&self, name: &str) -> Result<(), Error> {
        let _phase = self.shared.phases.lock().await;
        let (module, status) = self.lookup(name)?;
        match status {
            Status::Running => {}
            Status::Enabled | Status::Stopped => return Ok(()),
            status => {
                return Err(Error::InvalidTransition {
                    name: name.to_string(),
                    phase: Phase::Stop,
                    status,
                })
            }
        }

        self.halt(name);
        self.transition(&module, Status::Stopped);
        info!(plugin = %name, "Stopped");
        Ok(())
    }

    /// Disables the named module
    ///
    /// The module's background work is cancelled and its cron entries removed.
    /// Disabling a disabled module is a no-op.
    pub async fn disable(&self, name: &str) -> Result<(), Error> {
        let _phase = self.shared.phases.lock().await;
        let (module, status) = self.lookup(name)?;
        if status == Status::Disabled {
            return Ok(());
        }
        if !status.is_enabled() {
            return Err(Error::InvalidTransition {
                name: name.to_string(),
                phase: Phase::Disable,
                status,
            });
        }

        let ctx = self.context(&module, self.module_token(name));
        module
            .lifecycle()
            .disable(&ctx)
            .await
            .map_err(|source| Error::lifecycle(name, Phase::Disable, source))?;
        self.halt(name);
        self.transition(&module, Status::Disabled);
        info!(plugin = %name, "Disabled");
        Ok(())
    }

    /// Uninstalls the named module and removes it from the registry
    ///
    /// The module must have been installed. When `keep_data` is false the
    /// module is expected to delete the data it owns.
    pub async fn uninstall(&self, name: &str, keep_data: bool) -> Result<(), Error> {
        let _phase = self.shared.phases.lock().await;
        let (module, status) = self.lookup(name)?;
        if !status.is_installed() {
            return Err(Error::InvalidTransition {
                name: name.to_string(),
                phase: Phase::Uninstall,
                status,
            });
        }

        let ctx = InstallContext::new(self.context(&module, self.module_token(name)), keep_data);
        module
            .lifecycle()
            .uninstall(&ctx)
            .await
            .map_err(|source| Error::lifecycle(name, Phase::Uninstall, source))?;

        self.halt(name);
        {
            let mut reg = self.shared.registry.write();
            reg.modules.remove(name);
            reg.status.remove(name);
            reg.order.retain(|n| n != name);
            reg.mounted.retain(|(_, _, n)| n != name);
        }
        self.shared.store.remove(name);
        info!(plugin = %name, keep_data, "Uninstalled");
        Ok(())
    }

    // === Cron ===

    /// Schedules [`Lifecycle::start_cron`] for the named module
    ///
    /// At most one entry exists per `(name, spec)` pair; ensuring an existing
    /// pair is a no-op. An activation is skipped while the previous invocation
    /// for the same pair is still running.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// [`Lifecycle::start_cron`]: super::Lifecycle::start_cron
    pub fn ensure_cron(&self, name: &str, spec: &str) -> Result<(), Error> {
        let schedule = spec
            .parse::<Schedule>()
            .map_err(|error| Error::InvalidCronExpression {
                spec: spec.to_string(),
                reason: error.to_string(),
            })?;

        let mut reg = self.shared.registry.write();
        if !reg.modules.contains_key(name) {
            return Err(Error::NotRegistered(name.to_string()));
        }
        let key = (name.to_string(), spec.to_string());
        if reg.crons.contains_key(&key) {
            trace!(plugin = %name, %spec, "Cron already scheduled");
            return Ok(());
        }

        reg.next_entry += 1;
        let id = reg.next_entry;
        let running = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(schedule_cron(
            Arc::downgrade(&self.shared),
            key.clone(),
            schedule,
            running.clone(),
            self.shared.shutdown.clone(),
        ));
        reg.crons.insert(key, CronEntry { id, running, task });
        debug!(plugin = %name, %spec, entry = id, "Scheduled cron");
        Ok(())
    }

    /// Removes the `(name, spec)` scheduler entry
    ///
    /// An invocation that is already executing is not interrupted.
    pub fn remove_cron(&self, name: &str, spec: &str) -> Result<(), Error> {
        let removed = {
            let mut reg = self.shared.registry.write();
            if !reg.modules.contains_key(name) {
                return Err(Error::NotRegistered(name.to_string()));
            }
            reg.crons.remove(&(name.to_string(), spec.to_string()))
        };
        if let Some(entry) = removed {
            debug!(plugin = %name, %spec, entry = entry.id, "Removed cron");
        }
        Ok(())
    }

    /// Invokes [`Lifecycle::start_cron`] once, asynchronously, regardless of
    /// any schedule
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// [`Lifecycle::start_cron`]: super::Lifecycle::start_cron
    pub fn run_cron_once(&self, name: &str, spec: &str) -> Result<(), Error> {
        self.lookup(name)?;
        let manager = self.clone();
        let (name, spec) = (name.to_string(), spec.to_string());
        tokio::spawn(async move { manager.invoke_cron(&name, &spec).await });
        Ok(())
    }

    /// Schedules every cron spec the named module declares
    pub fn ensure_crons(&self, name: &str) -> Result<(), Error> {
        let (module, _) = self.lookup(name)?;
        module
            .crons()
            .iter()
            .map(|spec| self.ensure_cron(name, spec))
            .fold(Ok(()), |acc, res| acc.and(res))
    }

    /// Removes every scheduler entry of the named module
    pub fn remove_crons(&self, name: &str) -> Result<(), Error> {
        let mut reg = self.shared.registry.write();
        if !reg.modules.contains_key(name) {
            return Err(Error::NotRegistered(name.to_string()));
        }
        reg.crons.retain(|(plugin, _), _| plugin != name);
        Ok(())
    }

    /// Lists all scheduler entries
    pub fn cron_entries(&self) -> Vec<CronInfo> {
        let mut entries = self
            .shared
            .registry
            .read()
            .crons
            .iter()
            .map(|((plugin, spec), entry)| CronInfo {
                plugin: plugin.clone(),
                spec: spec.clone(),
                entry: entry.id,
                running: entry.is_running(),
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| (&a.plugin, &a.spec).cmp(&(&b.plugin, &b.spec)));
        entries
    }

    async fn invoke_cron(&self, name: &str, spec: &str) {
        let found = {
            let reg = self.shared.registry.read();
            reg.modules
                .get(name)
                .cloned()
                .map(|module| (module, reg.tokens.get(name).cloned()))
        };
        let Some((module, token)) = found else {
            debug!(plugin = %name, %spec, "Plugin is no longer registered");
            return;
        };

        let token = token.unwrap_or_else(|| self.shared.shutdown.child_token());
        let ctx = self.context(&module, token);
        trace!(plugin = %name, %spec, "Running cron");
        if let Err(source) = module.lifecycle().start_cron(&ctx, spec).await {
            let error = Error::lifecycle(name, Phase::StartCron, source);
            warn!(plugin = %name, %spec, %error, "Cron invocation failed");
        }
    }

    // === Routes ===

    /// Mounts the root routes of every enabled or running module
    pub fn register_routes(&self, group: &mut dyn RouteGroup) -> usize {
        self.mount_routes(RouteKind::Root, group)
    }

    /// Mounts the admin routes of every enabled or running module
    pub fn register_admin_routes(&self, group: &mut dyn RouteGroup) -> usize {
        self.mount_routes(RouteKind::Admin, group)
    }

    /// Mounts the cluster-scoped routes of every enabled or running module
    pub fn register_cluster_routes(&self, group: &mut dyn RouteGroup) -> usize {
        self.mount_routes(RouteKind::Cluster, group)
    }

    /// Mounts the management routes of every enabled or running module
    pub fn register_management_routes(&self, group: &mut dyn RouteGroup) -> usize {
        self.mount_routes(RouteKind::Management, group)
    }

    /// Mounts routes of the given kind, returning the number of modules
    /// mounted
    ///
    /// A module's routes are mounted on a given group at most once, so this
    /// may be called repeatedly (for instance, after enabling another module).
    pub fn mount_routes(&self, kind: RouteKind, group: &mut dyn RouteGroup) -> usize {
        let group_id = group.group_id().to_string();
        let pending: Vec<(String, RouteFn)> = {
            let mut guard = self.shared.registry.write();
            let reg = &mut *guard;
            let mut pending = Vec::new();
            for name in &reg.order {
                let serves = reg.status.get(name).is_some_and(|s| s.serves_routes());
                let Some(mount) = reg.modules.get(name).and_then(|m| m.routes(kind)) else {
                    continue;
                };
                if serves && reg.mounted.insert((kind, group_id.clone(), name.clone())) {
                    pending.push((name.clone(), mount.clone()));
                }
            }
            pending
        };

        for (name, mount) in &pending {
            mount(&mut *group);
            debug!(plugin = %name, ?kind, group = %group_id, "Mounted routes");
        }
        pending.len()
    }

    // === Internals ===

    fn lookup(&self, name: &str) -> Result<(Arc<Module>, Status), Error> {
        let reg = self.shared.registry.read();
        let module = reg
            .modules
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotRegistered(name.to_string()))?;
        let status = reg
            .status
            .get(name)
            .copied()
            .unwrap_or(Status::Discovered);
        Ok((module, status))
    }

    fn check_dependencies(&self, module: &Module, required: Status) -> Result<(), Error> {
        let reg = self.shared.registry.read();
        for dependency in module.dependencies() {
            let satisfied = reg
                .status
                .get(dependency)
                .is_some_and(|&status| status >= required);
            if !satisfied {
                return Err(Error::UnmetDependency {
                    name: module.name().to_string(),
                    dependency: dependency.clone(),
                    required,
                });
            }
        }
        Ok(())
    }

    fn startup_order(&self) -> Vec<String> {
        let modules = {
            let reg = self.shared.registry.read();
            reg.order
                .iter()
                .filter_map(|name| reg.modules.get(name).cloned())
                .collect::<Vec<_>>()
        };
        order::startup_order(&modules)
    }

    fn context(&self, module: &Module, token: CancellationToken) -> BaseContext {
        BaseContext::new(module.meta().clone(), &self.shared, token)
    }

    /// The running module's token, or a fresh token for a module that is not
    /// running.
    fn module_token(&self, name: &str) -> CancellationToken {
        self.shared
            .registry
            .read()
            .tokens
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.shared.shutdown.child_token())
    }

    /// Cancels the module's background work and removes its cron entries.
    fn halt(&self, name: &str) {
        let token = {
            let mut reg = self.shared.registry.write();
            reg.crons.retain(|(plugin, _), _| plugin != name);
            reg.tokens.remove(name)
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    fn transition(&self, module: &Module, status: Status) {
        let name = module.name();
        {
            let mut reg = self.shared.registry.write();
            match reg.status.get_mut(name) {
                Some(s) => *s = status,
                None => return,
            }
        }
        self.shared.store.save(
            name,
            Record {
                status,
                version: module.version().to_string(),
            },
        );
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reg = self.shared.registry.read();
        f.debug_struct("PluginManager")
            .field("status", &reg.status)
            .field("crons", &reg.crons.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Drives a single scheduler entry until it is removed or the process shuts
/// down.
async fn schedule_cron(
    shared: Weak<Shared>,
    (name, spec): CronKey,
    schedule: Schedule,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let Some(delay) = schedule.next_delay(Utc::now()) else {
            warn!(plugin = %name, %spec, "Cron schedule has no further activations");
            return;
        };
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = time::sleep(delay) => {}
        }

        let Some(shared) = shared.upgrade() else {
            return;
        };
        if running.swap(true, Ordering::AcqRel) {
            debug!(plugin = %name, %spec, "Previous invocation still running; skipping");
            continue;
        }

        let manager = PluginManager::from_shared(shared);
        let running = running.clone();
        let (name, spec) = (name.clone(), spec.clone());
        tokio::spawn(async move {
            manager.invoke_cron(&name, &spec).await;
            running.store(false, Ordering::Release);
        });
    }
}
