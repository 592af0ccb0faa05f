use super::Lifecycle;
use std::{any::Any, collections::HashMap, fmt, sync::Arc};

/// Describes a pluggable feature module
///
/// A module is immutable once it has been registered with a
/// [`PluginManager`](super::PluginManager).
#[derive(Clone)]
pub struct Module {
    meta: Meta,
    title: String,
    description: String,
    dependencies: Vec<String>,
    run_after: Vec<String>,
    crons: Vec<String>,
    lifecycle: Arc<dyn Lifecycle>,
    routes: HashMap<RouteKind, RouteFn>,
}

/// Identifies a module and its version
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub struct Meta {
    /// The module's unique name.
    pub name: String,

    /// The module's version.
    pub version: String,
}

/// The router groups a module may attach routes to
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteKind {
    /// Public, unauthenticated routes.
    Root,

    /// Routes scoped to a single managed cluster.
    Cluster,

    /// Routes for authenticated users that span clusters.
    Management,

    /// Routes for platform administrators.
    Admin,
}

/// A router group that module routes are mounted on
///
/// The HTTP framework is not part of this crate. Route callbacks receive the
/// group as a trait object and downcast it to the framework's router type.
pub trait RouteGroup: Send {
    /// Identifies this group. Mounting is deduplicated per group identity, so
    /// two handles to the same underlying router must return the same value.
    fn group_id(&self) -> &str;

    /// Exposes the concrete router for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Mounts a module's routes on a [`RouteGroup`]
pub type RouteFn = Arc<dyn Fn(&mut dyn RouteGroup) + Send + Sync>;

// === impl Module ===

impl Module {
    /// Describes a module with the given name and behavior
    pub fn new(name: impl Into<String>, lifecycle: impl Lifecycle) -> Self {
        Self::from_arc(name, Arc::new(lifecycle))
    }

    /// Describes a module with a shared lifecycle implementation
    pub fn from_arc(name: impl Into<String>, lifecycle: Arc<dyn Lifecycle>) -> Self {
        Self {
            meta: Meta {
                name: name.into(),
                version: "0.0.0".to_string(),
            },
            title: String::new(),
            description: String::new(),
            dependencies: Vec::new(),
            run_after: Vec::new(),
            crons: Vec::new(),
            lifecycle,
            routes: HashMap::new(),
        }
    }

    /// Sets the human-readable title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the module version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.meta.version = version.into();
        self
    }

    /// Sets the human-readable description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Requires the named module to be enabled before this one
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Hints that this module should be started after the named module
    ///
    /// Unlike [`Module::depends_on`], this is not enforced.
    pub fn run_after(mut self, name: impl Into<String>) -> Self {
        self.run_after.push(name.into());
        self
    }

    /// Declares a cron schedule for [`Lifecycle::start_cron`]
    pub fn with_cron(mut self, spec: impl Into<String>) -> Self {
        self.crons.push(spec.into());
        self
    }

    /// Registers a route-mounting callback for a router group
    pub fn with_routes<F>(mut self, kind: RouteKind, mount: F) -> Self
    where
        F: Fn(&mut dyn RouteGroup) + Send + Sync + 'static,
    {
        self.routes.insert(kind, Arc::new(mount));
        self
    }

    /// The module's unique name
    #[inline]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// The module's name and version
    #[inline]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// The module's version
    #[inline]
    pub fn version(&self) -> &str {
        &self.meta.version
    }

    /// The module's title
    #[inline]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// The module's description
    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Modules that must be enabled before this one
    #[inline]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Modules that should be started before this one, if present
    #[inline]
    pub fn run_after_hints(&self) -> &[String] {
        &self.run_after
    }

    /// The module's declared cron schedules
    #[inline]
    pub fn crons(&self) -> &[String] {
        &self.crons
    }

    #[inline]
    pub(crate) fn lifecycle(&self) -> &Arc<dyn Lifecycle> {
        &self.lifecycle
    }

    #[inline]
    pub(crate) fn routes(&self, kind: RouteKind) -> Option<&RouteFn> {
        self.routes.get(&kind)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.meta.name)
            .field("version", &self.meta.version)
            .field("dependencies", &self.dependencies)
            .field("run_after", &self.run_after)
            .field("crons", &self.crons)
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
