//! A process runtime for k8m replicas

use crate::{
    bus::EventBus,
    client::{self, Client, ClientArgs},
    coordinator::{ConnectionHandler, CoordinationArgs, KubeLeases, LeaseCoordinator},
    leader::{ElectionArgs, LeaderElector},
    leadership::Leadership,
    log::{LogArgs, LogFilter, LogFormat, LogInitError},
    plugin::{self, PluginManager, Registrar, StateStore},
    plugins,
    shutdown::{self, Completion},
};
use std::sync::Arc;
use tracing::{info, warn};

/// Configures a [`Runtime`]
#[derive(Default)]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
#[must_use]
pub struct Builder {
    client: Option<ClientArgs>,
    election: Option<ElectionArgs>,
    coordination: Option<CoordinationArgs>,
    log: Option<LogSettings>,
    store: Option<Arc<dyn StateStore>>,
    registrar: Option<Registrar>,
    handler: Option<Arc<dyn ConnectionHandler>>,
}

/// Provides infrastructure for running a k8m replica:
///
/// * logging
/// * a default Kubernetes client, when one can be configured
/// * signal handling and graceful shutdown
/// * a [`PluginManager`] with the built-in leader-election and cluster-sync
///   modules registered ahead of the application's modules
///
/// Without a Kubernetes client the replica runs standalone: it leads
/// unconditionally and does not propagate cluster connections.
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
#[must_use]
pub struct Runtime {
    client: Option<Client>,
    identity: String,
    manager: PluginManager,
    coordinator: Option<LeaseCoordinator>,
    shutdown: shutdown::Shutdown,
    handle: shutdown::Handle,
}

/// Indicates that the [`Builder`] could not configure a [`Runtime`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub enum BuildError {
    /// Indicates that logging could not be initialized
    #[error(transparent)]
    LogInit(#[from] LogInitError),

    /// Indicates that a signal handler could not be registered
    #[error(transparent)]
    Signal(#[from] shutdown::RegisterError),
}

/// Indicates that the [`Runtime`] did not run to a graceful shutdown
#[derive(Debug, thiserror::Error)]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub enum RunError {
    /// Modules could not be registered
    #[error("failed to start modules: {0}")]
    Start(#[from] plugin::Error),

    /// A second signal was received before shutdown completed
    #[error("shutdown aborted")]
    Aborted,
}

#[derive(Debug)]
struct LogSettings {
    filter: LogFilter,
    format: LogFormat,
}

// === impl Builder ===

impl Builder {
    /// Configures the runtime to use the given [`ClientArgs`]
    pub fn with_client(mut self, client: ClientArgs) -> Self {
        self.client = Some(client);
        self
    }

    /// Configures the runtime to use the given logging configuration
    pub fn with_log(mut self, filter: LogFilter, format: LogFormat) -> Self {
        self.log = Some(LogSettings { filter, format });
        self
    }

    /// Configures leader election
    pub fn with_election(mut self, election: ElectionArgs) -> Self {
        self.election = Some(election);
        self
    }

    /// Configures cluster-connection propagation
    pub fn with_coordination(mut self, coordination: CoordinationArgs) -> Self {
        self.coordination = Some(coordination);
        self
    }

    /// Persists module state in the given store instead of in memory
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers the application's modules after the built-in modules
    pub fn with_registrar<F>(mut self, registrar: F) -> Self
    where
        F: FnOnce(&PluginManager) -> Result<(), plugin::Error> + Send + 'static,
    {
        self.registrar = Some(Box::new(registrar));
        self
    }

    /// Reacts to clusters connected or disconnected by other replicas. By
    /// default these are only logged.
    pub fn with_connection_handler(mut self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Attempts to build a runtime by initializing logs, registering signal
    /// handlers and loading the default Kubernetes client
    ///
    /// A client that cannot be configured is not an error: the runtime falls
    /// back to standalone operation.
    pub async fn build(self) -> Result<Runtime, BuildError> {
        self.log.unwrap_or_default().try_init()?;
        let (shutdown, handle) = shutdown::channel()?;

        let client = match self.client.unwrap_or_default().try_client().await {
            Ok(client) => Some(client),
            Err(error) => {
                warn!(%error, "No Kubernetes client; running standalone");
                None
            }
        };

        let election = self
            .election
            .unwrap_or_default()
            .into_params(|| client::detect_namespace(client.as_ref()));
        let identity = election.identity.clone();
        let elector = LeaderElector::new(client.clone(), election);

        let coordinator = client.as_ref().map(|client| {
            let args = self.coordination.unwrap_or_default();
            let namespace = args
                .namespace
                .clone()
                .unwrap_or_else(|| client::detect_namespace(Some(client)));
            info!(%namespace, "Propagating cluster connections");
            LeaseCoordinator::new(
                Arc::new(KubeLeases::new(client.clone(), &namespace)),
                identity.clone(),
                args.params(),
                handle.token().clone(),
            )
        });

        let builtins = {
            let coordinator = coordinator.clone();
            let handler = self
                .handler
                .unwrap_or_else(|| Arc::new(plugins::cluster_sync::LogConnections::default()));
            let registrar = self.registrar;
            move |manager: &PluginManager| {
                manager.register(plugins::leader::module(elector))?;
                if let Some(coordinator) = coordinator {
                    manager.register(plugins::cluster_sync::module(coordinator, handler))?;
                }
                match registrar {
                    Some(registrar) => registrar(manager),
                    None => Ok(()),
                }
            }
        };

        let mut manager = PluginManager::builder()
            .with_bus(EventBus::new())
            .with_leadership(Leadership::default())
            .with_shutdown(handle.token().clone())
            .with_task_tracker(handle.tasks().clone())
            .with_registrar(builtins);
        if let Some(store) = self.store {
            manager = manager.with_store(store);
        }

        Ok(Runtime {
            client,
            identity,
            manager: manager.build(),
            coordinator,
            shutdown,
            handle,
        })
    }
}

// === impl Runtime ===

impl Runtime {
    /// Creates a runtime builder
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Obtains the runtime's Kubernetes client, if one was configured
    #[inline]
    pub fn client(&self) -> Option<Client> {
        self.client.clone()
    }

    /// This replica's identity
    #[inline]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The runtime's plugin manager
    #[inline]
    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    /// Announces this replica's cluster connections to other replicas. Absent
    /// when running standalone.
    #[inline]
    pub fn coordinator(&self) -> Option<&LeaseCoordinator> {
        self.coordinator.as_ref()
    }

    /// Obtains a handle that can be used to instrument graceful shutdown
    #[inline]
    pub fn shutdown_handle(&self) -> shutdown::Handle {
        self.handle.clone()
    }

    /// Starts every module and runs until the runtime is shutdown
    ///
    /// Shutdown starts when a SIGINT or SIGTERM signal is received (or the
    /// shutdown handle is triggered) and completes when all tracked tasks have
    /// terminated or when a subsequent signal is received.
    pub async fn run(self) -> Result<(), RunError> {
        let Self {
            manager,
            shutdown,
            identity,
            ..
        } = self;

        manager.start().await?;
        info!(%identity, modules = manager.describe().len(), "Started");

        match shutdown.on_signal().await {
            Completion::Terminated => Ok(()),
            Completion::Aborted => Err(RunError::Aborted),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("identity", &self.identity)
            .field("standalone", &self.client.is_none())
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

// === impl LogSettings ===

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: LogFilter::try_from_env("K8M_LOG")
                .unwrap_or_else(|_| LogFilter::new(LogArgs::DEFAULT_FILTER)),
            format: LogFormat::default(),
        }
    }
}

impl LogSettings {
    fn try_init(self) -> Result<(), LogInitError> {
        self.format.try_init(self.filter)
    }
}
