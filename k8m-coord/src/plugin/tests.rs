use super::*;
use parking_lot::Mutex;
use std::{
    any::Any,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time;
use tokio_util::sync::CancellationToken;

type Log = Arc<Mutex<Vec<String>>>;

/// A lifecycle that records every hook invocation
#[derive(Clone, Default)]
struct Hooks {
    name: String,
    log: Log,
    fail_on: Option<Phase>,
    cron_hold: Option<Duration>,
    cron_runs: Arc<AtomicUsize>,
    token: Arc<Mutex<Option<CancellationToken>>>,
    schedule_on_enable: bool,
}

impl Hooks {
    fn new(name: &str, log: &Log) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            ..Default::default()
        }
    }

    fn failing(mut self, phase: Phase) -> Self {
        self.fail_on = Some(phase);
        self
    }

    fn record(&self, entry: impl std::fmt::Display) {
        self.log.lock().push(format!("{}:{entry}", self.name));
    }

    fn check(&self, phase: Phase) -> Result<(), BoxError> {
        self.record(phase);
        if self.fail_on == Some(phase) {
            return Err(format!("{phase} exploded").into());
        }
        Ok(())
    }

    fn module(&self) -> Module {
        Module::new(self.name.clone(), self.clone())
    }
}

#[async_trait::async_trait]
impl Lifecycle for Hooks {
    async fn install(&self, _: &InstallContext) -> Result<(), BoxError> {
        self.check(Phase::Install)
    }

    async fn upgrade(&self, ctx: &UpgradeContext) -> Result<(), BoxError> {
        self.record(format_args!(
            "upgrade {}->{}",
            ctx.from_version(),
            ctx.to_version()
        ));
        if self.fail_on == Some(Phase::Upgrade) {
            return Err("upgrade exploded".into());
        }
        Ok(())
    }

    async fn enable(&self, ctx: &EnableContext) -> Result<(), BoxError> {
        self.check(Phase::Enable)?;
        if self.schedule_on_enable {
            ctx.base().scheduler().ensure_all()?;
        }
        Ok(())
    }

    async fn disable(&self, _: &BaseContext) -> Result<(), BoxError> {
        self.check(Phase::Disable)
    }

    async fn uninstall(&self, ctx: &InstallContext) -> Result<(), BoxError> {
        self.record(format_args!("uninstall keep_data={}", ctx.keep_data()));
        Ok(())
    }

    async fn start(&self, ctx: &BaseContext) -> Result<(), BoxError> {
        self.check(Phase::Start)?;
        *self.token.lock() = Some(ctx.shutdown().clone());
        Ok(())
    }

    async fn start_cron(&self, _: &BaseContext, spec: &str) -> Result<(), BoxError> {
        self.cron_runs.fetch_add(1, Ordering::SeqCst);
        if let Some(hold) = self.cron_hold {
            time::sleep(hold).await;
        }
        self.record(format_args!("cron {spec}"));
        Ok(())
    }
}

struct TestGroup {
    id: &'static str,
    mounted: Vec<&'static str>,
}

impl RouteGroup for TestGroup {
    fn group_id(&self) -> &str {
        self.id
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn mount_as(name: &'static str) -> impl Fn(&mut dyn RouteGroup) + Send + Sync + 'static {
    move |group: &mut dyn RouteGroup| {
        group
            .as_any_mut()
            .downcast_mut::<TestGroup>()
            .expect("test group")
            .mounted
            .push(name)
    }
}

fn log() -> Log {
    Log::default()
}

#[tokio::test]
async fn registration_requires_unique_names() {
    let log = log();
    let manager = PluginManager::builder().build();

    manager
        .register(Hooks::new("leader", &log).module())
        .expect("first registration");
    assert!(matches!(
        manager.register(Hooks::new("leader", &log).module()),
        Err(Error::DuplicateName(name)) if name == "leader"
    ));
    assert!(matches!(
        manager.register(Hooks::new("", &log).module()),
        Err(Error::DuplicateName(name)) if name.is_empty()
    ));
    assert_eq!(manager.status_of("leader"), Some(Status::Discovered));
    assert!(!manager.is_enabled("leader"));
}

#[tokio::test]
async fn status_progression() {
    let log = log();
    let hooks = Hooks::new("inspection", &log);
    let manager = PluginManager::builder().build();
    manager.register(hooks.module()).unwrap();

    manager.install("inspection").await.unwrap();
    assert_eq!(manager.status_of("inspection"), Some(Status::Installed));
    manager.enable("inspection").await.unwrap();
    assert!(manager.is_enabled("inspection"));
    manager.start_module("inspection").await.unwrap();
    assert_eq!(manager.status_of("inspection"), Some(Status::Running));

    let token = hooks.token.lock().clone().expect("start must see a token");
    assert!(!token.is_cancelled());
    manager.stop_module("inspection").await.unwrap();
    assert_eq!(manager.status_of("inspection"), Some(Status::Stopped));
    assert!(token.is_cancelled());
    assert!(manager.is_enabled("inspection"));

    manager.start_module("inspection").await.unwrap();
    manager.disable("inspection").await.unwrap();
    assert_eq!(manager.status_of("inspection"), Some(Status::Disabled));
    assert!(hooks.token.lock().as_ref().unwrap().is_cancelled());

    // Repeated transitions are no-ops.
    manager.disable("inspection").await.unwrap();
    manager.install("inspection").await.unwrap();
    manager.enable("inspection").await.unwrap();
    manager.enable("inspection").await.unwrap();

    assert_eq!(
        *log.lock(),
        [
            "inspection:install",
            "inspection:enable",
            "inspection:start",
            "inspection:start",
            "inspection:disable",
            "inspection:enable",
        ]
    );
}

#[tokio::test]
async fn invalid_transitions() {
    let log = log();
    let manager = PluginManager::builder().build();
    manager.register(Hooks::new("helm", &log).module()).unwrap();

    assert!(matches!(
        manager.enable("helm").await,
        Err(Error::InvalidTransition {
            phase: Phase::Enable,
            status: Status::Discovered,
            ..
        })
    ));
    assert!(matches!(
        manager.start_module("helm").await,
        Err(Error::InvalidTransition {
            phase: Phase::Start,
            ..
        })
    ));
    assert!(matches!(
        manager.uninstall("helm", true).await,
        Err(Error::InvalidTransition {
            phase: Phase::Uninstall,
            ..
        })
    ));
    assert!(matches!(
        manager.install("missing").await,
        Err(Error::NotRegistered(name)) if name == "missing"
    ));
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn dependencies_gate_transitions() {
    let log = log();
    let manager = PluginManager::builder().build();
    manager
        .register(Hooks::new("cluster-sync", &log).module().depends_on("leader"))
        .unwrap();
    manager.register(Hooks::new("leader", &log).module()).unwrap();

    assert!(matches!(
        manager.install("cluster-sync").await,
        Err(Error::UnmetDependency { dependency, required: Status::Installed, .. })
            if dependency == "leader"
    ));

    manager.install("leader").await.unwrap();
    manager.install("cluster-sync").await.unwrap();
    assert!(matches!(
        manager.enable("cluster-sync").await,
        Err(Error::UnmetDependency { required: Status::Enabled, .. })
    ));
    assert_eq!(manager.status_of("cluster-sync"), Some(Status::Installed));

    manager.enable("leader").await.unwrap();
    manager.enable("cluster-sync").await.unwrap();
    assert!(manager.is_enabled("cluster-sync"));
}

#[tokio::test]
async fn failed_hook_leaves_status_unchanged() {
    let log = log();
    let manager = PluginManager::builder().build();
    manager
        .register(Hooks::new("heartbeat", &log).failing(Phase::Enable).module())
        .unwrap();

    manager.install("heartbeat").await.unwrap();
    let error = manager.enable("heartbeat").await.unwrap_err();
    assert!(matches!(
        error,
        Error::Lifecycle { phase: Phase::Enable, ref name, .. } if name == "heartbeat"
    ));
    assert!(std::error::Error::source(&error).is_some());
    assert_eq!(manager.status_of("heartbeat"), Some(Status::Installed));
}

#[tokio::test]
async fn start_is_ordered_best_effort_and_idempotent() {
    let log = log();
    let registrar_log = log.clone();
    let manager = PluginManager::builder()
        .with_registrar(move |manager| {
            manager.register(
                Hooks::new("inspection", &registrar_log)
                    .module()
                    .depends_on("leader"),
            )?;
            manager.register(
                Hooks::new("broken", &registrar_log)
                    .failing(Phase::Install)
                    .module(),
            )?;
            manager.register(Hooks::new("leader", &registrar_log).module())?;
            Ok(())
        })
        .build();

    manager.start().await.unwrap();
    assert_eq!(manager.status_of("leader"), Some(Status::Running));
    assert_eq!(manager.status_of("inspection"), Some(Status::Running));
    assert_eq!(manager.status_of("broken"), Some(Status::Discovered));

    let calls = log.lock().clone();
    let position = |entry: &str| calls.iter().position(|c| c == entry).expect(entry);
    assert!(position("leader:install") < position("inspection:install"));
    assert!(position("leader:enable") < position("inspection:enable"));
    assert!(position("leader:start") < position("inspection:start"));
    assert!(!calls.iter().any(|c| c.starts_with("broken:enable")));

    manager.start().await.unwrap();
    assert_eq!(*log.lock(), calls);
}

#[tokio::test]
async fn persisted_disabled_modules_stay_disabled() {
    let log = log();
    let store = Arc::new(MemoryStore::with_records([(
        "helm".to_string(),
        Record {
            status: Status::Disabled,
            version: "0.0.0".to_string(),
        },
    )]));
    let manager = PluginManager::builder().with_store(store.clone()).build();
    manager.register(Hooks::new("helm", &log).module()).unwrap();
    manager.register(Hooks::new("leader", &log).module()).unwrap();

    manager.start().await.unwrap();
    assert_eq!(manager.status_of("helm"), Some(Status::Disabled));
    assert_eq!(manager.status_of("leader"), Some(Status::Running));
    assert!(!log.lock().iter().any(|c| c == "helm:enable"));

    manager.enable("helm").await.unwrap();
    assert_eq!(
        store.load("helm").map(|r| r.status),
        Some(Status::Enabled)
    );
}

#[tokio::test]
async fn version_change_upgrades() {
    let log = log();
    let store = Arc::new(MemoryStore::with_records([(
        "gateway".to_string(),
        Record {
            status: Status::Running,
            version: "1.0.0".to_string(),
        },
    )]));
    let manager = PluginManager::builder().with_store(store.clone()).build();
    manager
        .register(Hooks::new("gateway", &log).module().with_version("1.1.0"))
        .unwrap();

    manager.install("gateway").await.unwrap();
    assert_eq!(*log.lock(), ["gateway:upgrade 1.0.0->1.1.0"]);
    assert_eq!(
        store.load("gateway"),
        Some(Record {
            status: Status::Installed,
            version: "1.1.0".to_string(),
        })
    );
}

#[tokio::test]
async fn uninstall_forgets_the_module() {
    let log = log();
    let store = Arc::new(MemoryStore::new());
    let manager = PluginManager::builder().with_store(store.clone()).build();
    manager.register(Hooks::new("helm", &log).module()).unwrap();
    manager.install("helm").await.unwrap();
    assert!(store.load("helm").is_some());

    manager.uninstall("helm", false).await.unwrap();
    assert_eq!(manager.status_of("helm"), None);
    assert!(store.load("helm").is_none());
    assert!(manager.describe().is_empty());
    assert_eq!(log.lock().last().map(String::as_str), Some("helm:uninstall keep_data=false"));

    manager
        .register(Hooks::new("helm", &log).module())
        .expect("name is free again");
}

#[tokio::test]
async fn describe_reports_registration_order() {
    let log = log();
    let manager = PluginManager::builder().build();
    manager
        .register(
            Hooks::new("leader", &log)
                .module()
                .with_title("Leader election")
                .with_version("1.0.0"),
        )
        .unwrap();
    manager
        .register(
            Hooks::new("cluster-sync", &log)
                .module()
                .depends_on("leader")
                .with_cron("@every 30s"),
        )
        .unwrap();
    manager.install("leader").await.unwrap();

    let summaries = manager.describe();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].name, "leader");
    assert_eq!(summaries[0].title, "Leader election");
    assert_eq!(summaries[0].status, Status::Installed);
    assert_eq!(summaries[1].dependencies, ["leader"]);
    assert_eq!(summaries[1].crons, ["@every 30s"]);
    assert_eq!(summaries[1].status, Status::Discovered);
}

#[tokio::test]
async fn cron_entries_are_unique() {
    let log = log();
    let manager = PluginManager::builder().build();
    manager.register(Hooks::new("inspection", &log).module()).unwrap();

    manager.ensure_cron("inspection", "*/5 * * * *").unwrap();
    manager.ensure_cron("inspection", "*/5 * * * *").unwrap();
    manager.ensure_cron("inspection", "@every 1h").unwrap();
    let entries = manager.cron_entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].spec, "*/5 * * * *");
    assert_eq!(entries[1].spec, "@every 1h");
    assert!(entries.iter().all(|e| e.plugin == "inspection" && !e.running));
    assert_ne!(entries[0].entry, entries[1].entry);

    assert!(matches!(
        manager.ensure_cron("inspection", "every five minutes"),
        Err(Error::InvalidCronExpression { .. })
    ));
    assert!(matches!(
        manager.ensure_cron("missing", "@every 1h"),
        Err(Error::NotRegistered(_))
    ));

    manager.remove_cron("inspection", "@every 1h").unwrap();
    manager.remove_cron("inspection", "@every 1h").unwrap();
    assert_eq!(manager.cron_entries().len(), 1);
    manager.remove_crons("inspection").unwrap();
    assert!(manager.cron_entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cron_fires_on_schedule() {
    let log = log();
    let hooks = Hooks::new("heartbeat", &log);
    let manager = PluginManager::builder().build();
    manager.register(hooks.module()).unwrap();
    manager.ensure_cron("heartbeat", "@every 1m").unwrap();

    time::sleep(Duration::from_secs(59)).await;
    assert_eq!(hooks.cron_runs.load(Ordering::SeqCst), 0);
    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(hooks.cron_runs.load(Ordering::SeqCst), 1);
    time::sleep(Duration::from_secs(60)).await;
    assert_eq!(hooks.cron_runs.load(Ordering::SeqCst), 2);
    assert_eq!(log.lock()[0], "heartbeat:cron @every 1m");
}

#[tokio::test(start_paused = true)]
async fn cron_skips_while_previous_run_is_executing() {
    let log = log();
    let hooks = Hooks {
        cron_hold: Some(Duration::from_secs(90)),
        ..Hooks::new("inspection", &log)
    };
    let manager = PluginManager::builder().build();
    manager.register(hooks.module()).unwrap();
    manager.ensure_cron("inspection", "@every 1m").unwrap();

    // The first run starts at 60s and holds until 150s, so the 120s
    // activation is skipped.
    time::sleep(Duration::from_secs(130)).await;
    assert_eq!(hooks.cron_runs.load(Ordering::SeqCst), 1);
    assert!(manager.cron_entries()[0].running);

    time::sleep(Duration::from_secs(40)).await;
    assert_eq!(hooks.cron_runs.load(Ordering::SeqCst), 1);
    assert!(!manager.cron_entries()[0].running);

    time::sleep(Duration::from_secs(20)).await;
    assert_eq!(hooks.cron_runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn removed_cron_stops_firing() {
    let log = log();
    let hooks = Hooks::new("heartbeat", &log);
    let manager = PluginManager::builder().build();
    manager.register(hooks.module()).unwrap();

    manager.ensure_cron("heartbeat", "@every 1m").unwrap();
    manager.remove_cron("heartbeat", "@every 1m").unwrap();
    time::sleep(Duration::from_secs(180)).await;
    assert_eq!(hooks.cron_runs.load(Ordering::SeqCst), 0);

    manager.run_cron_once("heartbeat", "@every 1m").unwrap();
    time::sleep(Duration::from_millis(1)).await;
    assert_eq!(hooks.cron_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hooks_schedule_declared_crons() {
    let log = log();
    let hooks = Hooks {
        schedule_on_enable: true,
        ..Hooks::new("inspection", &log)
    };
    let manager = PluginManager::builder().build();
    manager
        .register(hooks.module().with_cron("@every 5m").with_cron("0 * * * *"))
        .unwrap();

    manager.install("inspection").await.unwrap();
    manager.enable("inspection").await.unwrap();
    assert_eq!(manager.cron_entries().len(), 2);

    manager.disable("inspection").await.unwrap();
    assert!(manager.cron_entries().is_empty());
}

#[tokio::test]
async fn routes_mount_once_per_group() {
    let log = log();
    let manager = PluginManager::builder().build();
    manager
        .register(
            Hooks::new("inspection", &log)
                .module()
                .with_routes(RouteKind::Admin, mount_as("inspection"))
                .with_routes(RouteKind::Cluster, mount_as("inspection-cluster")),
        )
        .unwrap();
    manager
        .register(
            Hooks::new("helm", &log)
                .module()
                .with_routes(RouteKind::Admin, mount_as("helm")),
        )
        .unwrap();
    manager.install("inspection").await.unwrap();

    let mut admin = TestGroup {
        id: "/admin",
        mounted: vec![],
    };
    // Installed modules do not serve routes.
    assert_eq!(manager.register_admin_routes(&mut admin), 0);

    manager.enable("inspection").await.unwrap();
    assert_eq!(manager.register_admin_routes(&mut admin), 1);
    assert_eq!(manager.register_admin_routes(&mut admin), 0);
    assert_eq!(admin.mounted, ["inspection"]);

    let mut other = TestGroup {
        id: "/admin/v2",
        mounted: vec![],
    };
    assert_eq!(manager.register_admin_routes(&mut other), 1);

    let mut cluster = TestGroup {
        id: "/k8s/cluster/:cluster",
        mounted: vec![],
    };
    assert_eq!(manager.register_cluster_routes(&mut cluster), 1);
    assert_eq!(cluster.mounted, ["inspection-cluster"]);
    assert_eq!(manager.register_management_routes(&mut cluster), 0);
    assert_eq!(manager.register_routes(&mut cluster), 0);
}
