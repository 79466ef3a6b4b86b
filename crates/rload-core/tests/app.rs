//! ---
//! rload_section: "07-application"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Application wiring, run command handlers and run monitoring."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rload_command::{
    CollectingReporter, CommandError, CommandEvent, CommandHandler, DispatchOutcome,
    DispatchScope, HandlerKind, HandlerTable, RegistryError,
};
use rload_common::{AppConfig, EngineConfig, RemoteConfig};
use rload_core::{names, Application, ApplicationBuilder, StaticTreeProvider};
use rload_engine::{
    Engine, EngineError, EngineFactory, EngineState, RemoteConnector, StandardEngine, LOCAL_HOST,
};
use rload_tree::{Category, ConfigNode, Element};

#[derive(Default)]
struct InProcessConnector {
    unreachable: HashSet<String>,
    engines: Mutex<HashMap<String, StandardEngine>>,
}

impl InProcessConnector {
    fn engine(&self, host: &str) -> Option<StandardEngine> {
        self.engines.lock().get(host).cloned()
    }
}

#[async_trait]
impl RemoteConnector for InProcessConnector {
    async fn connect(&self, host: &str) -> Result<Arc<dyn Engine>, EngineError> {
        if self.unreachable.contains(host) {
            return Err(EngineError::Transport(format!("connection refused by {host}")));
        }
        let engine = StandardEngine::new("agent", EngineConfig::default());
        self.engines.lock().insert(host.to_owned(), engine.clone());
        Ok(Arc::new(engine))
    }
}

#[derive(Default)]
struct RecordingFactory {
    created: Mutex<Vec<StandardEngine>>,
}

impl EngineFactory for RecordingFactory {
    fn create(&self) -> Result<Arc<dyn Engine>, EngineError> {
        let engine = StandardEngine::new(LOCAL_HOST, EngineConfig::default());
        self.created.lock().push(engine.clone());
        Ok(Arc::new(engine))
    }
}

fn thread_group(loops: i64) -> ConfigNode {
    ConfigNode::new("users", Category::ThreadGroup).with_element(
        Element::new("thread_group")
            .with("num_threads", 2i64)
            .with("loops", loops),
    )
}

fn timer(name: &str, delay_ms: i64) -> ConfigNode {
    ConfigNode::new(name, Category::Timer)
        .with_element(Element::new("constant_timer").with("delay_ms", delay_ms))
}

fn finite_plan() -> ConfigNode {
    ConfigNode::new("plan", Category::TestPlan)
        .with_child(thread_group(2).with_child(ConfigNode::new("home", Category::Sampler)))
}

fn endless_plan() -> ConfigNode {
    ConfigNode::new("plan", Category::TestPlan).with_child(
        thread_group(-1)
            .with_child(ConfigNode::new("home", Category::Sampler))
            .with_child(timer("think", 5)),
    )
}

fn config(hosts: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.remote.hosts = Some(hosts.to_owned());
    config.remote.timeout = Duration::from_millis(500);
    config.remote.retry_delay = Duration::from_millis(5);
    config.remote.connect_attempts = 1;
    config
}

struct Fixture {
    app: Application,
    reporter: Arc<CollectingReporter>,
    connector: Arc<InProcessConnector>,
    factory: Arc<RecordingFactory>,
}

fn fixture(config: AppConfig, plan: ConfigNode, connector: InProcessConnector) -> Fixture {
    let reporter = Arc::new(CollectingReporter::new());
    let connector = Arc::new(connector);
    let factory = Arc::new(RecordingFactory::default());
    let app = ApplicationBuilder::new(config, connector.clone())
        .with_tree_provider(Arc::new(StaticTreeProvider::new(plan)))
        .with_reporter(reporter.clone())
        .with_engine_factory(factory.clone())
        .build()
        .expect("handlers discovered");
    Fixture {
        app,
        reporter,
        connector,
        factory,
    }
}

async fn bounded<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("finished in time")
}

#[tokio::test]
async fn empty_handler_table_is_fatal() {
    let result = ApplicationBuilder::new(AppConfig::default(), Arc::new(InProcessConnector::default()))
        .with_handler_table(HandlerTable::new())
        .build();
    assert!(matches!(result, Err(RegistryError::NoHandlers)));
}

#[tokio::test]
async fn every_command_name_has_a_handler() {
    let fx = fixture(config("a"), finite_plan(), InProcessConnector::default());
    let registered = fx.app.registry().command_names().expect("registry ready");
    for name in names::ALL {
        assert!(registered.iter().any(|known| known == name), "{name} unhandled");
    }
    fx.app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_start_is_refused_while_running() {
    let fx = fixture(config("a"), endless_plan(), InProcessConnector::default());

    let first = fx.app.dispatch_now(CommandEvent::new(names::START)).await.expect("dispatched");
    assert!(first.is_success());

    let second = fx.app.dispatch_now(CommandEvent::new(names::START)).await.expect("dispatched");
    assert!(!second.is_success());
    assert!(second.failures()[0].user_action);
    assert_eq!(fx.reporter.errors(), vec!["a run is already in progress".to_owned()]);
    assert_eq!(fx.factory.created.lock().len(), 1);

    let stop = fx.app.dispatch_now(CommandEvent::new(names::STOP)).await.expect("dispatched");
    assert!(stop.is_success());
    bounded(fx.app.wait_for_local_run()).await;
    assert_eq!(
        fx.factory.created.lock()[0].current_state(),
        EngineState::Configured
    );
    fx.app.shutdown().await;
}

#[tokio::test]
async fn stop_without_run_only_informs() {
    let fx = fixture(config("a"), finite_plan(), InProcessConnector::default());
    let report = fx.app.dispatch_now(CommandEvent::new(names::SHUTDOWN)).await.expect("dispatched");
    assert!(report.is_success());
    assert_eq!(fx.reporter.infos(), vec!["no test is running".to_owned()]);
    assert!(fx.reporter.errors().is_empty());
    fx.app.shutdown().await;
}

#[tokio::test]
async fn start_without_timers_configures_the_remaining_nodes() {
    let plan = ConfigNode::new("plan", Category::TestPlan)
        .with_child(
            thread_group(1)
                .with_child(ConfigNode::new("login", Category::Sampler))
                .with_child(
                    timer("pacing", 50)
                        .with_child(ConfigNode::new("jitter", Category::Config))
                        .with_child(ConfigNode::new("limits", Category::Config)),
                )
                .with_child(ConfigNode::new("logout", Category::Sampler)),
        )
        .with_child(ConfigNode::new("results", Category::Listener));
    assert_eq!(plan.node_count(), 8);
    let fx = fixture(config("a"), plan, InProcessConnector::default());

    let report = fx
        .app
        .dispatch_now(CommandEvent::new(names::START_NO_TIMERS))
        .await
        .expect("dispatched");
    assert!(report.is_success());
    let engine = fx.factory.created.lock()[0].clone();
    assert_eq!(engine.configured_nodes(), Some(5));
    bounded(fx.app.wait_for_local_run()).await;
    fx.app.shutdown().await;
}

#[tokio::test]
async fn invalid_plan_is_reported_as_user_action() {
    let plan = ConfigNode::new("plan", Category::TestPlan);
    let fx = fixture(config("a"), plan, InProcessConnector::default());
    let report = fx.app.dispatch_now(CommandEvent::new(names::START)).await.expect("dispatched");
    assert!(report.failures()[0].user_action);
    let errors = fx.reporter.errors();
    assert!(errors[0].starts_with("The test plan could not be started\n"));
    assert!(errors[0].contains("no thread group"));
    fx.app.shutdown().await;
}

#[tokio::test]
async fn unknown_command_is_reported_not_raised() {
    let fx = fixture(config("a"), finite_plan(), InProcessConnector::default());
    let report = fx.app.dispatch_now(CommandEvent::new("undo")).await.expect("dispatched");
    assert_eq!(report.outcome, DispatchOutcome::NotFound);
    assert_eq!(
        fx.reporter.errors(),
        vec!["Sorry, this feature (undo) not yet implemented".to_owned()]
    );
    fx.app.shutdown().await;
}

#[tokio::test]
async fn per_host_commands_need_a_host_and_ignore_unknown_ones() {
    let fx = fixture(config("a"), finite_plan(), InProcessConnector::default());

    let report = fx.app.dispatch_now(CommandEvent::new(names::REMOTE_START)).await.expect("dispatched");
    assert!(!report.is_success());
    assert_eq!(fx.reporter.errors(), vec!["remote_start needs a target host".to_owned()]);
    fx.reporter.clear();

    let report = fx
        .app
        .dispatch_now(CommandEvent::for_host(names::REMOTE_STOP, "ghost"))
        .await
        .expect("dispatched");
    assert!(report.is_success());
    assert!(fx.app.context().remote().started_hosts().await.is_empty());
    assert!(fx.reporter.errors().is_empty());
    assert!(fx.connector.engine("ghost").is_none());
    fx.app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_start_reports_failures_once_and_runs_the_rest() {
    let connector = InProcessConnector {
        unreachable: ["a".to_string()].into_iter().collect(),
        ..InProcessConnector::default()
    };
    let fx = fixture(config("a,b"), finite_plan(), connector);

    let report = fx
        .app
        .dispatch_now(CommandEvent::new(names::REMOTE_START_ALL))
        .await
        .expect("dispatched");
    assert!(report.is_success());
    bounded(fx.app.wait_for_remote_run()).await;

    let errors = fx.reporter.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Remote init failed on 1 of 2 host(s):\na: "));
    assert!(fx
        .reporter
        .infos()
        .contains(&"Remote test started on 1 host(s): b".to_owned()));
    assert!(fx.app.monitor().status().has_ended("b"));

    fx.app.dispatch_now(CommandEvent::new(names::EXIT)).await.expect("dispatched");
    bounded(fx.app.exited()).await;
    let engine = fx.connector.engine("b").expect("b connected");
    assert_eq!(engine.current_state(), EngineState::Terminated);
    fx.app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_engines_exit_once_every_host_finished() {
    let mut config = config("a,b");
    config.remote.exit_on_finish = true;
    let fx = fixture(config, finite_plan(), InProcessConnector::default());

    fx.app
        .dispatch_now(CommandEvent::new(names::REMOTE_START_ALL))
        .await
        .expect("dispatched");
    bounded(fx.app.wait_for_remote_run()).await;

    bounded(async {
        loop {
            let exited = ["a", "b"].iter().all(|host| {
                fx.connector
                    .engine(host)
                    .is_some_and(|engine| engine.current_state() == EngineState::Terminated)
            });
            if exited {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(fx.app.context().remote().started_hosts().await.is_empty());
    fx.app.shutdown().await;
}

/// Records the port it reads from shared settings on every connect.
struct SettingsConnector {
    config: Arc<RwLock<RemoteConfig>>,
    ports: Mutex<Vec<u16>>,
}

#[async_trait]
impl RemoteConnector for SettingsConnector {
    async fn connect(&self, _host: &str) -> Result<Arc<dyn Engine>, EngineError> {
        self.ports.lock().push(self.config.read().port);
        Ok(Arc::new(StandardEngine::new("agent", EngineConfig::default())))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connector_sees_live_remote_setting_edits() {
    let config = config("a");
    let shared = Arc::new(RwLock::new(config.remote.clone()));
    let connector = Arc::new(SettingsConnector {
        config: shared.clone(),
        ports: Mutex::new(Vec::new()),
    });
    let app = ApplicationBuilder::new(config, connector.clone())
        .with_remote_config(shared.clone())
        .with_tree_provider(Arc::new(StaticTreeProvider::new(finite_plan())))
        .with_reporter(Arc::new(CollectingReporter::new()))
        .build()
        .expect("handlers discovered");
    assert!(Arc::ptr_eq(app.remote_config(), &shared));

    app.remote_config().write().port = 2000;
    app.dispatch_now(CommandEvent::new(names::REMOTE_START_ALL))
        .await
        .expect("dispatched");
    assert_eq!(app.context().remote().started_hosts().await, vec!["a".to_owned()]);
    assert_eq!(*connector.ports.lock(), vec![2000]);

    bounded(app.wait_for_remote_run()).await;
    app.shutdown().await;
}

struct Panicking {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandHandler for Panicking {
    fn kind(&self) -> HandlerKind {
        HandlerKind("audit")
    }

    fn command_names(&self) -> Vec<String> {
        vec![names::STOP.to_owned()]
    }

    async fn execute(&self, _event: &CommandEvent, _scope: &DispatchScope<'_>) -> Result<(), CommandError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("audit trail unavailable");
    }
}

#[tokio::test]
async fn extra_handler_panic_does_not_block_run_handlers() {
    let calls = Arc::new(AtomicUsize::new(0));
    let reporter = Arc::new(CollectingReporter::new());
    let app = ApplicationBuilder::new(config("a"), Arc::new(InProcessConnector::default()))
        .with_tree_provider(Arc::new(StaticTreeProvider::new(finite_plan())))
        .with_reporter(reporter.clone())
        .with_extra_handlers(HandlerTable::new().with_handler(Arc::new(Panicking {
            calls: calls.clone(),
        })))
        .build()
        .expect("handlers discovered");

    let report = app.dispatch_now(CommandEvent::new(names::STOP)).await.expect("dispatched");
    assert_eq!(report.invoked().len(), 2);
    assert_eq!(report.failures().len(), 1);
    assert!(report.failures()[0].panicked);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(reporter.infos().contains(&"no test is running".to_owned()));

    let again = app.dispatch_now(CommandEvent::new(names::START)).await.expect("worker alive");
    assert!(again.is_success());
    bounded(app.wait_for_local_run()).await;
    app.shutdown().await;
}
