//! ---
//! rload_section: "07-application"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Application wiring, run command handlers and run monitoring."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rload_command::{
    CommandEvent, CommandRegistry, DispatchError, DispatchReport, Dispatcher, DispatcherHandle,
    HandlerTable, RegistryError, TracingReporter, UserReporter,
};
use rload_common::{AppConfig, RemoteConfig};
use rload_engine::{
    EngineEventKind, EngineFactory, LocalRunController, RemoteConnector, RemoteCoordinator,
    StandardEngineFactory,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{AppContext, StaticTreeProvider, TreeProvider};
use crate::monitor::RunMonitor;
use crate::remote::RemoteClient;
use crate::table::handler_table;

/// Builder wiring configuration, collaborators and handlers into an
/// [`Application`].
pub struct ApplicationBuilder {
    config: AppConfig,
    connector: Arc<dyn RemoteConnector>,
    tree: Arc<dyn TreeProvider>,
    reporter: Arc<dyn UserReporter>,
    engine_factory: Option<Arc<dyn EngineFactory>>,
    remote_config: Option<Arc<RwLock<RemoteConfig>>>,
    table: Option<HandlerTable>,
    extra: HandlerTable,
}

impl ApplicationBuilder {
    pub fn new(config: AppConfig, connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            config,
            connector,
            tree: Arc::new(StaticTreeProvider::empty()),
            reporter: Arc::new(TracingReporter),
            engine_factory: None,
            remote_config: None,
            table: None,
            extra: HandlerTable::new(),
        }
    }

    pub fn with_tree_provider(mut self, tree: Arc<dyn TreeProvider>) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn UserReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_engine_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.engine_factory = Some(factory);
        self
    }

    /// Share live remote settings with other holders, such as the connector.
    /// They take the place of `config.remote`.
    pub fn with_remote_config(mut self, remote: Arc<RwLock<RemoteConfig>>) -> Self {
        self.remote_config = Some(remote);
        self
    }

    /// Replace the compiled-in handler table entirely.
    pub fn with_handler_table(mut self, table: HandlerTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Add handler types next to the compiled-in ones.
    pub fn with_extra_handlers(mut self, table: HandlerTable) -> Self {
        self.extra.extend(table);
        self
    }

    /// Discover handlers and start the background tasks. Must be called
    /// inside a tokio runtime.
    ///
    /// Fails only when discovery yields no handler at all.
    pub fn build(self) -> Result<Application, RegistryError> {
        let config = self.config;
        let remote_config = self
            .remote_config
            .unwrap_or_else(|| Arc::new(RwLock::new(config.remote.clone())));
        let coordinator = RemoteCoordinator::new(
            self.connector,
            remote_config.clone(),
            config.engine.event_capacity,
        );
        let remote_events = coordinator.subscribe();
        let (remote, remote_task) = RemoteClient::spawn(coordinator, self.reporter.clone());

        let factory = self
            .engine_factory
            .unwrap_or_else(|| Arc::new(StandardEngineFactory::new(config.engine.clone())));
        let ctx = Arc::new(AppContext::new(
            self.tree,
            LocalRunController::new(factory),
            remote,
        ));

        let mut table = self.table.unwrap_or_else(|| handler_table(&ctx));
        table.extend(self.extra);
        let registry = CommandRegistry::build(table)?;
        info!(commands = ?registry.command_names()?, "command registry ready");

        let dispatcher = Dispatcher::new(registry.clone(), self.reporter, &config.dispatcher)
            .spawn(&config.dispatcher);
        let monitor = RunMonitor::spawn(remote_events, dispatcher.clone(), remote_config.clone());

        Ok(Application {
            ctx,
            registry,
            dispatcher,
            monitor,
            remote_config,
            remote_task,
        })
    }
}

/// A wired rload process: registry, dispatcher, workers and shared state.
pub struct Application {
    ctx: Arc<AppContext>,
    registry: Arc<CommandRegistry>,
    dispatcher: DispatcherHandle,
    monitor: RunMonitor,
    remote_config: Arc<RwLock<RemoteConfig>>,
    remote_task: JoinHandle<()>,
}

impl Application {
    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    pub fn monitor(&self) -> &RunMonitor {
        &self.monitor
    }

    /// Live remote settings; host list edits apply to the next broadcast.
    pub fn remote_config(&self) -> &Arc<RwLock<RemoteConfig>> {
        &self.remote_config
    }

    pub async fn dispatch(&self, event: CommandEvent) -> Result<(), DispatchError> {
        self.dispatcher.dispatch(event).await
    }

    pub async fn dispatch_now(&self, event: CommandEvent) -> Result<DispatchReport, DispatchError> {
        self.dispatcher.dispatch_now(event).await
    }

    /// Resolve once the local engine has no run in progress.
    pub async fn wait_for_local_run(&self) {
        let mut events = {
            let local = self.ctx.local().lock().await;
            let Some(events) = local.subscribe() else {
                return;
            };
            if !local.is_running().await {
                return;
            }
            events
        };
        loop {
            match events.recv().await {
                Ok(event) if event.kind == EngineEventKind::TestEnded => return,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if !self.ctx.local().lock().await.is_running().await {
                        return;
                    }
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    /// Resolve once every host whose last start succeeded reported its end.
    ///
    /// Hosts are taken after all queued remote work has been applied. Meant
    /// for processes driving a single run, such as the command line.
    pub async fn wait_for_remote_run(&self) {
        let hosts = self.ctx.remote().started_hosts().await;
        if hosts.is_empty() {
            debug!("no remote host is running");
            return;
        }
        let mut status = self.monitor.subscribe();
        let _ = status
            .wait_for(|status| hosts.iter().all(|host| status.has_ended(host)))
            .await;
    }

    /// Resolve once the `exit` command has completed.
    pub async fn exited(&self) {
        let mut exit = self.ctx.exit_signal();
        let _ = exit.wait_for(|requested| *requested).await;
    }

    /// Stop the dispatcher, then let the remote worker drain its queue.
    pub async fn shutdown(self) {
        let Application {
            ctx,
            registry,
            dispatcher,
            monitor,
            remote_config: _,
            remote_task,
        } = self;
        dispatcher.shutdown().await;
        drop(monitor);
        drop(registry);
        drop(ctx);
        match tokio::time::timeout(Duration::from_secs(5), remote_task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "remote worker ended abnormally"),
            Err(_) => warn!("remote worker still busy at shutdown"),
        }
        info!("application stopped");
    }
}
