//! ---
//! rload_section: "05-run-lifecycle"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Engines, local run controller and remote engine coordinator."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
//! Remote engine coordination.
//!
//! The coordinator keeps one [`EngineHandle`] per host, created on first
//! `init` and reset on later ones. Broadcast operations walk the configured
//! host list in order; a failing host never prevents the next one from being
//! attempted, and all failures come back together in a [`BroadcastReport`].

mod hosts;
mod report;
mod status;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rload_common::RemoteConfig;
use rload_logging::{log_run_event, LogContext, RunEventOutcome};
use rload_tree::{Category, ClonedTree, ConfigNode, Element, TreeCloner, TreeError};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError, EngineEvent, EngineEventKind, EngineHandle, StopMode};

pub use hosts::HostList;
pub use report::{BroadcastReport, HostFailure, RemoteOp};
pub use status::RunStatus;

/// Element kind of the listener node injected into every remote clone.
pub const REMOTE_LISTENER_KIND: &str = "remote_threads_listener";

/// Turns a host string into a connected engine.
#[async_trait]
pub trait RemoteConnector: Send + Sync + 'static {
    async fn connect(&self, host: &str) -> Result<Arc<dyn Engine>, EngineError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("unreachable after {attempts} attempt(s): {message}")]
    Unreachable {
        host: String,
        attempts: u32,
        message: String,
    },
    #[error("{op} timed out after {after:?}")]
    Timeout {
        host: String,
        op: RemoteOp,
        after: Duration,
    },
    #[error("{op} rejected: {source}")]
    Engine {
        host: String,
        op: RemoteOp,
        #[source]
        source: EngineError,
    },
    #[error("test plan cannot be prepared: {source}")]
    Tree {
        host: String,
        #[source]
        source: TreeError,
    },
}

impl RemoteError {
    pub fn host(&self) -> &str {
        match self {
            RemoteError::Unreachable { host, .. }
            | RemoteError::Timeout { host, .. }
            | RemoteError::Engine { host, .. }
            | RemoteError::Tree { host, .. } => host,
        }
    }
}

/// Result of a per-host operation that may find nothing to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOutcome {
    Done,
    /// No handle exists for the host.
    NotFound,
}

struct RemoteHandle {
    handle: EngineHandle,
    forwarder: JoinHandle<()>,
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Owns the `host -> engine` map and every fan-out operation over it.
pub struct RemoteCoordinator {
    connector: Arc<dyn RemoteConnector>,
    config: Arc<RwLock<RemoteConfig>>,
    handles: IndexMap<String, RemoteHandle>,
    events: broadcast::Sender<EngineEvent>,
    status: Arc<Mutex<RunStatus>>,
}

impl RemoteCoordinator {
    /// `config` is read again on every operation, so host list edits apply
    /// to the next broadcast.
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        config: Arc<RwLock<RemoteConfig>>,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            connector,
            config,
            handles: IndexMap::new(),
            events,
            status: Arc::new(Mutex::new(RunStatus::default())),
        }
    }

    pub fn hosts(&self) -> HostList {
        let config = self.config.read();
        HostList::parse(config.hosts.as_deref(), &config.default_host)
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn handle(&self, host: &str) -> Option<&EngineHandle> {
        self.handles.get(host).map(|remote| &remote.handle)
    }

    pub fn known_hosts(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    /// Merged event stream of every host handle.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> RunStatus {
        self.status.lock().clone()
    }

    pub fn exit_on_finish(&self) -> bool {
        self.config.read().exit_on_finish
    }

    fn settings(&self) -> RemoteConfig {
        self.config.read().clone()
    }

    /// Clone `source` for `host`, adding the listener that tags its events.
    pub fn prepare_tree(
        &self,
        host: &str,
        source: &ConfigNode,
        exclude_timers: bool,
    ) -> Result<ClonedTree, RemoteError> {
        let cloner = if exclude_timers {
            TreeCloner::without_timers()
        } else {
            TreeCloner::new()
        };
        let mut tree = cloner
            .clone_tree(source)
            .map_err(|source| RemoteError::Tree {
                host: host.to_owned(),
                source,
            })?;
        tree.attach_to_root(
            ConfigNode::new("remote threads listener", Category::Listener)
                .with_element(Element::new(REMOTE_LISTENER_KIND).with("host", host)),
        );
        Ok(tree)
    }

    /// Create or reset the handle for `host` and push a fresh clone into it.
    ///
    /// A new handle is recorded only once it is connected and configured.
    pub async fn init(
        &mut self,
        host: &str,
        source: &ConfigNode,
        exclude_timers: bool,
    ) -> Result<(), RemoteError> {
        let settings = self.settings();
        let tree = self.prepare_tree(host, source, exclude_timers)?;

        if let Some(existing) = self.handles.get(host) {
            let engine = existing.handle.engine().clone();
            bounded(&settings, host, RemoteOp::Init, engine.reset()).await?;
            bounded(&settings, host, RemoteOp::Init, engine.configure(tree)).await?;
            info!(host, "remote engine reset and configured");
            return Ok(());
        }

        let engine = self.connect_with_retry(host, &settings).await?;
        let events = engine.subscribe();
        bounded(&settings, host, RemoteOp::Init, engine.configure(tree)).await?;
        let forwarder = spawn_forwarder(
            host.to_owned(),
            events,
            self.events.clone(),
            self.status.clone(),
        );
        self.handles.insert(
            host.to_owned(),
            RemoteHandle {
                handle: EngineHandle::new(host, engine),
                forwarder,
            },
        );
        info!(host, handles = self.handles.len(), "remote engine connected and configured");
        Ok(())
    }

    async fn connect_with_retry(
        &self,
        host: &str,
        settings: &RemoteConfig,
    ) -> Result<Arc<dyn Engine>, RemoteError> {
        let attempts = settings.connect_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(settings.timeout, self.connector.connect(host)).await {
                Ok(Ok(engine)) => return Ok(engine),
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => last_error = format!("connect timed out after {:?}", settings.timeout),
            }
            warn!(host, attempt, attempts, error = %last_error, "remote engine connection failed");
            if attempt < attempts {
                tokio::time::sleep(settings.retry_delay * attempt).await;
            }
        }
        Err(RemoteError::Unreachable {
            host: host.to_owned(),
            attempts,
            message: last_error,
        })
    }

    /// Run the configured test on `host`.
    pub async fn start(&mut self, host: &str) -> Result<HostOutcome, RemoteError> {
        let Some(engine) = self.engine(host) else {
            debug!(host, "start ignored; host was never initialised");
            return Ok(HostOutcome::NotFound);
        };
        let settings = self.settings();
        bounded(&settings, host, RemoteOp::Start, engine.run()).await?;
        Ok(HostOutcome::Done)
    }

    pub async fn stop(&mut self, host: &str, mode: StopMode) -> Result<HostOutcome, RemoteError> {
        let op = match mode {
            StopMode::Immediate => RemoteOp::Stop,
            StopMode::Graceful => RemoteOp::Shutdown,
        };
        let Some(engine) = self.engine(host) else {
            debug!(host, %op, "ignored; host was never initialised");
            return Ok(HostOutcome::NotFound);
        };
        let settings = self.settings();
        bounded(&settings, host, op, engine.stop(mode)).await?;
        Ok(HostOutcome::Done)
    }

    /// Graceful stop: in-flight samples finish, no new ones begin.
    pub async fn shutdown(&mut self, host: &str) -> Result<HostOutcome, RemoteError> {
        self.stop(host, StopMode::Graceful).await
    }

    /// Terminate the engine on `host` and drop its handle.
    ///
    /// A host that started but never reported its end is marked ended once
    /// the handle is gone, whether or not the exit itself succeeded.
    pub async fn exit(&mut self, host: &str) -> Result<HostOutcome, RemoteError> {
        let Some(remote) = self.handles.shift_remove(host) else {
            debug!(host, "exit ignored; host was never initialised");
            return Ok(HostOutcome::NotFound);
        };
        let engine = remote.handle.engine().clone();
        let settings = self.settings();
        let result = bounded(&settings, host, RemoteOp::Exit, engine.exit()).await;
        drop(remote);
        self.close_run(host);
        result?;
        info!(host, handles = self.handles.len(), "remote engine exited");
        Ok(HostOutcome::Done)
    }

    fn close_run(&self, host: &str) {
        let event = {
            let mut status = self.status.lock();
            if !status.is_running(host) {
                return;
            }
            let event = EngineEvent::now(host, EngineEventKind::TestEnded);
            status.apply(&event);
            event
        };
        debug!(host, "run closed for exited host");
        let _ = self.events.send(event);
    }

    fn engine(&self, host: &str) -> Option<Arc<dyn Engine>> {
        self.handles
            .get(host)
            .map(|remote| remote.handle.engine().clone())
    }

    pub async fn init_all(&mut self, source: &ConfigNode, exclude_timers: bool) -> BroadcastReport {
        let hosts = self.hosts();
        let mut report = BroadcastReport::new(RemoteOp::Init);
        for host in hosts.iter() {
            let result = self.init(host, source, exclude_timers).await.map(|()| HostOutcome::Done);
            record(&mut report, host, result);
        }
        finish_broadcast(&report);
        report
    }

    pub async fn start_all(&mut self) -> BroadcastReport {
        let hosts = self.hosts();
        let mut report = BroadcastReport::new(RemoteOp::Start);
        for host in hosts.iter() {
            let result = self.start(host).await;
            record(&mut report, host, result);
        }
        finish_broadcast(&report);
        report
    }

    pub async fn stop_all(&mut self, mode: StopMode) -> BroadcastReport {
        let op = match mode {
            StopMode::Immediate => RemoteOp::Stop,
            StopMode::Graceful => RemoteOp::Shutdown,
        };
        let hosts = self.hosts();
        let mut report = BroadcastReport::new(op);
        for host in hosts.iter() {
            let result = self.stop(host, mode).await;
            record(&mut report, host, result);
        }
        finish_broadcast(&report);
        report
    }

    pub async fn shutdown_all(&mut self) -> BroadcastReport {
        self.stop_all(StopMode::Graceful).await
    }

    pub async fn exit_all(&mut self) -> BroadcastReport {
        let hosts = self.hosts();
        let mut report = BroadcastReport::new(RemoteOp::Exit);
        for host in hosts.iter() {
            let result = self.exit(host).await;
            record(&mut report, host, result);
        }
        finish_broadcast(&report);
        report
    }

    /// Configure every host, then start every host.
    ///
    /// No host is started before all of them were given their configuration.
    pub async fn launch_all(
        &mut self,
        source: &ConfigNode,
        exclude_timers: bool,
    ) -> (BroadcastReport, BroadcastReport) {
        self.status.lock().clear();
        let init = self.init_all(source, exclude_timers).await;
        let start = self.start_all().await;
        (init, start)
    }
}

async fn bounded<T, F>(
    settings: &RemoteConfig,
    host: &str,
    op: RemoteOp,
    operation: F,
) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(settings.timeout, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(RemoteError::Engine {
            host: host.to_owned(),
            op,
            source,
        }),
        Err(_) => Err(RemoteError::Timeout {
            host: host.to_owned(),
            op,
            after: settings.timeout,
        }),
    }
}

fn record(report: &mut BroadcastReport, host: &str, result: Result<HostOutcome, RemoteError>) {
    let context = LogContext::new().with_host(host);
    let event = format!("remote.{}", report.op);
    match result {
        Ok(HostOutcome::Done) => {
            log_run_event(Some(&context), &event, "host completed", RunEventOutcome::Success);
            report.succeeded.push(host.to_owned());
        }
        Ok(HostOutcome::NotFound) => {
            log_run_event(Some(&context), &event, "no handle for host", RunEventOutcome::Skipped);
            report.skipped.push(host.to_owned());
        }
        Err(err) => {
            let error = err.to_string();
            log_run_event(Some(&context), &event, &error, RunEventOutcome::Fault);
            report.failures.push(HostFailure {
                host: host.to_owned(),
                error,
            });
        }
    }
}

fn finish_broadcast(report: &BroadcastReport) {
    if report.is_clean() {
        info!(
            op = %report.op,
            succeeded = report.succeeded.len(),
            skipped = report.skipped.len(),
            "remote broadcast completed"
        );
    } else {
        warn!(
            op = %report.op,
            failed = ?report.failed_hosts(),
            succeeded = report.succeeded.len(),
            "remote broadcast completed with failures"
        );
    }
}

fn spawn_forwarder(
    host: String,
    mut source: broadcast::Receiver<EngineEvent>,
    sink: broadcast::Sender<EngineEvent>,
    status: Arc<Mutex<RunStatus>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(event) => {
                    status.lock().apply(&event);
                    let _ = sink.send(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(host = %host, skipped, "remote event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(host = %host, "remote event forwarder finished");
    })
}
