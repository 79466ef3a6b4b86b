//! ---
//! rload_section: "07-application"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Application wiring, run command handlers and run monitoring."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
//! Background worker owning the [`RemoteCoordinator`].
//!
//! Remote operations are network bound, so handlers only enqueue them here
//! and return. The worker applies requests strictly in arrival order and
//! reports each outcome once through the user reporter.

use std::collections::BTreeSet;
use std::sync::Arc;

use rload_command::{CommandError, UserReporter};
use rload_engine::{
    BroadcastReport, HostFailure, HostOutcome, RemoteCoordinator, RemoteError, RemoteOp, StopMode,
};
use rload_logging::{log_run_event, LogContext, RunEventOutcome};
use rload_tree::ConfigNode;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Which hosts a remote request addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Host(String),
    /// Every host in the configured list.
    All,
}

enum RemoteRequest {
    Start {
        target: Target,
        tree: Arc<ConfigNode>,
        exclude_timers: bool,
        run_id: Uuid,
    },
    Stop {
        target: Target,
        mode: StopMode,
    },
    Exit {
        target: Target,
    },
    Started(oneshot::Sender<Vec<String>>),
}

/// Cloneable sender side of the remote worker.
#[derive(Clone)]
pub struct RemoteClient {
    tx: mpsc::UnboundedSender<RemoteRequest>,
}

impl RemoteClient {
    /// Move `coordinator` into a worker task. The task ends once every
    /// client clone is dropped.
    pub fn spawn(
        coordinator: RemoteCoordinator,
        reporter: Arc<dyn UserReporter>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = RemoteWorker {
            coordinator,
            reporter,
            started: BTreeSet::new(),
        };
        let task = tokio::spawn(worker.run(rx));
        (Self { tx }, task)
    }

    pub fn start(
        &self,
        target: Target,
        tree: Arc<ConfigNode>,
        exclude_timers: bool,
        run_id: Uuid,
    ) -> Result<(), CommandError> {
        self.send(RemoteRequest::Start {
            target,
            tree,
            exclude_timers,
            run_id,
        })
    }

    pub fn stop(&self, target: Target, mode: StopMode) -> Result<(), CommandError> {
        self.send(RemoteRequest::Stop { target, mode })
    }

    pub fn exit(&self, target: Target) -> Result<(), CommandError> {
        self.send(RemoteRequest::Exit { target })
    }

    /// Wait for every request queued so far and return the hosts whose
    /// latest start succeeded.
    pub async fn started_hosts(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RemoteRequest::Started(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    fn send(&self, request: RemoteRequest) -> Result<(), CommandError> {
        self.tx
            .send(request)
            .map_err(|_| CommandError::Handler(anyhow::anyhow!("remote worker has stopped")))
    }
}

struct RemoteWorker {
    coordinator: RemoteCoordinator,
    reporter: Arc<dyn UserReporter>,
    started: BTreeSet<String>,
}

impl RemoteWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RemoteRequest>) {
        debug!("remote worker started");
        while let Some(request) = rx.recv().await {
            match request {
                RemoteRequest::Start {
                    target,
                    tree,
                    exclude_timers,
                    run_id,
                } => self.start(target, &tree, exclude_timers, run_id).await,
                RemoteRequest::Stop { target, mode } => self.stop(target, mode).await,
                RemoteRequest::Exit { target } => self.exit(target).await,
                RemoteRequest::Started(reply) => {
                    let _ = reply.send(self.started.iter().cloned().collect());
                }
            }
        }
        debug!("remote worker stopped");
    }

    async fn start(&mut self, target: Target, tree: &ConfigNode, exclude_timers: bool, run_id: Uuid) {
        let run = run_id.to_string();
        let context = LogContext::new().with_run(&run);
        match target {
            Target::All => {
                let (init, start) = self.coordinator.launch_all(tree, exclude_timers).await;
                self.report(&init);
                self.report(&start);
                self.started = start.succeeded.iter().cloned().collect();
                let outcome = if start.succeeded.is_empty() {
                    RunEventOutcome::Fault
                } else {
                    RunEventOutcome::Success
                };
                log_run_event(
                    Some(&context),
                    "remote.run.started",
                    &format!("{} of {} host(s) started", start.succeeded.len(), init.attempted()),
                    outcome,
                );
                if !start.succeeded.is_empty() {
                    self.reporter.info(&format!(
                        "Remote test started on {} host(s): {}",
                        start.succeeded.len(),
                        start.succeeded.join(", ")
                    ));
                }
            }
            Target::Host(host) => {
                let init = self.coordinator.init(&host, tree, exclude_timers).await;
                let result = match init {
                    Ok(()) => self.coordinator.start(&host).await,
                    Err(err) => {
                        self.report(&single(RemoteOp::Init, &host, Err(err)));
                        return;
                    }
                };
                let report = single(RemoteOp::Start, &host, result);
                self.report(&report);
                if report.succeeded.contains(&host) {
                    log_run_event(
                        Some(&context.clone().with_host(&host)),
                        "remote.run.started",
                        "host started",
                        RunEventOutcome::Success,
                    );
                    self.reporter.info(&format!("Remote test started on {host}"));
                    self.started.insert(host);
                }
            }
        }
    }

    async fn stop(&mut self, target: Target, mode: StopMode) {
        let report = match target {
            Target::All => self.coordinator.stop_all(mode).await,
            Target::Host(host) => {
                let op = match mode {
                    StopMode::Immediate => RemoteOp::Stop,
                    StopMode::Graceful => RemoteOp::Shutdown,
                };
                let result = self.coordinator.stop(&host, mode).await;
                single(op, &host, result)
            }
        };
        self.report(&report);
    }

    async fn exit(&mut self, target: Target) {
        let report = match target {
            Target::All => self.coordinator.exit_all().await,
            Target::Host(host) => {
                let result = self.coordinator.exit(&host).await;
                single(RemoteOp::Exit, &host, result)
            }
        };
        for host in report.succeeded.iter().chain(report.skipped.iter()) {
            self.started.remove(host);
        }
        if !report.succeeded.is_empty() {
            info!(hosts = ?report.succeeded, "remote engines exited");
        }
        self.report(&report);
    }

    fn report(&self, report: &BroadcastReport) {
        if let Some(message) = report.failure_message() {
            self.reporter.error(&message);
        }
    }
}

fn single(op: RemoteOp, host: &str, result: Result<HostOutcome, RemoteError>) -> BroadcastReport {
    let mut report = BroadcastReport::new(op);
    match result {
        Ok(HostOutcome::Done) => report.succeeded.push(host.to_owned()),
        Ok(HostOutcome::NotFound) => {
            debug!(host, %op, "ignored; host was never initialised");
            report.skipped.push(host.to_owned());
        }
        Err(err) => report.failures.push(HostFailure {
            host: host.to_owned(),
            error: err.to_string(),
        }),
    }
    report
}
