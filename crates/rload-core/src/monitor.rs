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

use parking_lot::RwLock;
use rload_command::{CommandEvent, DispatcherHandle};
use rload_common::RemoteConfig;
use rload_engine::{EngineEvent, EngineEventKind, RunStatus};
use rload_logging::{log_run_event, LogContext, RunEventOutcome};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::names;

/// Follows the merged remote event stream and keeps an aggregate
/// [`RunStatus`]. Dispatches `remote_exit_all` when every started host has
/// ended and `remote.exit_on_finish` is set.
pub struct RunMonitor {
    status: watch::Receiver<RunStatus>,
    task: JoinHandle<()>,
}

impl RunMonitor {
    pub fn spawn(
        events: broadcast::Receiver<EngineEvent>,
        dispatcher: DispatcherHandle,
        config: Arc<RwLock<RemoteConfig>>,
    ) -> Self {
        let (status_tx, status) = watch::channel(RunStatus::default());
        let task = tokio::spawn(follow(events, status_tx, dispatcher, config));
        Self { status, task }
    }

    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }
}

impl Drop for RunMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn follow(
    mut events: broadcast::Receiver<EngineEvent>,
    status: watch::Sender<RunStatus>,
    dispatcher: DispatcherHandle,
    config: Arc<RwLock<RemoteConfig>>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "run monitor fell behind the remote event stream");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let context = LogContext::new().with_host(&event.host);
        match &event.kind {
            EngineEventKind::TestStarted => log_run_event(
                Some(&context),
                "remote.test.started",
                "test started",
                RunEventOutcome::Success,
            ),
            EngineEventKind::TestEnded => log_run_event(
                Some(&context),
                "remote.test.ended",
                "test ended",
                RunEventOutcome::Success,
            ),
            EngineEventKind::ThreadGroupStarted { group, threads } => {
                debug!(host = %event.host, group = %group, threads, "remote thread group started")
            }
            EngineEventKind::ThreadGroupFinished { group } => {
                debug!(host = %event.host, group = %group, "remote thread group finished")
            }
        }

        let mut finished = false;
        status.send_modify(|current| {
            let before = current.all_ended();
            current.apply(&event);
            finished = !before && current.all_ended();
        });
        if !finished {
            continue;
        }
        info!(hosts = ?status.borrow().started_hosts(), "all remote engines finished");
        if config.read().exit_on_finish {
            if let Err(err) = dispatcher.try_dispatch(CommandEvent::new(names::REMOTE_EXIT_ALL)) {
                warn!(error = %err, "could not request remote exit after run");
            }
        }
    }
    debug!("run monitor stopped");
}
