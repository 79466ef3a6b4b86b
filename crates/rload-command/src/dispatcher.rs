//! ---
//! rload_section: "04-command-dispatch"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Command registry, serialized dispatcher and user reporting."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use rload_common::DispatcherConfig;
use rload_logging::{log_run_event, LogContext, RunEventOutcome};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CommandError, DispatchError};
use crate::event::CommandEvent;
use crate::handler::HandlerKind;
use crate::registry::CommandRegistry;
use crate::reporter::UserReporter;

/// One handler that did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub kind: HandlerKind,
    /// Text that was shown to the user.
    pub message: String,
    pub user_action: bool,
    pub panicked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No handler is registered for the command.
    NotFound,
    Completed {
        invoked: Vec<HandlerKind>,
        failures: Vec<HandlerFailure>,
    },
}

/// Result of executing one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub command: String,
    pub outcome: DispatchOutcome,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        matches!(&self.outcome, DispatchOutcome::Completed { failures, .. } if failures.is_empty())
    }

    pub fn invoked(&self) -> &[HandlerKind] {
        match &self.outcome {
            DispatchOutcome::Completed { invoked, .. } => invoked,
            DispatchOutcome::NotFound => &[],
        }
    }

    pub fn failures(&self) -> &[HandlerFailure] {
        match &self.outcome {
            DispatchOutcome::Completed { failures, .. } => failures,
            DispatchOutcome::NotFound => &[],
        }
    }
}

struct Envelope {
    event: CommandEvent,
    reply: Option<oneshot::Sender<DispatchReport>>,
}

/// Executes commands against a [`CommandRegistry`], one at a time.
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    reporter: Arc<dyn UserReporter>,
    max_nesting: usize,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CommandRegistry>,
        reporter: Arc<dyn UserReporter>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            reporter,
            max_nesting: config.max_nesting,
        }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn reporter(&self) -> &Arc<dyn UserReporter> {
        &self.reporter
    }

    /// Start the worker loop and return a handle for submitting commands.
    pub fn spawn(self, config: &DispatcherConfig) -> DispatcherHandle {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = DispatcherHandle {
            tx,
            shutdown: Arc::new(shutdown_tx),
            task: Arc::new(Mutex::new(None)),
        };
        let worker_handle = handle.clone();
        let task = tokio::spawn(async move {
            self.run_loop(rx, shutdown_rx, worker_handle).await;
        });
        *handle.task.lock() = Some(task);
        handle
    }

    async fn run_loop(
        self,
        mut rx: mpsc::Receiver<Envelope>,
        mut shutdown: watch::Receiver<bool>,
        handle: DispatcherHandle,
    ) {
        info!("command dispatcher started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else {
                        break;
                    };
                    let report = self.execute(envelope.event, 0, &handle).await;
                    if let Some(reply) = envelope.reply {
                        let _ = reply.send(report);
                    }
                }
            }
        }
        info!("command dispatcher stopped");
    }

    fn execute<'a>(
        &'a self,
        event: CommandEvent,
        depth: usize,
        handle: &'a DispatcherHandle,
    ) -> BoxFuture<'a, DispatchReport> {
        async move {
            let handlers = match self.registry.handlers_for(&event.name) {
                Ok(handlers) => handlers,
                Err(err) => {
                    error!(command = %event.name, error = %err, "command registry unavailable");
                    Vec::new()
                }
            };
            if handlers.is_empty() {
                warn!(command = %event.name, "no handler registered for command");
                self.reporter.error(&format!(
                    "Sorry, this feature ({}) not yet implemented",
                    event.name
                ));
                return DispatchReport {
                    command: event.name,
                    outcome: DispatchOutcome::NotFound,
                };
            }

            debug!(command = %event, depth, handlers = handlers.len(), "dispatching command");
            let scope = DispatchScope {
                dispatcher: self,
                handle,
                depth,
            };
            let mut invoked = Vec::with_capacity(handlers.len());
            let mut failures = Vec::new();
            for handler in handlers {
                let kind = handler.kind();
                invoked.push(kind);
                self.registry.notify_pre(kind, &event);
                let result = AssertUnwindSafe(handler.execute(&event, &scope))
                    .catch_unwind()
                    .await;
                match result {
                    Ok(Ok(())) => self.registry.notify_post(kind, &event),
                    Ok(Err(err)) => failures.push(self.report_failure(kind, &event, err)),
                    Err(panic) => failures.push(self.report_panic(kind, &event, panic)),
                }
            }
            DispatchReport {
                command: event.name,
                outcome: DispatchOutcome::Completed { invoked, failures },
            }
        }
        .boxed()
    }

    fn report_failure(
        &self,
        kind: HandlerKind,
        event: &CommandEvent,
        err: CommandError,
    ) -> HandlerFailure {
        let context = LogContext::new()
            .with_command(&event.name)
            .with_handler(kind.as_str());
        if err.is_user_action() {
            let message = err.user_message();
            log_run_event(Some(&context), "command.refused", &message, RunEventOutcome::Skipped);
            self.reporter.error(&message);
            return HandlerFailure {
                kind,
                message,
                user_action: true,
                panicked: false,
            };
        }
        error!(command = %event, handler = %kind, error = ?err, "command handler failed");
        let message = generic_message(&event.name);
        self.reporter.error(&message);
        HandlerFailure {
            kind,
            message,
            user_action: false,
            panicked: false,
        }
    }

    fn report_panic(
        &self,
        kind: HandlerKind,
        event: &CommandEvent,
        panic: Box<dyn Any + Send>,
    ) -> HandlerFailure {
        error!(
            command = %event,
            handler = %kind,
            panic = %panic_message(panic.as_ref()),
            "command handler panicked"
        );
        let message = generic_message(&event.name);
        self.reporter.error(&message);
        HandlerFailure {
            kind,
            message,
            user_action: false,
            panicked: true,
        }
    }
}

fn generic_message(command: &str) -> String {
    format!("Error processing {command} - see log file for details")
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Passed to handlers so they can trigger further commands.
pub struct DispatchScope<'a> {
    dispatcher: &'a Dispatcher,
    handle: &'a DispatcherHandle,
    depth: usize,
}

impl<'a> DispatchScope<'a> {
    /// Queue `event` behind the command currently executing.
    pub fn dispatch(&self, event: CommandEvent) -> Result<(), DispatchError> {
        self.handle.try_dispatch(event)
    }

    /// Execute `event` inline and wait for all of its handlers.
    pub fn dispatch_now(
        &self,
        event: CommandEvent,
    ) -> BoxFuture<'a, Result<DispatchReport, DispatchError>> {
        let dispatcher = self.dispatcher;
        let handle = self.handle;
        let depth = self.depth + 1;
        async move {
            if depth > dispatcher.max_nesting {
                warn!(command = %event.name, depth, "nested dispatch refused");
                return Err(DispatchError::NestingTooDeep {
                    command: event.name,
                    limit: dispatcher.max_nesting,
                });
            }
            Ok(dispatcher.execute(event, depth, handle).await)
        }
        .boxed()
    }

    /// Owned handle for background tasks started by a handler.
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub fn reporter(&self) -> Arc<dyn UserReporter> {
        self.dispatcher.reporter.clone()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Cloneable entry point to a running [`Dispatcher`].
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Envelope>,
    shutdown: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl DispatcherHandle {
    /// Enqueue a command; returns once it is queued.
    pub async fn dispatch(&self, event: CommandEvent) -> Result<(), DispatchError> {
        self.tx
            .send(Envelope { event, reply: None })
            .await
            .map_err(|_| DispatchError::Closed)
    }

    /// Enqueue without waiting for queue space.
    pub fn try_dispatch(&self, event: CommandEvent) -> Result<(), DispatchError> {
        self.tx
            .try_send(Envelope { event, reply: None })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
            })
    }

    /// Enqueue a command and wait until every handler has run.
    ///
    /// Must not be awaited from inside a handler; use
    /// [`DispatchScope::dispatch_now`] there.
    pub async fn dispatch_now(&self, event: CommandEvent) -> Result<DispatchReport, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                event,
                reply: Some(reply),
            })
            .await
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Stop the worker after the command in progress and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "dispatcher task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}
