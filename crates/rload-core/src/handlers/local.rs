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

use async_trait::async_trait;
use rload_command::{CommandError, CommandEvent, CommandHandler, DispatchScope, HandlerKind};
use rload_engine::{EngineError, StopMode, StopOutcome};
use rload_logging::{log_run_event, LogContext, RunEventOutcome};
use tracing::info;

use super::unexpected;
use crate::context::AppContext;
use crate::names;

/// Start, stop and shut down the in-process engine.
pub struct LocalRunHandler {
    ctx: Arc<AppContext>,
}

impl LocalRunHandler {
    pub const KIND: HandlerKind = HandlerKind("local_run");

    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    async fn start(
        &self,
        command: &str,
        exclude_timers: bool,
        scope: &DispatchScope<'_>,
    ) -> Result<(), CommandError> {
        let plan = self.ctx.plan()?;
        let mut local = self.ctx.local().lock().await;
        if local.is_running().await {
            return Err(CommandError::user_action("a run is already in progress"));
        }
        let run_id = self.ctx.begin_run().to_string();
        let context = LogContext::new()
            .with_command(command)
            .with_handler(Self::KIND.as_str())
            .with_run(&run_id);
        match local.start(&plan, exclude_timers).await {
            Ok(handle) => {
                log_run_event(
                    Some(&context),
                    "run.requested",
                    "local engine started",
                    RunEventOutcome::Success,
                );
                info!(engine = %handle.id(), exclude_timers, run_id = %run_id, "local run started");
                scope.reporter().info("Test started");
                Ok(())
            }
            Err(err @ EngineError::Configuration(_)) => {
                log_run_event(
                    Some(&context),
                    "run.requested",
                    &err.to_string(),
                    RunEventOutcome::Fault,
                );
                Err(CommandError::user_action_caused_by(
                    "The test plan could not be started",
                    err,
                ))
            }
            Err(err) => Err(CommandError::Handler(
                anyhow::Error::new(err).context("local engine failed to start"),
            )),
        }
    }

    async fn stop(&self, mode: StopMode, scope: &DispatchScope<'_>) -> Result<(), CommandError> {
        let outcome = self
            .ctx
            .local()
            .lock()
            .await
            .stop(mode)
            .await
            .map_err(|err| {
                CommandError::Handler(anyhow::Error::new(err).context("local engine refused to stop"))
            })?;
        match outcome {
            StopOutcome::NotRunning => scope.reporter().info("no test is running"),
            StopOutcome::Stopping(StopMode::Immediate) => scope.reporter().info("Stopping test"),
            StopOutcome::Stopping(StopMode::Graceful) => {
                scope.reporter().info("Shutting down test; threads finish their current sample")
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for LocalRunHandler {
    fn kind(&self) -> HandlerKind {
        Self::KIND
    }

    fn command_names(&self) -> Vec<String> {
        [names::START, names::START_NO_TIMERS, names::STOP, names::SHUTDOWN]
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    async fn execute(&self, event: &CommandEvent, scope: &DispatchScope<'_>) -> Result<(), CommandError> {
        match event.name.as_str() {
            names::START => self.start(names::START, false, scope).await,
            names::START_NO_TIMERS => self.start(names::START_NO_TIMERS, true, scope).await,
            names::STOP => self.stop(StopMode::Immediate, scope).await,
            names::SHUTDOWN => self.stop(StopMode::Graceful, scope).await,
            _ => Err(unexpected(event)),
        }
    }
}
