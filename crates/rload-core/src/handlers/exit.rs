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
use tracing::{info, warn};

use crate::context::AppContext;
use crate::names;

/// Wind everything down, then signal that the process may exit.
pub struct ExitHandler {
    ctx: Arc<AppContext>,
}

impl ExitHandler {
    pub const KIND: HandlerKind = HandlerKind("exit");

    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CommandHandler for ExitHandler {
    fn kind(&self) -> HandlerKind {
        Self::KIND
    }

    fn command_names(&self) -> Vec<String> {
        vec![names::EXIT.to_owned()]
    }

    async fn execute(&self, _event: &CommandEvent, scope: &DispatchScope<'_>) -> Result<(), CommandError> {
        for command in [names::SHUTDOWN, names::REMOTE_EXIT_ALL] {
            match scope.dispatch_now(CommandEvent::new(command)).await {
                Ok(report) if !report.is_success() => {
                    warn!(command, failures = report.failures().len(), "exit continues past failed step");
                }
                Ok(_) => {}
                Err(err) => warn!(command, error = %err, "exit step not dispatched"),
            }
        }
        // Remote exits are queued; wait until they have been sent.
        let remaining = self.ctx.remote().started_hosts().await;
        if !remaining.is_empty() {
            warn!(hosts = ?remaining, "remote engines may still be running");
        }
        info!("shut down complete; exiting");
        self.ctx.request_exit();
        Ok(())
    }
}
