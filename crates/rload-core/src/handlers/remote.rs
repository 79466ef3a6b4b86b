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
use rload_engine::StopMode;
use tracing::debug;

use super::unexpected;
use crate::context::AppContext;
use crate::names;
use crate::remote::Target;

/// Per-host and broadcast remote commands. All work is handed to the
/// remote worker; outcomes are reported from there.
pub struct RemoteRunHandler {
    ctx: Arc<AppContext>,
}

impl RemoteRunHandler {
    pub const KIND: HandlerKind = HandlerKind("remote_run");

    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }
}

fn host_target(event: &CommandEvent) -> Result<Target, CommandError> {
    event
        .host()
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(|host| Target::Host(host.to_owned()))
        .ok_or_else(|| CommandError::user_action(format!("{} needs a target host", event.name)))
}

#[async_trait]
impl CommandHandler for RemoteRunHandler {
    fn kind(&self) -> HandlerKind {
        Self::KIND
    }

    fn command_names(&self) -> Vec<String> {
        [
            names::REMOTE_START,
            names::REMOTE_START_ALL,
            names::REMOTE_STOP,
            names::REMOTE_STOP_ALL,
            names::REMOTE_SHUTDOWN,
            names::REMOTE_SHUTDOWN_ALL,
            names::REMOTE_EXIT,
            names::REMOTE_EXIT_ALL,
        ]
        .into_iter()
        .map(str::to_owned)
        .collect()
    }

    async fn execute(&self, event: &CommandEvent, _scope: &DispatchScope<'_>) -> Result<(), CommandError> {
        let remote = self.ctx.remote();
        match event.name.as_str() {
            names::REMOTE_START | names::REMOTE_START_ALL => {
                let target = if event.name == names::REMOTE_START {
                    host_target(event)?
                } else {
                    Target::All
                };
                let plan = self.ctx.plan()?;
                let run_id = self.ctx.begin_run();
                debug!(command = %event.name, run_id = %run_id, "remote start queued");
                remote.start(target, plan, false, run_id)
            }
            names::REMOTE_STOP => remote.stop(host_target(event)?, StopMode::Immediate),
            names::REMOTE_STOP_ALL => remote.stop(Target::All, StopMode::Immediate),
            names::REMOTE_SHUTDOWN => remote.stop(host_target(event)?, StopMode::Graceful),
            names::REMOTE_SHUTDOWN_ALL => remote.stop(Target::All, StopMode::Graceful),
            names::REMOTE_EXIT => remote.exit(host_target(event)?),
            names::REMOTE_EXIT_ALL => remote.exit(Target::All),
            _ => Err(unexpected(event)),
        }
    }
}
