//! ---
//! rload_section: "07-application"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Application wiring, run command handlers and run monitoring."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
//! Handlers for the run commands in [`crate::names`].

mod exit;
mod local;
mod remote;

pub use exit::ExitHandler;
pub use local::LocalRunHandler;
pub use remote::RemoteRunHandler;

use rload_command::{CommandError, CommandEvent};

fn unexpected(event: &CommandEvent) -> CommandError {
    CommandError::Handler(anyhow::anyhow!(
        "command {} routed to the wrong handler",
        event.name
    ))
}
