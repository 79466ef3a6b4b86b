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

use rload_command::{CommandHandler, HandlerTable};

use crate::context::AppContext;
use crate::handlers::{ExitHandler, LocalRunHandler, RemoteRunHandler};

/// Handler types compiled into every rload process.
pub fn handler_table(ctx: &Arc<AppContext>) -> HandlerTable {
    let local = ctx.clone();
    let remote = ctx.clone();
    let exit = ctx.clone();
    HandlerTable::new()
        .with_factory(LocalRunHandler::KIND, move || {
            Ok(Arc::new(LocalRunHandler::new(local.clone())) as Arc<dyn CommandHandler>)
        })
        .with_factory(RemoteRunHandler::KIND, move || {
            Ok(Arc::new(RemoteRunHandler::new(remote.clone())) as Arc<dyn CommandHandler>)
        })
        .with_factory(ExitHandler::KIND, move || {
            Ok(Arc::new(ExitHandler::new(exit.clone())) as Arc<dyn CommandHandler>)
        })
}
