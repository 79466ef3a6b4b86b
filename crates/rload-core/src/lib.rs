//! ---
//! rload_section: "07-application"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Application wiring, run command handlers and run monitoring."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
//! Application wiring for rload.
//!
//! [`ApplicationBuilder`] builds the command registry from the compiled-in
//! [`handler_table`], starts the dispatcher, the remote worker owning the
//! [`rload_engine::RemoteCoordinator`], and the [`RunMonitor`].

mod app;
mod context;
pub mod handlers;
mod monitor;
pub mod names;
mod remote;
mod table;

pub use app::{Application, ApplicationBuilder};
pub use context::{AppContext, StaticTreeProvider, TreeProvider};
pub use monitor::RunMonitor;
pub use remote::{RemoteClient, Target};
pub use table::handler_table;
