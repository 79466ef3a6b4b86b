//! ---
//! rload_section: "04-command-dispatch"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Command registry, serialized dispatcher and user reporting."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
//! Every triggerable operation funnels through this crate. Handlers are
//! discovered once from a compiled-in [`HandlerTable`], looked up by command
//! name, and executed one command at a time by the [`Dispatcher`] worker.

mod dispatcher;
mod error;
mod event;
mod handler;
mod registry;
mod reporter;

pub use dispatcher::{
    DispatchOutcome, DispatchReport, DispatchScope, Dispatcher, DispatcherHandle, HandlerFailure,
};
pub use error::{CommandError, DiscoveryError, DispatchError, RegistryError};
pub use event::{CommandEvent, Payload};
pub use handler::{CommandHandler, CommandObserver, HandlerKind};
pub use registry::{CommandRegistry, HandlerFactory, HandlerTable};
pub use reporter::{CollectingReporter, MessageLevel, TracingReporter, UserMessage, UserReporter};
