//! ---
//! rload_section: "04-command-dispatch"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Command registry, serialized dispatcher and user reporting."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::fmt;

use async_trait::async_trait;

use crate::dispatcher::DispatchScope;
use crate::error::CommandError;
use crate::event::CommandEvent;

/// Stable identity of a handler type. Hooks and lookups are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKind(pub &'static str);

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Responds to one or more command names.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    fn kind(&self) -> HandlerKind;

    /// Names this handler is registered under. Read once at discovery.
    fn command_names(&self) -> Vec<String>;

    /// Run the command. Long operations should move to a background task
    /// and report through the user reporter instead of holding the worker.
    async fn execute(&self, event: &CommandEvent, scope: &DispatchScope<'_>)
        -> Result<(), CommandError>;
}

/// Notified before or after a handler of a given kind runs.
pub trait CommandObserver: Send + Sync + 'static {
    fn observe(&self, kind: HandlerKind, event: &CommandEvent);
}

impl<F> CommandObserver for F
where
    F: Fn(HandlerKind, &CommandEvent) + Send + Sync + 'static,
{
    fn observe(&self, kind: HandlerKind, event: &CommandEvent) {
        self(kind, event)
    }
}
