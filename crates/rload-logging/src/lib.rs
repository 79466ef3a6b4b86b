//! ---
//! rload_section: "03-logging"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Structured run-event logging helpers."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
#![warn(missing_docs)]

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

/// Initialize a baseline tracing subscriber suitable for development and tests.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context attached to run lifecycle events.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Engine host the event concerns (`local` for the in-process engine).
    pub host: Option<&'a str>,
    /// Command name being dispatched.
    pub command: Option<&'a str>,
    /// Handler kind executing the command.
    pub handler: Option<&'a str>,
    /// Identifier of the run the event belongs to.
    pub run_id: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an engine host.
    pub fn with_host(mut self, host: &'a str) -> Self {
        self.host = Some(host);
        self
    }

    /// Attach a command name.
    pub fn with_command(mut self, command: &'a str) -> Self {
        self.command = Some(command);
        self
    }

    /// Attach a handler kind.
    pub fn with_handler(mut self, handler: &'a str) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Attach a run identifier.
    pub fn with_run(mut self, run_id: &'a str) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// Outcome recorded with a run lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEventOutcome {
    /// The step completed.
    Success,
    /// The step was skipped because there was nothing to act on.
    Skipped,
    /// The step failed.
    Fault,
}

impl RunEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RunEventOutcome::Success => "success",
            RunEventOutcome::Skipped => "skipped",
            RunEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized run lifecycle event.
pub fn log_run_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: RunEventOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    let host = ctx.host.unwrap_or("");
    let command = ctx.command.unwrap_or("");
    let handler = ctx.handler.unwrap_or("");
    let run_id = ctx.run_id.unwrap_or("");
    // `tracing::event!` needs a constant level, hence one arm per outcome.
    match outcome {
        RunEventOutcome::Success | RunEventOutcome::Skipped => tracing::event!(
            Level::INFO,
            event,
            outcome = outcome.as_str(),
            host,
            command,
            handler,
            run_id,
            message = %message
        ),
        RunEventOutcome::Fault => tracing::event!(
            Level::ERROR,
            event,
            outcome = outcome.as_str(),
            host,
            command,
            handler,
            run_id,
            message = %message
        ),
    }
}
