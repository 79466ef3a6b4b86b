//! ---
//! rload_section: "04-command-dispatch"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Command registry, serialized dispatcher and user reporting."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::error::Error as StdError;

use thiserror::Error;

/// Failure returned by a [`crate::CommandHandler`].
#[derive(Debug, Error)]
pub enum CommandError {
    /// The operation is invalid from the user's point of view.
    ///
    /// Shown to the user verbatim; never treated as a defect.
    #[error("{message}")]
    UserAction {
        message: String,
        #[source]
        cause: Option<Box<dyn StdError + Send + Sync>>,
    },
    /// Unexpected failure; logged in full, surfaced generically.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl CommandError {
    pub fn user_action(message: impl Into<String>) -> Self {
        CommandError::UserAction {
            message: message.into(),
            cause: None,
        }
    }

    pub fn user_action_caused_by(
        message: impl Into<String>,
        cause: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        CommandError::UserAction {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn is_user_action(&self) -> bool {
        matches!(self, CommandError::UserAction { .. })
    }

    /// Text shown to the user: the message, followed by the cause on its own line.
    pub fn user_message(&self) -> String {
        match self {
            CommandError::UserAction {
                message,
                cause: Some(cause),
            } => format!("{message}\n{cause}"),
            CommandError::UserAction { message, cause: None } => message.clone(),
            CommandError::Handler(err) => err.to_string(),
        }
    }
}

/// A single handler factory could not produce its handler.
#[derive(Debug, Error)]
#[error("handler {kind} unavailable: {reason}")]
pub struct DiscoveryError {
    pub kind: &'static str,
    pub reason: String,
}

impl DiscoveryError {
    pub fn new(kind: &'static str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Discovery produced no handler at all; startup must stop.
    #[error("no command handlers were discovered")]
    NoHandlers,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher is not running")]
    Closed,
    #[error("dispatch queue is full")]
    QueueFull,
    #[error("nested dispatch of {command} exceeds the limit of {limit}")]
    NestingTooDeep { command: String, limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_appends_cause_on_new_line() {
        let err = CommandError::user_action_caused_by(
            "unable to start the engine",
            "thread group users has no threads",
        );
        assert_eq!(
            err.user_message(),
            "unable to start the engine\nthread group users has no threads"
        );
        assert!(err.is_user_action());
    }

    #[test]
    fn handler_errors_convert_from_anyhow() {
        let err: CommandError = anyhow::anyhow!("boom").into();
        assert!(!err.is_user_action());
        assert_eq!(err.user_message(), "boom");
    }
}
