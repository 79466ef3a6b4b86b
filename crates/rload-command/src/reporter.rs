//! ---
//! rload_section: "04-command-dispatch"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Command registry, serialized dispatcher and user reporting."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

/// Surface for messages meant for the person driving the run.
pub trait UserReporter: Send + Sync + 'static {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// Writes user messages to the log under the `rload::user` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl UserReporter for TracingReporter {
    fn info(&self, message: &str) {
        info!(target: "rload::user", "{message}");
    }

    fn error(&self, message: &str) {
        error!(target: "rload::user", "{message}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserMessage {
    pub level: MessageLevel,
    pub text: String,
}

/// Keeps every message in memory; used by tests and the CLI summary.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    messages: Mutex<Vec<UserMessage>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<UserMessage> {
        self.messages.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.texts(MessageLevel::Error)
    }

    pub fn infos(&self) -> Vec<String> {
        self.texts(MessageLevel::Info)
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    fn texts(&self, level: MessageLevel) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|message| message.level == level)
            .map(|message| message.text.clone())
            .collect()
    }

    fn push(&self, level: MessageLevel, text: &str) {
        self.messages.lock().push(UserMessage {
            level,
            text: text.to_owned(),
        });
    }
}

impl UserReporter for CollectingReporter {
    fn info(&self, message: &str) {
        self.push(MessageLevel::Info, message);
    }

    fn error(&self, message: &str) {
        self.push(MessageLevel::Error, message);
    }
}
