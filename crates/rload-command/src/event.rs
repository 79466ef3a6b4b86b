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

use serde::{Deserialize, Serialize};

/// Data carried alongside a command name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    None,
    /// Target engine host for per-host remote commands.
    Host(String),
    Json(serde_json::Value),
}

/// A command request as seen by handlers and observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub name: String,
    #[serde(default)]
    pub payload: Payload,
}

impl CommandEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Payload::None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn for_host(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self::new(name).with_payload(Payload::Host(host.into()))
    }

    pub fn host(&self) -> Option<&str> {
        match &self.payload {
            Payload::Host(host) => Some(host.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for CommandEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Host(host) => write!(f, "{}({})", self.name, host),
            _ => f.write_str(&self.name),
        }
    }
}
