//! ---
//! rload_section: "05-run-lifecycle"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Engines, local run controller and remote engine coordinator."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rload_tree::{ClonedTree, TreeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Host label used for the in-process engine.
pub const LOCAL_HOST: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Configured,
    Running,
    Stopping,
    Terminated,
}

impl EngineState {
    /// Running or winding down.
    pub fn is_active(&self) -> bool {
        matches!(self, EngineState::Running | EngineState::Stopping)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineState::Idle => "idle",
            EngineState::Configured => "configured",
            EngineState::Running => "running",
            EngineState::Stopping => "stopping",
            EngineState::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Abort in-flight samples.
    Immediate,
    /// Let each thread finish its current sample, start no new work.
    Graceful,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEventKind {
    TestStarted,
    ThreadGroupStarted { group: String, threads: usize },
    ThreadGroupFinished { group: String },
    TestEnded,
}

/// Lifecycle notification raised by an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub host: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EngineEventKind,
}

impl EngineEvent {
    pub fn now(host: impl Into<String>, kind: EngineEventKind) -> Self {
        Self {
            host: host.into(),
            at: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The supplied tree cannot be executed.
    #[error("invalid test configuration: {0}")]
    Configuration(String),
    #[error("engine has no test configured")]
    NotConfigured,
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("engine has exited")]
    Terminated,
    /// The engine could not be reached or answered unexpectedly.
    #[error("engine transport failure: {0}")]
    Transport(String),
}

impl From<TreeError> for EngineError {
    fn from(err: TreeError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

/// Executes a [`ClonedTree`]. Implemented in-process and over the network.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Host this engine reports in its events.
    fn host(&self) -> &str;

    /// Take ownership of `tree`. Rejected while running.
    async fn configure(&self, tree: ClonedTree) -> Result<(), EngineError>;

    /// Begin executing the configured tree and return without waiting for it.
    async fn run(&self) -> Result<(), EngineError>;

    /// Ask a running test to end. A no-op when nothing runs.
    async fn stop(&self, mode: StopMode) -> Result<(), EngineError>;

    /// Stop any run and discard the configuration.
    async fn reset(&self) -> Result<(), EngineError>;

    /// Stop and release the engine; it accepts no further work.
    async fn exit(&self) -> Result<(), EngineError>;

    async fn state(&self) -> Result<EngineState, EngineError>;

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// One engine instance, local or remote, as held by a controller.
#[derive(Clone)]
pub struct EngineHandle {
    id: String,
    engine: Arc<dyn Engine>,
}

impl EngineHandle {
    pub fn new(id: impl Into<String>, engine: Arc<dyn Engine>) -> Self {
        Self {
            id: id.into(),
            engine,
        }
    }

    pub fn local(engine: Arc<dyn Engine>) -> Self {
        Self::new(LOCAL_HOST, engine)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.id)
            .field("host", &self.engine.host())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialise_flat() {
        let event = EngineEvent::now(
            "10.0.0.1",
            EngineEventKind::ThreadGroupStarted {
                group: "users".into(),
                threads: 4,
            },
        );
        let value = serde_json::to_value(&event).expect("serialise");
        assert_eq!(value["type"], "thread_group_started");
        assert_eq!(value["threads"], 4);
        let back: EngineEvent = serde_json::from_value(value).expect("deserialise");
        assert_eq!(back, event);
    }

    #[test]
    fn tree_errors_are_configuration_errors() {
        let err: EngineError = TreeError::DuplicateId(rload_tree::NodeId(3)).into();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
