//! ---
//! rload_section: "06-remote-transport"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "HTTP transport between coordinators and remote engines."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
//! JSON bodies exchanged between the client and the agent.

use rload_engine::{EngineError, EngineEvent, EngineState, StopMode};
use rload_tree::ConfigNode;
use serde::{Deserialize, Serialize};

/// Body of `POST /engine/configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureRequest {
    /// Root of an already cloned tree; the agent clones it once more.
    pub tree: ConfigNode,
}

/// Body of `POST /engine/stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    pub mode: StopMode,
}

/// Answer of `GET /engine/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub host: String,
    pub state: EngineState,
    /// Sequence number of the newest recorded event; 0 when none.
    pub last_event: u64,
}

/// Query of `GET /engine/events`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub after: u64,
}

/// Events recorded after the requested sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsResponse {
    /// Cursor to send as `after` on the next poll.
    pub next: u64,
    pub events: Vec<EngineEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Configuration,
    NotConfigured,
    AlreadyRunning,
    Terminated,
    Transport,
}

/// Error payload returned by the agent for every rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
}

impl From<&EngineError> for ErrorBody {
    fn from(err: &EngineError) -> Self {
        let (code, error) = match err {
            EngineError::Configuration(reason) => (ErrorCode::Configuration, reason.clone()),
            EngineError::NotConfigured => (ErrorCode::NotConfigured, err.to_string()),
            EngineError::AlreadyRunning => (ErrorCode::AlreadyRunning, err.to_string()),
            EngineError::Terminated => (ErrorCode::Terminated, err.to_string()),
            EngineError::Transport(reason) => (ErrorCode::Transport, reason.clone()),
        };
        Self { error, code }
    }
}

impl ErrorBody {
    /// Rebuild the engine error the agent reported.
    pub fn into_engine_error(self) -> EngineError {
        match self.code {
            ErrorCode::Configuration => EngineError::Configuration(self.error),
            ErrorCode::NotConfigured => EngineError::NotConfigured,
            ErrorCode::AlreadyRunning => EngineError::AlreadyRunning,
            ErrorCode::Terminated => EngineError::Terminated,
            ErrorCode::Transport => EngineError::Transport(self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_reason_survives_the_wire() {
        let err = EngineError::Configuration("test plan plan has no thread group".into());
        let json = serde_json::to_string(&ErrorBody::from(&err)).expect("serialise");
        assert!(json.contains("\"code\":\"configuration\""));
        let body: ErrorBody = serde_json::from_str(&json).expect("deserialise");
        assert_eq!(body.into_engine_error(), err);
    }

    #[test]
    fn events_query_defaults_to_start() {
        let query: EventsQuery = serde_json::from_str("{}").expect("deserialise");
        assert_eq!(query.after, 0);
    }
}
