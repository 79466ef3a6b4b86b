//! ---
//! rload_section: "06-remote-transport"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "HTTP transport between coordinators and remote engines."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
//! HTTP transport for remote engines.
//!
//! [`EngineAgentBuilder`] serves one [`rload_engine::Engine`] under
//! `/engine/*`; [`HttpConnector`] implements
//! [`rload_engine::RemoteConnector`] so a coordinator can drive such agents.

pub mod agent;
pub mod client;
pub mod wire;

pub use agent::{AgentHandle, EngineAgentBuilder};
pub use client::{base_url, ClientError, HttpConnector, HttpRemoteEngine};
pub use wire::{
    ConfigureRequest, ErrorBody, ErrorCode, EventsQuery, EventsResponse, StatusResponse,
    StopRequest,
};
