//! ---
//! rload_section: "05-run-lifecycle"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Engines, local run controller and remote engine coordinator."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
//! Run lifecycle: the [`Engine`] contract, the in-process [`StandardEngine`],
//! the [`LocalRunController`] owning at most one local engine, and the
//! [`RemoteCoordinator`] fanning operations out to engines keyed by host.

pub mod engine;
pub mod local;
pub mod remote;
pub mod standard;

pub use engine::{
    Engine, EngineError, EngineEvent, EngineEventKind, EngineHandle, EngineState, StopMode,
    LOCAL_HOST,
};
pub use local::{ControllerState, EngineFactory, LocalRunController, StandardEngineFactory, StopOutcome};
pub use remote::{
    BroadcastReport, HostFailure, HostList, HostOutcome, RemoteConnector, RemoteCoordinator,
    RemoteError, RemoteOp, RunStatus, REMOTE_LISTENER_KIND,
};
pub use standard::{EngineStats, NoopSampler, SampleOutcome, Sampler, SamplerCall, StandardEngine};
