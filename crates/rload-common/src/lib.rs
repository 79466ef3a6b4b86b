//! ---
//! rload_section: "01-core-functionality"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Shared configuration and logging primitives."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
//! Shared primitives for the rload workspace: configuration loading and
//! tracing initialisation consumed by every other crate and binary.

pub mod config;
pub mod logging;

pub use config::{
    AgentConfig, AppConfig, DispatcherConfig, EngineConfig, LoadedAppConfig, LoggingConfig,
    RemoteConfig,
};
pub use logging::{init_tracing, log_file_name, LogFormat};
