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

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOp {
    Init,
    Start,
    Stop,
    Shutdown,
    Exit,
}

impl RemoteOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteOp::Init => "init",
            RemoteOp::Start => "start",
            RemoteOp::Stop => "stop",
            RemoteOp::Shutdown => "shutdown",
            RemoteOp::Exit => "exit",
        }
    }
}

impl fmt::Display for RemoteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFailure {
    pub host: String,
    pub error: String,
}

/// Outcome of one operation applied to every configured host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub op: RemoteOp,
    pub succeeded: Vec<String>,
    /// Hosts without a handle.
    pub skipped: Vec<String>,
    pub failures: Vec<HostFailure>,
}

impl BroadcastReport {
    pub fn new(op: RemoteOp) -> Self {
        Self {
            op,
            succeeded: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.skipped.len() + self.failures.len()
    }

    pub fn failed_hosts(&self) -> Vec<&str> {
        self.failures.iter().map(|failure| failure.host.as_str()).collect()
    }

    /// One user-facing message naming every failing host, if any failed.
    pub fn failure_message(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .failures
            .iter()
            .map(|failure| format!("{}: {}", failure.host, failure.error))
            .collect();
        Some(format!(
            "Remote {} failed on {} of {} host(s):\n{}",
            self.op,
            self.failures.len(),
            self.attempted(),
            lines.join("\n")
        ))
    }
}
