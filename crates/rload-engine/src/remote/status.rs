//! ---
//! rload_section: "05-run-lifecycle"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Engines, local run controller and remote engine coordinator."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::engine::{EngineEvent, EngineEventKind};

/// Aggregate view of a distributed run, fed by engine events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    started: BTreeSet<String>,
    ended: BTreeSet<String>,
    /// Active thread count per host and thread group.
    groups: BTreeMap<String, BTreeMap<String, usize>>,
}

impl RunStatus {
    pub fn apply(&mut self, event: &EngineEvent) {
        let host = event.host.as_str();
        match &event.kind {
            EngineEventKind::TestStarted => {
                self.started.insert(host.to_owned());
                self.ended.remove(host);
            }
            EngineEventKind::ThreadGroupStarted { group, threads } => {
                self.groups
                    .entry(host.to_owned())
                    .or_default()
                    .insert(group.clone(), *threads);
            }
            EngineEventKind::ThreadGroupFinished { group } => {
                if let Some(groups) = self.groups.get_mut(host) {
                    groups.remove(group);
                }
            }
            EngineEventKind::TestEnded => {
                self.ended.insert(host.to_owned());
                self.groups.remove(host);
            }
        }
    }

    /// True once at least one host started and every started host ended.
    pub fn all_ended(&self) -> bool {
        !self.started.is_empty() && self.started.is_subset(&self.ended)
    }

    pub fn running_hosts(&self) -> Vec<String> {
        self.started.difference(&self.ended).cloned().collect()
    }

    pub fn has_ended(&self, host: &str) -> bool {
        self.ended.contains(host)
    }

    /// Started and not yet ended.
    pub fn is_running(&self, host: &str) -> bool {
        self.started.contains(host) && !self.ended.contains(host)
    }

    pub fn started_hosts(&self) -> Vec<String> {
        self.started.iter().cloned().collect()
    }

    pub fn active_threads(&self) -> usize {
        self.groups.values().flat_map(|groups| groups.values()).sum()
    }

    pub fn active_threads_on(&self, host: &str) -> usize {
        self.groups
            .get(host)
            .map(|groups| groups.values().sum())
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
