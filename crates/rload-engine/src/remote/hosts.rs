//! ---
//! rload_section: "05-run-lifecycle"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Engines, local run controller and remote engine coordinator."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use indexmap::IndexSet;

/// Ordered, de-duplicated list of engine hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostList {
    hosts: IndexSet<String>,
}

impl HostList {
    /// Split a comma delimited list, falling back to `default_host` when
    /// `raw` is unset or holds no usable entry.
    pub fn parse(raw: Option<&str>, default_host: &str) -> Self {
        let mut hosts: IndexSet<String> = raw
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_owned)
            .collect();
        if hosts.is_empty() {
            hosts.insert(default_host.trim().to_owned());
        }
        Self { hosts }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }
}
