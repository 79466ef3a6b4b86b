//! ---
//! rload_section: "07-application"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Application wiring, run command handlers and run monitoring."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
//! Command names: the only contract between a trigger and its handlers.

pub const START: &str = "start";
pub const START_NO_TIMERS: &str = "start_no_timers";
pub const STOP: &str = "stop";
pub const SHUTDOWN: &str = "shutdown";
pub const REMOTE_START: &str = "remote_start";
pub const REMOTE_START_ALL: &str = "remote_start_all";
pub const REMOTE_STOP: &str = "remote_stop";
pub const REMOTE_STOP_ALL: &str = "remote_stop_all";
pub const REMOTE_SHUTDOWN: &str = "remote_shutdown";
pub const REMOTE_SHUTDOWN_ALL: &str = "remote_shutdown_all";
pub const REMOTE_EXIT: &str = "remote_exit";
pub const REMOTE_EXIT_ALL: &str = "remote_exit_all";
pub const EXIT: &str = "exit";

pub const ALL: &[&str] = &[
    START,
    START_NO_TIMERS,
    STOP,
    SHUTDOWN,
    REMOTE_START,
    REMOTE_START_ALL,
    REMOTE_STOP,
    REMOTE_STOP_ALL,
    REMOTE_SHUTDOWN,
    REMOTE_SHUTDOWN_ALL,
    REMOTE_EXIT,
    REMOTE_EXIT_ALL,
    EXIT,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique() {
        let unique: HashSet<_> = ALL.iter().collect();
        assert_eq!(unique.len(), ALL.len());
    }
}
