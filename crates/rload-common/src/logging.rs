//! ---
//! rload_section: "01-core-functionality"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Shared configuration and logging primitives."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::env;

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "RLOAD_LOG";

/// Run chatter from rload crates at `info`, HTTP plumbing only when it warns.
pub const DEFAULT_FILTER: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn,h2=warn";

static GUARDS: OnceCell<(WorkerGuard, WorkerGuard)> = OnceCell::new();

/// Stdout rendering. The per-service file is always JSON.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

/// Filter directive in effect, with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Directive {
    value: String,
    source: &'static str,
}

/// `RLOAD_LOG` beats `RUST_LOG`, which beats `logging.filter`.
fn select_directive(
    rload_log: Option<String>,
    rust_log: Option<String>,
    configured: Option<&str>,
) -> Directive {
    let candidates = [
        (rload_log, LOG_ENV),
        (rust_log, "RUST_LOG"),
        (configured.map(str::to_owned), "logging.filter"),
    ];
    candidates
        .into_iter()
        .find_map(|(value, source)| {
            value
                .filter(|value| !value.trim().is_empty())
                .map(|value| Directive { value, source })
        })
        .unwrap_or_else(|| Directive {
            value: DEFAULT_FILTER.to_owned(),
            source: "default",
        })
}

/// Rolling file base name: `<prefix>-<service>.log`, or `<service>.log` without a prefix.
///
/// The coordinator and agents can share a directory without clobbering each other.
pub fn log_file_name(service_name: &str, config: &LoggingConfig) -> String {
    match config.file_prefix.as_deref().map(str::trim) {
        Some(prefix) if !prefix.is_empty() && prefix != service_name => {
            format!("{prefix}-{service_name}.log")
        }
        _ => format!("{service_name}.log"),
    }
}

fn build_filter(directive: &Directive) -> (EnvFilter, Option<String>) {
    match EnvFilter::try_new(&directive.value) {
        Ok(filter) => (filter, None),
        Err(err) => (
            EnvFilter::new(DEFAULT_FILTER),
            Some(format!("invalid {} directive ({err})", directive.source)),
        ),
    }
}

/// Install the process-wide subscriber for `service_name` (`rload` or `rload-agent`).
///
/// Stdout follows `config.format`; a daily rolling JSON file named by
/// [`log_file_name`] lands in `config.directory`. Calling it again keeps the
/// first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let file_name = log_file_name(service_name, config);

    let file_appender = daily(&config.directory, &file_name);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let directive = select_directive(
        env::var(LOG_ENV).ok(),
        env::var("RUST_LOG").ok(),
        config.filter.as_deref(),
    );
    let (filter, rejected) = build_filter(&directive);

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(file_writer)
        .boxed();

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        return Ok(());
    }
    let _ = GUARDS.set((file_guard, stdout_guard));

    if let Some(reason) = rejected {
        warn!(%reason, fallback = DEFAULT_FILTER, "log filter rejected");
    }
    info!(
        service = %service_name,
        log_dir = %config.directory.display(),
        log_file = %file_name,
        filter = %directive.value,
        filter_source = directive.source,
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}
