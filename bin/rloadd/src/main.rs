//! ---
//! rload_section: "08-binary"
//! rload_subsection: "binary"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Binary entrypoint running test plans or serving a remote engine agent."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::RwLock;
use rload_command::CommandEvent;
use rload_common::config::AppConfig;
use rload_common::logging::init_tracing;
use rload_core::{names, ApplicationBuilder, StaticTreeProvider};
use rload_engine::StandardEngine;
use rload_net::{EngineAgentBuilder, HttpConnector};
use rload_tree::ConfigNode;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("rload ", env!("CARGO_PKG_VERSION")),
    about = "rload test-plan runner",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run a test plan locally or on the configured remote hosts")]
    Run {
        #[arg(long, value_name = "FILE", help = "Test plan in JSON form")]
        plan: PathBuf,
        #[arg(long, help = "Run on remote agents instead of in-process")]
        remote: bool,
        #[arg(
            long,
            value_name = "LIST",
            help = "Comma separated remote hosts, overriding remote.hosts"
        )]
        hosts: Option<String>,
        #[arg(long, help = "Leave timers out of the local run")]
        no_timers: bool,
    },
    #[command(about = "Serve an engine for remote coordinators")]
    Agent {
        #[arg(long, value_name = "ADDR", help = "Listen address, overriding agent.listen")]
        listen: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/rload.toml"));

    let loaded = AppConfig::load_or_default(&candidates)?;
    let mut config = loaded.config;
    let service = match &cli.command {
        Commands::Run { .. } => "rload",
        Commands::Agent { .. } => "rload-agent",
    };
    init_tracing(service, &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }

    match cli.command {
        Commands::Run {
            plan,
            remote,
            hosts,
            no_timers,
        } => {
            if let Some(hosts) = hosts {
                config.remote.hosts = Some(hosts);
            }
            run_plan(config, &plan, remote, no_timers).await
        }
        Commands::Agent { listen } => {
            if let Some(listen) = listen {
                config.agent.listen = listen;
            }
            run_agent(config).await
        }
    }
}

fn load_plan(path: &Path) -> Result<ConfigNode> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("unable to read test plan {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse test plan {}", path.display()))
}

async fn run_plan(config: AppConfig, plan_path: &Path, remote: bool, no_timers: bool) -> Result<()> {
    let plan = load_plan(plan_path)?;
    info!(plan = %plan.name, nodes = plan.node_count(), remote, "test plan loaded");

    let remote_config = Arc::new(RwLock::new(config.remote.clone()));
    let connector = HttpConnector::new(remote_config.clone())?;
    let app = ApplicationBuilder::new(config, Arc::new(connector))
        .with_remote_config(remote_config)
        .with_tree_provider(Arc::new(StaticTreeProvider::new(plan)))
        .build()?;

    let (start, stop) = if remote {
        if no_timers {
            warn!("--no-timers only applies to local runs; remote hosts run every timer");
        }
        (names::REMOTE_START_ALL, names::REMOTE_STOP_ALL)
    } else if no_timers {
        (names::START_NO_TIMERS, names::STOP)
    } else {
        (names::START, names::STOP)
    };

    let report = app.dispatch_now(CommandEvent::new(start)).await?;
    if report.is_success() {
        let finished = async {
            if remote {
                app.wait_for_remote_run().await;
            } else {
                app.wait_for_local_run().await;
            }
        };
        tokio::select! {
            _ = finished => info!("test run finished"),
            result = signal::ctrl_c() => {
                result?;
                info!("ctrl-c received; stopping test");
                app.dispatch_now(CommandEvent::new(stop)).await?;
            }
        }
    } else {
        warn!(command = start, "test run did not start");
    }

    app.dispatch_now(CommandEvent::new(names::EXIT)).await?;
    app.exited().await;
    app.shutdown().await;
    Ok(())
}

async fn run_agent(config: AppConfig) -> Result<()> {
    let listen = config.agent.listen;
    let engine = StandardEngine::new(listen.to_string(), config.engine.clone());
    let agent = EngineAgentBuilder::new(listen, Arc::new(engine))
        .with_event_capacity(config.engine.event_capacity)
        .spawn()
        .await?;
    info!(address = %agent.local_addr(), "engine agent listening");

    tokio::select! {
        _ = agent.exit_requested() => info!("exit requested by coordinator"),
        result = signal::ctrl_c() => {
            result?;
            info!("ctrl-c received; shutting down");
        }
    }
    agent.shutdown().await
}
