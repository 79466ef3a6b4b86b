//! ---
//! rload_section: "05-run-lifecycle"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Engines, local run controller and remote engine coordinator."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::sync::Arc;

use rload_common::EngineConfig;
use rload_tree::{ConfigNode, TreeCloner};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::engine::{Engine, EngineError, EngineEvent, EngineHandle, EngineState, StopMode, LOCAL_HOST};
use crate::standard::{NoopSampler, Sampler, StandardEngine};

/// Builds a fresh local engine for every start.
pub trait EngineFactory: Send + Sync + 'static {
    fn create(&self) -> Result<Arc<dyn Engine>, EngineError>;
}

/// Factory producing [`StandardEngine`]s that share one sampler.
#[derive(Clone)]
pub struct StandardEngineFactory {
    config: EngineConfig,
    sampler: Arc<dyn Sampler>,
}

impl StandardEngineFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            sampler: Arc::new(NoopSampler),
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }
}

impl EngineFactory for StandardEngineFactory {
    fn create(&self) -> Result<Arc<dyn Engine>, EngineError> {
        Ok(Arc::new(StandardEngine::with_sampler(
            LOCAL_HOST,
            self.config.clone(),
            self.sampler.clone(),
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Configured,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running.
    NotRunning,
    Stopping(StopMode),
}

/// Owns at most one local engine.
pub struct LocalRunController {
    factory: Arc<dyn EngineFactory>,
    /// Configured engine not yet asked to run.
    pending: Option<EngineHandle>,
    current: Option<EngineHandle>,
}

impl LocalRunController {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            pending: None,
            current: None,
        }
    }

    /// Clone `source` and hand it to a new engine without running it.
    pub async fn prepare(
        &mut self,
        source: &ConfigNode,
        exclude_timers: bool,
    ) -> Result<EngineHandle, EngineError> {
        self.pending = None;
        let cloner = if exclude_timers {
            TreeCloner::without_timers()
        } else {
            TreeCloner::new()
        };
        let tree = cloner.clone_tree(source)?;
        let nodes = tree.node_count();
        let engine = self.factory.create()?;
        engine.configure(tree).await?;
        debug!(nodes, exclude_timers, "local engine configured");
        let handle = EngineHandle::local(engine);
        self.pending = Some(handle.clone());
        Ok(handle)
    }

    /// Run the engine produced by [`LocalRunController::prepare`].
    ///
    /// The previously held engine, if any, is left as it is and only
    /// replaced once the new one is running.
    pub async fn launch(&mut self) -> Result<EngineHandle, EngineError> {
        let handle = self.pending.take().ok_or(EngineError::NotConfigured)?;
        handle.engine().run().await?;
        if let Some(previous) = self.current.replace(handle.clone()) {
            debug!(previous = ?previous, "replaced local engine reference");
        }
        info!("local run started");
        Ok(handle)
    }

    /// Clone, configure and run in one step. On error nothing changes.
    pub async fn start(
        &mut self,
        source: &ConfigNode,
        exclude_timers: bool,
    ) -> Result<EngineHandle, EngineError> {
        self.prepare(source, exclude_timers).await?;
        self.launch().await
    }

    /// Ask the held engine to stop. A no-op when nothing runs.
    pub async fn stop(&mut self, mode: StopMode) -> Result<StopOutcome, EngineError> {
        if self.state().await != ControllerState::Running {
            return Ok(StopOutcome::NotRunning);
        }
        let Some(handle) = self.current.as_ref() else {
            return Ok(StopOutcome::NotRunning);
        };
        handle.engine().stop(mode).await?;
        info!(?mode, "local run stopping");
        Ok(StopOutcome::Stopping(mode))
    }

    /// Graceful stop: finish in-flight samples, start no new ones.
    pub async fn shutdown(&mut self) -> Result<StopOutcome, EngineError> {
        self.stop(StopMode::Graceful).await
    }

    pub async fn state(&self) -> ControllerState {
        if let Some(handle) = self.current.as_ref() {
            if let Ok(EngineState::Running | EngineState::Stopping) = handle.engine().state().await {
                return ControllerState::Running;
            }
        }
        if self.pending.is_some() {
            ControllerState::Configured
        } else {
            ControllerState::Idle
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == ControllerState::Running
    }

    pub fn current(&self) -> Option<&EngineHandle> {
        self.current.as_ref()
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<EngineEvent>> {
        self.current.as_ref().map(|handle| handle.engine().subscribe())
    }

    /// Drop the engine reference once its run has ended.
    pub async fn release(&mut self) -> Option<EngineHandle> {
        if self.is_running().await {
            return None;
        }
        self.current.take()
    }
}
