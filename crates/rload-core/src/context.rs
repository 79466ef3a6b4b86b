//! ---
//! rload_section: "07-application"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Application wiring, run command handlers and run monitoring."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rload_command::CommandError;
use rload_engine::LocalRunController;
use rload_tree::ConfigNode;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::remote::RemoteClient;

/// Supplies the live configuration tree. The core only ever reads it.
pub trait TreeProvider: Send + Sync + 'static {
    fn current(&self) -> Option<Arc<ConfigNode>>;
}

/// Tree provider holding one plan in memory.
#[derive(Debug, Default)]
pub struct StaticTreeProvider {
    tree: RwLock<Option<Arc<ConfigNode>>>,
}

impl StaticTreeProvider {
    pub fn new(tree: ConfigNode) -> Self {
        Self {
            tree: RwLock::new(Some(Arc::new(tree))),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn replace(&self, tree: ConfigNode) {
        *self.tree.write() = Some(Arc::new(tree));
    }
}

impl TreeProvider for StaticTreeProvider {
    fn current(&self) -> Option<Arc<ConfigNode>> {
        self.tree.read().clone()
    }
}

/// State shared by the run handlers.
pub struct AppContext {
    tree: Arc<dyn TreeProvider>,
    local: tokio::sync::Mutex<LocalRunController>,
    remote: RemoteClient,
    run_id: Mutex<Option<Uuid>>,
    exit: watch::Sender<bool>,
}

impl AppContext {
    pub fn new(tree: Arc<dyn TreeProvider>, local: LocalRunController, remote: RemoteClient) -> Self {
        let (exit, _) = watch::channel(false);
        Self {
            tree,
            local: tokio::sync::Mutex::new(local),
            remote,
            run_id: Mutex::new(None),
            exit,
        }
    }

    /// The plan to run, or a user-facing refusal when none is loaded.
    pub fn plan(&self) -> Result<Arc<ConfigNode>, CommandError> {
        self.tree
            .current()
            .ok_or_else(|| CommandError::user_action("no test plan is loaded"))
    }

    pub fn local(&self) -> &tokio::sync::Mutex<LocalRunController> {
        &self.local
    }

    pub fn remote(&self) -> &RemoteClient {
        &self.remote
    }

    /// Allocate the identifier logged with every event of a new run.
    pub fn begin_run(&self) -> Uuid {
        let id = Uuid::new_v4();
        *self.run_id.lock() = Some(id);
        id
    }

    pub fn run_id(&self) -> Option<Uuid> {
        *self.run_id.lock()
    }

    pub fn request_exit(&self) {
        if !self.exit.send_replace(true) {
            info!("application exit requested");
        }
    }

    pub fn is_exit_requested(&self) -> bool {
        *self.exit.borrow()
    }

    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit.subscribe()
    }
}
