//! ---
//! rload_section: "04-command-dispatch"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Command registry, serialized dispatcher and user reporting."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{DiscoveryError, RegistryError};
use crate::event::CommandEvent;
use crate::handler::{CommandHandler, CommandObserver, HandlerKind};

/// Constructor for one handler type.
pub type HandlerFactory =
    Box<dyn Fn() -> Result<Arc<dyn CommandHandler>, DiscoveryError> + Send + Sync>;

struct TableEntry {
    kind: HandlerKind,
    factory: HandlerFactory,
}

/// Compiled-in list of handler types available to a process.
///
/// Downstream crates extend the table before the registry is built, which is
/// how new handler types are added without touching the dispatcher.
#[derive(Default)]
pub struct HandlerTable {
    entries: Vec<TableEntry>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory<F>(mut self, kind: HandlerKind, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn CommandHandler>, DiscoveryError> + Send + Sync + 'static,
    {
        self.push_factory(kind, factory);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        let kind = handler.kind();
        self.push_factory(kind, move || Ok(handler.clone()));
        self
    }

    pub fn push_factory<F>(&mut self, kind: HandlerKind, factory: F)
    where
        F: Fn() -> Result<Arc<dyn CommandHandler>, DiscoveryError> + Send + Sync + 'static,
    {
        self.entries.push(TableEntry {
            kind,
            factory: Box::new(factory),
        });
    }

    pub fn extend(&mut self, other: HandlerTable) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kinds(&self) -> Vec<HandlerKind> {
        self.entries.iter().map(|entry| entry.kind).collect()
    }
}

type HandlerMap = HashMap<String, Vec<Arc<dyn CommandHandler>>>;
type HookMap = HashMap<HandlerKind, Vec<Arc<dyn CommandObserver>>>;

/// Maps command names to the handlers registered for them.
///
/// Starts uninitialised; the first access runs discovery over the table
/// exactly once, even when several callers race for it.
pub struct CommandRegistry {
    table: HandlerTable,
    commands: OnceCell<RwLock<HandlerMap>>,
    pre_hooks: RwLock<HookMap>,
    post_hooks: RwLock<HookMap>,
}

impl CommandRegistry {
    /// Create an uninitialised registry over `table`.
    pub fn new(table: HandlerTable) -> Self {
        Self {
            table,
            commands: OnceCell::new(),
            pre_hooks: RwLock::new(HashMap::new()),
            post_hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry and run discovery immediately.
    pub fn build(table: HandlerTable) -> Result<Arc<Self>, RegistryError> {
        let registry = Arc::new(Self::new(table));
        registry.ensure_ready()?;
        Ok(registry)
    }

    pub fn is_ready(&self) -> bool {
        self.commands.get().is_some()
    }

    /// Run discovery if it has not run yet.
    pub fn ensure_ready(&self) -> Result<(), RegistryError> {
        self.map().map(|_| ())
    }

    fn map(&self) -> Result<&RwLock<HandlerMap>, RegistryError> {
        self.commands
            .get_or_try_init(|| self.discover().map(RwLock::new))
    }

    fn discover(&self) -> Result<HandlerMap, RegistryError> {
        if self.table.is_empty() {
            error!("handler table is empty; command dispatch cannot work");
            return Err(RegistryError::NoHandlers);
        }

        let mut map = HandlerMap::new();
        let mut skipped = 0;
        for entry in &self.table.entries {
            match (entry.factory)() {
                Ok(handler) => {
                    for name in handler.command_names() {
                        insert_unique(&mut map, name, handler.clone());
                    }
                }
                Err(err) => {
                    skipped += 1;
                    warn!(handler = %entry.kind, error = %err, "skipping unavailable command handler");
                }
            }
        }

        if map.is_empty() {
            error!(
                table = self.table.len(),
                skipped,
                "no command handler could be constructed; command dispatch cannot work"
            );
            return Err(RegistryError::NoHandlers);
        }
        info!(
            commands = map.len(),
            handler_types = self.table.len(),
            skipped,
            "command registry ready"
        );
        Ok(map)
    }

    /// Register `handler` for `name`. Registering the same kind twice is a no-op.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<bool, RegistryError> {
        let mut map = self.map()?.write();
        Ok(insert_unique(&mut map, name.into(), handler))
    }

    /// Every handler currently registered for `name`.
    pub fn handlers_for(&self, name: &str) -> Result<Vec<Arc<dyn CommandHandler>>, RegistryError> {
        let map = self.map()?.read();
        Ok(map.get(name).cloned().unwrap_or_default())
    }

    /// The handler of `kind` registered for `name`, if any.
    pub fn handler(
        &self,
        name: &str,
        kind: HandlerKind,
    ) -> Result<Option<Arc<dyn CommandHandler>>, RegistryError> {
        let map = self.map()?.read();
        Ok(map
            .get(name)
            .and_then(|handlers| handlers.iter().find(|handler| handler.kind() == kind))
            .cloned())
    }

    pub fn contains(&self, name: &str) -> Result<bool, RegistryError> {
        Ok(self
            .map()?
            .read()
            .get(name)
            .is_some_and(|handlers| !handlers.is_empty()))
    }

    /// Registered command names, sorted.
    pub fn command_names(&self) -> Result<Vec<String>, RegistryError> {
        let mut names: Vec<String> = self.map()?.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn add_pre_hook(&self, kind: HandlerKind, observer: Arc<dyn CommandObserver>) {
        add_hook(&self.pre_hooks, kind, observer);
    }

    pub fn remove_pre_hook(&self, kind: HandlerKind, observer: &Arc<dyn CommandObserver>) -> bool {
        remove_hook(&self.pre_hooks, kind, observer)
    }

    pub fn add_post_hook(&self, kind: HandlerKind, observer: Arc<dyn CommandObserver>) {
        add_hook(&self.post_hooks, kind, observer);
    }

    pub fn remove_post_hook(&self, kind: HandlerKind, observer: &Arc<dyn CommandObserver>) -> bool {
        remove_hook(&self.post_hooks, kind, observer)
    }

    pub(crate) fn notify_pre(&self, kind: HandlerKind, event: &CommandEvent) {
        notify(&self.pre_hooks, "pre", kind, event);
    }

    pub(crate) fn notify_post(&self, kind: HandlerKind, event: &CommandEvent) {
        notify(&self.post_hooks, "post", kind, event);
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("handler_types", &self.table.kinds())
            .field("ready", &self.is_ready())
            .finish()
    }
}

fn insert_unique(map: &mut HandlerMap, name: String, handler: Arc<dyn CommandHandler>) -> bool {
    let handlers = map.entry(name.clone()).or_default();
    let kind = handler.kind();
    if handlers.iter().any(|existing| existing.kind() == kind) {
        debug!(command = %name, handler = %kind, "handler already registered");
        return false;
    }
    debug!(command = %name, handler = %kind, "handler registered");
    handlers.push(handler);
    true
}

fn add_hook(hooks: &RwLock<HookMap>, kind: HandlerKind, observer: Arc<dyn CommandObserver>) {
    hooks.write().entry(kind).or_default().push(observer);
}

fn remove_hook(
    hooks: &RwLock<HookMap>,
    kind: HandlerKind,
    observer: &Arc<dyn CommandObserver>,
) -> bool {
    let mut hooks = hooks.write();
    let Some(observers) = hooks.get_mut(&kind) else {
        return false;
    };
    let before = observers.len();
    observers.retain(|existing| !Arc::ptr_eq(existing, observer));
    let removed = observers.len() != before;
    if observers.is_empty() {
        hooks.remove(&kind);
    }
    removed
}

fn notify(hooks: &RwLock<HookMap>, phase: &'static str, kind: HandlerKind, event: &CommandEvent) {
    let observers = match hooks.read().get(&kind) {
        Some(observers) => observers.clone(),
        None => return,
    };
    for observer in observers {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            observer.observe(kind, event)
        }));
        if outcome.is_err() {
            warn!(handler = %kind, command = %event.name, phase, "command observer panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchScope;
    use crate::error::CommandError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Named {
        kind: HandlerKind,
        names: Vec<&'static str>,
    }

    #[async_trait]
    impl CommandHandler for Named {
        fn kind(&self) -> HandlerKind {
            self.kind
        }

        fn command_names(&self) -> Vec<String> {
            self.names.iter().map(|name| name.to_string()).collect()
        }

        async fn execute(
            &self,
            _event: &CommandEvent,
            _scope: &DispatchScope<'_>,
        ) -> Result<(), CommandError> {
            Ok(())
        }
    }

    fn named(kind: &'static str, names: &[&'static str]) -> Arc<dyn CommandHandler> {
        Arc::new(Named {
            kind: HandlerKind(kind),
            names: names.to_vec(),
        })
    }

    #[test]
    fn empty_table_is_fatal() {
        let err = CommandRegistry::build(HandlerTable::new()).expect_err("must fail");
        assert!(matches!(err, RegistryError::NoHandlers));
    }

    #[test]
    fn failing_factory_is_skipped() {
        let table = HandlerTable::new()
            .with_factory(HandlerKind("broken"), || {
                Err(DiscoveryError::new("broken", "missing display"))
            })
            .with_handler(named("start", &["start"]));
        let registry = CommandRegistry::build(table).expect("not fatal");
        assert_eq!(registry.command_names().expect("ready"), vec!["start".to_owned()]);
    }

    #[test]
    fn no_constructible_handler_is_fatal() {
        let table = HandlerTable::new()
            .with_factory(HandlerKind("broken"), || {
                Err(DiscoveryError::new("broken", "missing display"))
            })
            .with_factory(HandlerKind("headless"), || {
                Err(DiscoveryError::new("headless", "no display"))
            });
        let registry = CommandRegistry::new(table);
        assert!(matches!(registry.ensure_ready(), Err(RegistryError::NoHandlers)));
        assert!(!registry.is_ready());
    }

    #[test]
    fn discovery_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let table = HandlerTable::new().with_factory(HandlerKind("start"), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(named("start", &["start"]))
        });
        let registry = CommandRegistry::new(table);
        assert!(!registry.is_ready());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| registry.ensure_ready().expect("ready"));
            }
        });
        assert!(registry.is_ready());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_is_idempotent_per_kind() {
        let registry =
            CommandRegistry::build(HandlerTable::new().with_handler(named("start", &["start"])))
                .expect("registry");
        assert!(!registry
            .register("start", named("start", &["start"]))
            .expect("ready"));
        assert!(registry
            .register("start", named("audit", &["start"]))
            .expect("ready"));
        assert_eq!(registry.handlers_for("start").expect("ready").len(), 2);
        assert!(registry
            .handler("start", HandlerKind("audit"))
            .expect("ready")
            .is_some());
        assert!(registry
            .handler("start", HandlerKind("missing"))
            .expect("ready")
            .is_none());
    }

    #[test]
    fn hooks_are_removed_by_identity() {
        let registry =
            CommandRegistry::build(HandlerTable::new().with_handler(named("start", &["start"])))
                .expect("registry");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let observer: Arc<dyn CommandObserver> =
            Arc::new(move |_kind: HandlerKind, _event: &CommandEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        registry.add_pre_hook(HandlerKind("start"), observer.clone());
        registry.notify_pre(HandlerKind("start"), &CommandEvent::new("start"));
        assert!(registry.remove_pre_hook(HandlerKind("start"), &observer));
        assert!(!registry.remove_pre_hook(HandlerKind("start"), &observer));
        registry.notify_pre(HandlerKind("start"), &CommandEvent::new("start"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
