//! ---
//! rload_section: "04-command-dispatch"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Command registry, serialized dispatcher and user reporting."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rload_command::{
    CollectingReporter, CommandError, CommandEvent, CommandHandler, CommandObserver,
    CommandRegistry, DispatchError, DispatchOutcome, DispatchScope, Dispatcher, DispatcherHandle,
    HandlerKind, HandlerTable,
};
use rload_common::DispatcherConfig;

enum Behaviour {
    Succeed,
    Fail,
    Refuse,
    Panic,
    Nest(&'static str),
    Slow(Duration),
}

struct ScriptedHandler {
    kind: HandlerKind,
    commands: Vec<&'static str>,
    behaviour: Behaviour,
    calls: Arc<AtomicUsize>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl ScriptedHandler {
    fn new(kind: &'static str, command: &'static str, behaviour: Behaviour) -> Self {
        Self {
            kind: HandlerKind(kind),
            commands: vec![command],
            behaviour,
            calls: Arc::new(AtomicUsize::new(0)),
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn journal(mut self, journal: &Arc<Mutex<Vec<String>>>) -> Self {
        self.journal = journal.clone();
        self
    }
}

#[async_trait]
impl CommandHandler for ScriptedHandler {
    fn kind(&self) -> HandlerKind {
        self.kind
    }

    fn command_names(&self) -> Vec<String> {
        self.commands.iter().map(|name| name.to_string()).collect()
    }

    async fn execute(
        &self,
        event: &CommandEvent,
        scope: &DispatchScope<'_>,
    ) -> Result<(), CommandError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.journal.lock().push(format!("{}:begin", event.name));
        let result = match &self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::Fail => Err(anyhow::anyhow!("database exploded").into()),
            Behaviour::Refuse => Err(CommandError::user_action_caused_by(
                "a run is already in progress",
                "engine local is running",
            )),
            Behaviour::Panic => panic!("handler blew up"),
            Behaviour::Nest(next) => {
                let report = scope
                    .dispatch_now(CommandEvent::new(*next))
                    .await
                    .map_err(anyhow::Error::from)?;
                self.journal.lock().push(format!("nested:{}", report.command));
                Ok(())
            }
            Behaviour::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(())
            }
        };
        self.journal.lock().push(format!("{}:end", event.name));
        result
    }
}

fn spawn(
    handlers: Vec<Arc<dyn CommandHandler>>,
    config: DispatcherConfig,
) -> (DispatcherHandle, Arc<CollectingReporter>, Arc<CommandRegistry>) {
    let table = handlers
        .into_iter()
        .fold(HandlerTable::new(), |table, handler| table.with_handler(handler));
    let registry = CommandRegistry::build(table).expect("registry");
    let reporter = Arc::new(CollectingReporter::new());
    let handle = Dispatcher::new(registry.clone(), reporter.clone(), &config).spawn(&config);
    (handle, reporter, registry)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_handler_does_not_stop_siblings() {
    let failing = Arc::new(ScriptedHandler::new("failing", "start", Behaviour::Fail));
    let healthy = Arc::new(ScriptedHandler::new("healthy", "start", Behaviour::Succeed));
    let healthy_calls = healthy.calls.clone();
    let (handle, reporter, _) =
        spawn(vec![failing, healthy], DispatcherConfig::default());

    let report = handle
        .dispatch_now(CommandEvent::new("start"))
        .await
        .expect("dispatch");

    assert_eq!(healthy_calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.invoked().len(), 2);
    assert_eq!(report.failures().len(), 1);
    let failure = &report.failures()[0];
    assert_eq!(failure.kind, HandlerKind("failing"));
    assert!(!failure.user_action);
    assert_eq!(
        reporter.errors(),
        vec!["Error processing start - see log file for details".to_owned()]
    );
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_handler_is_isolated() {
    let panicking = Arc::new(ScriptedHandler::new("panicking", "start", Behaviour::Panic));
    let healthy = Arc::new(ScriptedHandler::new("healthy", "start", Behaviour::Succeed));
    let healthy_calls = healthy.calls.clone();
    let (handle, _, _) = spawn(vec![panicking, healthy], DispatcherConfig::default());

    let report = handle
        .dispatch_now(CommandEvent::new("start"))
        .await
        .expect("dispatch survives panic");
    assert!(report.failures()[0].panicked);
    assert_eq!(healthy_calls.load(Ordering::SeqCst), 1);

    let again = handle
        .dispatch_now(CommandEvent::new("start"))
        .await
        .expect("worker still alive");
    assert_eq!(again.invoked().len(), 2);
    handle.shutdown().await;
}

#[tokio::test]
async fn user_action_message_includes_cause() {
    let refusing = Arc::new(ScriptedHandler::new("start", "start", Behaviour::Refuse));
    let (handle, reporter, _) = spawn(vec![refusing], DispatcherConfig::default());

    let report = handle
        .dispatch_now(CommandEvent::new("start"))
        .await
        .expect("dispatch");
    assert!(report.failures()[0].user_action);
    assert_eq!(
        reporter.errors(),
        vec!["a run is already in progress\nengine local is running".to_owned()]
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn unknown_command_is_reported_not_raised() {
    let (handle, reporter, _) = spawn(
        vec![Arc::new(ScriptedHandler::new("start", "start", Behaviour::Succeed))],
        DispatcherConfig::default(),
    );
    let report = handle
        .dispatch_now(CommandEvent::new("print_preview"))
        .await
        .expect("dispatch");
    assert_eq!(report.outcome, DispatchOutcome::NotFound);
    assert_eq!(
        reporter.errors(),
        vec!["Sorry, this feature (print_preview) not yet implemented".to_owned()]
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn post_hook_runs_only_after_success() {
    let ok = Arc::new(ScriptedHandler::new("ok", "start", Behaviour::Succeed));
    let bad = Arc::new(ScriptedHandler::new("bad", "start", Behaviour::Fail));
    let (handle, _, registry) = spawn(vec![ok, bad], DispatcherConfig::default());

    let seen = Arc::new(Mutex::new(Vec::new()));
    for (phase, kind) in [("pre", "ok"), ("post", "ok"), ("pre", "bad"), ("post", "bad")] {
        let seen = seen.clone();
        let observer: Arc<dyn CommandObserver> =
            Arc::new(move |kind: HandlerKind, event: &CommandEvent| {
                seen.lock().push(format!("{phase}:{kind}:{}", event.name));
            });
        if phase == "pre" {
            registry.add_pre_hook(HandlerKind(kind), observer);
        } else {
            registry.add_post_hook(HandlerKind(kind), observer);
        }
    }

    handle
        .dispatch_now(CommandEvent::new("start"))
        .await
        .expect("dispatch");
    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(seen, vec!["post:ok:start", "pre:bad:start", "pre:ok:start"]);
    handle.shutdown().await;
}

#[tokio::test]
async fn nested_dispatch_completes_before_caller_continues() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let exit = Arc::new(ScriptedHandler::new("exit", "exit", Behaviour::Nest("check_dirty")).journal(&journal));
    let dirty = Arc::new(ScriptedHandler::new("dirty", "check_dirty", Behaviour::Succeed).journal(&journal));
    let (handle, _, _) = spawn(vec![exit, dirty], DispatcherConfig::default());

    let report = handle
        .dispatch_now(CommandEvent::new("exit"))
        .await
        .expect("dispatch");
    assert!(report.is_success());
    assert_eq!(
        journal.lock().clone(),
        vec![
            "exit:begin",
            "check_dirty:begin",
            "check_dirty:end",
            "nested:check_dirty",
            "exit:end",
        ]
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn runaway_nesting_is_bounded() {
    let looping = Arc::new(ScriptedHandler::new("loop", "loop", Behaviour::Nest("loop")));
    let calls = looping.calls.clone();
    let config = DispatcherConfig {
        max_nesting: 3,
        ..DispatcherConfig::default()
    };
    let (handle, reporter, _) = spawn(vec![looping], config);

    let report = handle
        .dispatch_now(CommandEvent::new("loop"))
        .await
        .expect("dispatch");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    // Only the innermost handler sees the refusal; outer levels complete.
    assert!(report.is_success());
    assert_eq!(reporter.errors().len(), 1);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commands_never_interleave() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let slow = Arc::new(
        ScriptedHandler::new("slow", "slow", Behaviour::Slow(Duration::from_millis(30))).journal(&journal),
    );
    let fast = Arc::new(ScriptedHandler::new("fast", "fast", Behaviour::Succeed).journal(&journal));
    let (handle, _, _) = spawn(vec![slow, fast], DispatcherConfig::default());

    handle
        .dispatch(CommandEvent::new("slow"))
        .await
        .expect("queued");
    handle
        .dispatch_now(CommandEvent::new("fast"))
        .await
        .expect("dispatch");
    assert_eq!(
        journal.lock().clone(),
        vec!["slow:begin", "slow:end", "fast:begin", "fast:end"]
    );
    handle.shutdown().await;
}

#[tokio::test]
async fn dispatch_after_shutdown_is_closed() {
    let (handle, _, _) = spawn(
        vec![Arc::new(ScriptedHandler::new("start", "start", Behaviour::Succeed))],
        DispatcherConfig::default(),
    );
    handle.shutdown().await;
    let err = handle
        .dispatch_now(CommandEvent::new("start"))
        .await
        .expect_err("worker gone");
    assert_eq!(err, DispatchError::Closed);
}
