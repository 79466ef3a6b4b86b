//! ---
//! rload_section: "05-run-lifecycle"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "Engines, local run controller and remote engine coordinator."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rload_common::EngineConfig;
use rload_logging::{log_run_event, LogContext, RunEventOutcome};
use rload_tree::{Category, ClonedTree, ConfigNode, Element, PropertyValue};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineError, EngineEvent, EngineEventKind, EngineState, StopMode};
use crate::remote::REMOTE_LISTENER_KIND;

/// Upper bound on `num_threads` for a single thread group.
pub const MAX_GROUP_THREADS: i64 = 100_000;

/// One sampler invocation handed to a [`Sampler`].
#[derive(Debug, Clone)]
pub struct SamplerCall {
    pub group: String,
    pub thread: String,
    pub iteration: u64,
    pub name: String,
    pub element: Element,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleOutcome {
    pub success: bool,
}

/// Performs the actual protocol work for a sampler node.
#[async_trait]
pub trait Sampler: Send + Sync + 'static {
    async fn sample(&self, call: &SamplerCall) -> SampleOutcome;
}

/// Sampler that succeeds without doing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSampler;

#[async_trait]
impl Sampler for NoopSampler {
    async fn sample(&self, _call: &SamplerCall) -> SampleOutcome {
        tokio::task::yield_now().await;
        SampleOutcome { success: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub runs: u64,
    pub samples: u64,
    pub failures: u64,
    pub active_threads: usize,
}

#[derive(Debug, Default)]
struct Counters {
    runs: AtomicU64,
    samples: AtomicU64,
    failures: AtomicU64,
    active: AtomicUsize,
}

#[derive(Debug, Clone)]
struct Step {
    name: String,
    element: Element,
    delay: Duration,
}

#[derive(Debug, Clone)]
struct GroupPlan {
    name: String,
    threads: usize,
    ramp_up: Duration,
    /// `None` loops until stopped.
    loops: Option<u64>,
    steps: Arc<Vec<Step>>,
}

#[derive(Debug)]
struct TestPlan {
    host: String,
    serialized: bool,
    groups: Vec<GroupPlan>,
}

impl TestPlan {
    fn compile(root: &ConfigNode, default_host: &str) -> Result<Self, EngineError> {
        let serialized = match root.element.get("serialized") {
            None => false,
            Some(PropertyValue::Bool(value)) => *value,
            Some(_) => {
                return Err(EngineError::Configuration(
                    "test plan property serialized must be a boolean".into(),
                ))
            }
        };

        let host = root
            .children
            .iter()
            .filter(|node| node.is(Category::Listener) && node.element.kind == REMOTE_LISTENER_KIND)
            .find_map(|node| node.element.text("host"))
            .unwrap_or(default_host)
            .to_owned();

        let test_delay = direct_timer_delay(root)?;
        let groups = root
            .children
            .iter()
            .filter(|node| node.is(Category::ThreadGroup))
            .map(|group| compile_group(group, test_delay))
            .collect::<Result<Vec<_>, _>>()?;
        if groups.is_empty() {
            return Err(EngineError::Configuration(format!(
                "test plan {} has no thread group",
                root.name
            )));
        }
        Ok(Self {
            host,
            serialized,
            groups,
        })
    }
}

fn compile_group(group: &ConfigNode, inherited: Duration) -> Result<GroupPlan, EngineError> {
    let threads = int_property(group, "num_threads", 1)?;
    if threads < 0 {
        return Err(invalid(group, "num_threads must not be negative"));
    }
    if threads > MAX_GROUP_THREADS {
        return Err(invalid(
            group,
            &format!("num_threads must not exceed {MAX_GROUP_THREADS}"),
        ));
    }
    let ramp_up = match group.element.get("ramp_up") {
        None => 0.0,
        Some(PropertyValue::Int(value)) => *value as f64,
        Some(PropertyValue::Float(value)) => *value,
        Some(PropertyValue::Text(value)) => value
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid(group, "ramp_up must be a number of seconds"))?,
        Some(_) => return Err(invalid(group, "ramp_up must be a number of seconds")),
    };
    if !ramp_up.is_finite() || ramp_up < 0.0 {
        return Err(invalid(group, "ramp_up must not be negative"));
    }
    let ramp_up = Duration::try_from_secs_f64(ramp_up)
        .map_err(|_| invalid(group, "ramp_up is out of range"))?;
    let loops = match int_property(group, "loops", 1)? {
        -1 => None,
        value if value > 0 => Some(value as u64),
        _ => return Err(invalid(group, "loops must be positive or -1")),
    };

    let mut steps = Vec::new();
    collect_steps(group, inherited, &mut steps)?;
    Ok(GroupPlan {
        name: group.name.clone(),
        threads: threads as usize,
        ramp_up,
        loops,
        steps: Arc::new(steps),
    })
}

// Timers apply to every sampler in the container holding them, including nested ones.
fn collect_steps(
    container: &ConfigNode,
    inherited: Duration,
    steps: &mut Vec<Step>,
) -> Result<(), EngineError> {
    let delay = inherited
        .checked_add(direct_timer_delay(container)?)
        .ok_or_else(|| invalid(container, "timer delays are out of range"))?;
    for child in &container.children {
        match child.category {
            Category::Sampler => steps.push(Step {
                name: child.name.clone(),
                element: child.element.clone(),
                delay,
            }),
            Category::Controller => collect_steps(child, delay, steps)?,
            _ => {}
        }
    }
    Ok(())
}

fn direct_timer_delay(container: &ConfigNode) -> Result<Duration, EngineError> {
    let mut total = Duration::ZERO;
    for timer in container.children.iter().filter(|node| node.is(Category::Timer)) {
        let delay = int_property(timer, "delay_ms", 0)?;
        if delay < 0 {
            return Err(invalid(timer, "delay_ms must not be negative"));
        }
        total = total
            .checked_add(Duration::from_millis(delay as u64))
            .ok_or_else(|| invalid(timer, "timer delays are out of range"))?;
    }
    Ok(total)
}

fn int_property(node: &ConfigNode, key: &str, default: i64) -> Result<i64, EngineError> {
    match node.element.get(key) {
        None => Ok(default),
        Some(PropertyValue::Int(value)) => Ok(*value),
        Some(PropertyValue::Text(value)) => value
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(node, &format!("{key} must be an integer"))),
        Some(_) => Err(invalid(node, &format!("{key} must be an integer"))),
    }
}

fn invalid(node: &ConfigNode, reason: &str) -> EngineError {
    EngineError::Configuration(format!("{} {}: {}", node.category, node.name, reason))
}

struct ActiveRun {
    stop: watch::Sender<Option<StopMode>>,
    done: watch::Receiver<bool>,
    threads: Arc<Mutex<Vec<AbortHandle>>>,
}

struct Inner {
    state: EngineState,
    /// State entered once the current run winds down.
    after_run: EngineState,
    tree: Option<ClonedTree>,
    plan: Option<Arc<TestPlan>>,
    run: Option<ActiveRun>,
}

struct EngineCore {
    host: String,
    config: EngineConfig,
    sampler: Arc<dyn Sampler>,
    events: broadcast::Sender<EngineEvent>,
    counters: Counters,
    inner: Mutex<Inner>,
}

impl EngineCore {
    fn emit(&self, host: &str, kind: EngineEventKind) {
        let _ = self.events.send(EngineEvent::now(host, kind));
    }

    fn finish_run(&self, host: &str) {
        let state = {
            let mut inner = self.inner.lock();
            inner.run = None;
            inner.state = inner.after_run;
            inner.after_run = EngineState::Configured;
            if inner.state != EngineState::Configured {
                inner.tree = None;
                inner.plan = None;
            }
            inner.state
        };
        self.emit(host, EngineEventKind::TestEnded);
        let context = LogContext::new().with_host(host);
        log_run_event(Some(&context), "run.ended", "test has ended", RunEventOutcome::Success);
        debug!(host, state = %state, "engine returned from run");
    }
}

/// In-process engine running thread groups as tokio tasks.
#[derive(Clone)]
pub struct StandardEngine {
    core: Arc<EngineCore>,
}

impl StandardEngine {
    pub fn new(host: impl Into<String>, config: EngineConfig) -> Self {
        Self::with_sampler(host, config, Arc::new(NoopSampler))
    }

    pub fn with_sampler(
        host: impl Into<String>,
        config: EngineConfig,
        sampler: Arc<dyn Sampler>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            core: Arc::new(EngineCore {
                host: host.into(),
                config,
                sampler,
                events,
                counters: Counters::default(),
                inner: Mutex::new(Inner {
                    state: EngineState::Idle,
                    after_run: EngineState::Configured,
                    tree: None,
                    plan: None,
                    run: None,
                }),
            }),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let counters = &self.core.counters;
        EngineStats {
            runs: counters.runs.load(Ordering::Relaxed),
            samples: counters.samples.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            active_threads: counters.active.load(Ordering::Relaxed),
        }
    }

    /// Nodes in the configured tree, if any.
    pub fn configured_nodes(&self) -> Option<usize> {
        self.core.inner.lock().tree.as_ref().map(ClonedTree::node_count)
    }

    pub fn current_state(&self) -> EngineState {
        self.core.inner.lock().state
    }

    /// Wait until the current run, if any, has ended.
    pub async fn wait_for_completion(&self) {
        let done = self.core.inner.lock().run.as_ref().map(|run| run.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    fn signal_stop(&self, mode: StopMode, after_run: Option<EngineState>) -> bool {
        let (stop, done, threads) = {
            let mut inner = self.core.inner.lock();
            if let Some(next) = after_run {
                inner.after_run = next;
            }
            let Some(run) = inner.run.as_ref() else {
                return false;
            };
            let parts = (run.stop.clone(), run.done.clone(), run.threads.clone());
            inner.state = EngineState::Stopping;
            parts
        };
        let escalated = stop.send_if_modified(|current| match (*current, mode) {
            (Some(StopMode::Immediate), _) => false,
            (Some(StopMode::Graceful), StopMode::Graceful) => false,
            _ => {
                *current = Some(mode);
                true
            }
        });
        if escalated && mode == StopMode::Immediate {
            self.spawn_reaper(done, threads);
        }
        info!(host = %self.core.host, ?mode, "stop requested");
        true
    }

    fn spawn_reaper(&self, mut done: watch::Receiver<bool>, threads: Arc<Mutex<Vec<AbortHandle>>>) {
        let wait = self.core.config.stop_wait;
        let host = self.core.host.clone();
        tokio::spawn(async move {
            let finished = tokio::time::timeout(wait, done.wait_for(|finished| *finished))
                .await
                .is_ok();
            if finished {
                return;
            }
            let handles: Vec<AbortHandle> = threads.lock().drain(..).collect();
            let stuck = handles.iter().filter(|handle| !handle.is_finished()).count();
            for handle in &handles {
                handle.abort();
            }
            if stuck > 0 {
                error!(host = %host, threads = stuck, wait_secs = wait.as_secs(), "thread won't die; aborting");
            }
        });
    }
}

#[async_trait]
impl Engine for StandardEngine {
    fn host(&self) -> &str {
        &self.core.host
    }

    async fn configure(&self, tree: ClonedTree) -> Result<(), EngineError> {
        let mut inner = self.core.inner.lock();
        match inner.state {
            EngineState::Terminated => return Err(EngineError::Terminated),
            EngineState::Running | EngineState::Stopping => return Err(EngineError::AlreadyRunning),
            EngineState::Idle | EngineState::Configured => {}
        }
        let plan = TestPlan::compile(tree.root(), &self.core.host)?;
        info!(
            host = %plan.host,
            nodes = tree.node_count(),
            groups = plan.groups.len(),
            serialized = plan.serialized,
            "engine configured"
        );
        inner.plan = Some(Arc::new(plan));
        inner.tree = Some(tree);
        inner.state = EngineState::Configured;
        Ok(())
    }

    async fn run(&self) -> Result<(), EngineError> {
        let (plan, stop_rx, done_tx, threads) = {
            let mut inner = self.core.inner.lock();
            match inner.state {
                EngineState::Terminated => return Err(EngineError::Terminated),
                EngineState::Running | EngineState::Stopping => {
                    return Err(EngineError::AlreadyRunning)
                }
                EngineState::Idle => return Err(EngineError::NotConfigured),
                EngineState::Configured => {}
            }
            let plan = inner.plan.clone().ok_or(EngineError::NotConfigured)?;
            let (stop_tx, stop_rx) = watch::channel(None);
            let (done_tx, done_rx) = watch::channel(false);
            let threads = Arc::new(Mutex::new(Vec::new()));
            inner.run = Some(ActiveRun {
                stop: stop_tx,
                done: done_rx,
                threads: threads.clone(),
            });
            inner.state = EngineState::Running;
            inner.after_run = EngineState::Configured;
            (plan, stop_rx, done_tx, threads)
        };
        self.core.counters.runs.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(supervise(self.core.clone(), plan, stop_rx, done_tx, threads));
        Ok(())
    }

    async fn stop(&self, mode: StopMode) -> Result<(), EngineError> {
        if !self.signal_stop(mode, None) {
            debug!(host = %self.core.host, "stop ignored; engine not running");
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), EngineError> {
        if self.current_state() == EngineState::Terminated {
            return Err(EngineError::Terminated);
        }
        if self.signal_stop(StopMode::Immediate, Some(EngineState::Idle)) {
            // Threads are aborted after stop_wait, so this always returns.
            self.wait_for_completion().await;
        } else {
            let mut inner = self.core.inner.lock();
            inner.state = EngineState::Idle;
            inner.tree = None;
            inner.plan = None;
        }
        debug!(host = %self.core.host, "engine reset");
        Ok(())
    }

    async fn exit(&self) -> Result<(), EngineError> {
        if !self.signal_stop(StopMode::Immediate, Some(EngineState::Terminated)) {
            let mut inner = self.core.inner.lock();
            inner.state = EngineState::Terminated;
            inner.tree = None;
            inner.plan = None;
        }
        info!(host = %self.core.host, "engine exiting");
        Ok(())
    }

    async fn state(&self) -> Result<EngineState, EngineError> {
        Ok(self.current_state())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.core.events.subscribe()
    }
}

async fn supervise(
    core: Arc<EngineCore>,
    plan: Arc<TestPlan>,
    stop: watch::Receiver<Option<StopMode>>,
    done: watch::Sender<bool>,
    threads: Arc<Mutex<Vec<AbortHandle>>>,
) {
    let host = plan.host.clone();
    let context = LogContext::new().with_host(&host);
    log_run_event(Some(&context), "run.started", "test started", RunEventOutcome::Success);
    core.emit(&host, EngineEventKind::TestStarted);

    if plan.serialized {
        for (index, group) in plan.groups.iter().enumerate() {
            if stop.borrow().is_some() {
                break;
            }
            run_group(&core, &host, group.clone(), index + 1, stop.clone(), &threads).await;
        }
    } else {
        let mut tasks = Vec::with_capacity(plan.groups.len());
        for (index, group) in plan.groups.iter().enumerate() {
            let core = core.clone();
            let host = host.clone();
            let group = group.clone();
            let stop = stop.clone();
            let threads = threads.clone();
            tasks.push(tokio::spawn(async move {
                run_group(&core, &host, group, index + 1, stop, &threads).await;
            }));
        }
        for task in tasks {
            if let Err(err) = task.await {
                warn!(host = %host, error = %err, "thread group task failed");
            }
        }
    }

    core.finish_run(&host);
    let _ = done.send(true);
}

async fn run_group(
    core: &Arc<EngineCore>,
    host: &str,
    group: GroupPlan,
    group_no: usize,
    mut stop: watch::Receiver<Option<StopMode>>,
    threads: &Arc<Mutex<Vec<AbortHandle>>>,
) {
    core.emit(
        host,
        EngineEventKind::ThreadGroupStarted {
            group: group.name.clone(),
            threads: group.threads,
        },
    );
    info!(host, group = %group.name, threads = group.threads, "thread group started");

    let spacing = if group.threads > 0 {
        group.ramp_up.div_f64(group.threads as f64)
    } else {
        Duration::ZERO
    };
    let mut joins = Vec::new();
    for thread_no in 1..=group.threads {
        if thread_no > 1 && !spacing.is_zero() && wait_or_stop(spacing, &mut stop).await {
            break;
        }
        if stop.borrow().is_some() {
            break;
        }
        let name = format!(
            "{} {} {}-{}",
            core.config.thread_name_prefix, group.name, group_no, thread_no
        );
        let join = tokio::spawn(run_thread(
            core.clone(),
            group.name.clone(),
            name,
            group.steps.clone(),
            group.loops,
            stop.clone(),
        ));
        threads.lock().push(join.abort_handle());
        joins.push(join);
    }

    for join in joins {
        match join.await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {
                warn!(host, group = %group.name, "thread abandoned after stop wait");
            }
            Err(err) => error!(host, group = %group.name, error = %err, "thread panicked"),
        }
    }
    core.emit(
        host,
        EngineEventKind::ThreadGroupFinished {
            group: group.name.clone(),
        },
    );
    info!(host, group = %group.name, "thread group finished");
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn run_thread(
    core: Arc<EngineCore>,
    group: String,
    thread: String,
    steps: Arc<Vec<Step>>,
    loops: Option<u64>,
    mut stop: watch::Receiver<Option<StopMode>>,
) {
    let _active = ActiveGuard::enter(&core.counters.active);
    debug!(thread = %thread, "thread started");
    let mut iteration = 0u64;
    'iterations: while loops.map_or(true, |limit| iteration < limit) {
        if steps.is_empty() {
            if loops.is_none() {
                stop_signalled(&mut stop, false).await;
            }
            break;
        }
        for step in steps.iter() {
            if stop.borrow().is_some() {
                break 'iterations;
            }
            if !step.delay.is_zero() && wait_or_stop(step.delay, &mut stop).await {
                break 'iterations;
            }
            let call = SamplerCall {
                group: group.clone(),
                thread: thread.clone(),
                iteration,
                name: step.name.clone(),
                element: step.element.clone(),
            };
            let outcome = tokio::select! {
                outcome = core.sampler.sample(&call) => outcome,
                _ = stop_signalled(&mut stop, true) => break 'iterations,
            };
            core.counters.samples.fetch_add(1, Ordering::Relaxed);
            if !outcome.success {
                core.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        iteration += 1;
    }
    debug!(thread = %thread, iterations = iteration, "thread finished");
}

/// Sleep for `delay`; true when a stop arrived first.
async fn wait_or_stop(delay: Duration, stop: &mut watch::Receiver<Option<StopMode>>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop_signalled(stop, false) => true,
    }
}

async fn stop_signalled(stop: &mut watch::Receiver<Option<StopMode>>, immediate_only: bool) {
    let signalled = stop
        .wait_for(|mode| match mode {
            Some(StopMode::Immediate) => true,
            Some(StopMode::Graceful) => !immediate_only,
            None => false,
        })
        .await
        .is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}
