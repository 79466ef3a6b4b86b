//! ---
//! rload_section: "06-remote-transport"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "HTTP transport between coordinators and remote engines."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use rload_engine::{Engine, EngineError, EngineEvent};
use rload_tree::TreeCloner;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::wire::{
    ConfigureRequest, ErrorBody, EventsQuery, EventsResponse, StatusResponse, StopRequest,
};

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Bounded, sequenced record of engine events served to pollers.
#[derive(Debug)]
struct EventLog {
    capacity: usize,
    last: u64,
    entries: VecDeque<(u64, EngineEvent)>,
}

impl EventLog {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            last: 0,
            entries: VecDeque::new(),
        }
    }

    fn push(&mut self, event: EngineEvent) {
        self.last += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((self.last, event));
    }

    /// A cursor beyond the newest event means the poller saw an earlier
    /// agent process, so everything retained is returned.
    fn since(&self, after: u64) -> EventsResponse {
        let after = if after > self.last { 0 } else { after };
        EventsResponse {
            next: self.last,
            events: self
                .entries
                .iter()
                .filter(|(seq, _)| *seq > after)
                .map(|(_, event)| event.clone())
                .collect(),
        }
    }
}

struct AgentState {
    engine: Arc<dyn Engine>,
    log: Arc<Mutex<EventLog>>,
    exit: watch::Sender<bool>,
}

/// Builder used to configure and spawn an engine agent.
pub struct EngineAgentBuilder {
    listen: SocketAddr,
    engine: Arc<dyn Engine>,
    event_capacity: usize,
}

impl EngineAgentBuilder {
    pub fn new(listen: SocketAddr, engine: Arc<dyn Engine>) -> Self {
        Self {
            listen,
            engine,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Number of events retained for pollers.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Bind the listener and serve until [`AgentHandle::shutdown`].
    pub async fn spawn(self) -> anyhow::Result<AgentHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, host = %self.engine.host(), "engine agent listening");

        let log = Arc::new(Mutex::new(EventLog::new(self.event_capacity)));
        let recorder = spawn_recorder(self.engine.subscribe(), log.clone());
        let (exit_tx, exit_rx) = watch::channel(false);
        let state = AgentState {
            engine: self.engine,
            log,
            exit: exit_tx,
        };
        let router = Router::new()
            .route("/engine/status", get(get_status))
            .route("/engine/events", get(get_events))
            .route("/engine/configure", post(post_configure))
            .route("/engine/run", post(post_run))
            .route("/engine/stop", post(post_stop))
            .route("/engine/reset", post(post_reset))
            .route("/engine/exit", post(post_exit))
            .with_state(Arc::new(state));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "engine agent exited with error");
            }
        });

        Ok(AgentHandle {
            address: local_addr,
            task,
            recorder,
            shutdown: shutdown_tx,
            exit: exit_rx,
        })
    }
}

/// Handle returned from [`EngineAgentBuilder::spawn`].
pub struct AgentHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    recorder: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    exit: watch::Receiver<bool>,
}

impl AgentHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Resolves once a coordinator has asked the engine to exit.
    pub async fn exit_requested(&self) {
        let mut exit = self.exit.clone();
        if exit.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_exit_requested(&self) -> bool {
        *self.exit.borrow()
    }

    /// Request graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.recorder.abort();
        match self.task.await {
            Ok(()) => Ok(()),
            Err(join) => Err(anyhow::anyhow!(join)),
        }
    }
}

fn spawn_recorder(
    mut events: tokio::sync::broadcast::Receiver<EngineEvent>,
    log: Arc<Mutex<EventLog>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log.lock().push(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "engine events dropped before recording");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Engine rejection rendered as a JSON error body.
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            EngineError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::NotConfigured | EngineError::AlreadyRunning | EngineError::Terminated => {
                StatusCode::CONFLICT
            }
            EngineError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        debug!(status = %status, error = %self.0, "engine request rejected");
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

type ApiResult = Result<StatusCode, ApiError>;

async fn get_status(
    State(state): State<Arc<AgentState>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let engine_state = state.engine.state().await?;
    Ok(Json(StatusResponse {
        host: state.engine.host().to_owned(),
        state: engine_state,
        last_event: state.log.lock().last,
    }))
}

async fn get_events(
    State(state): State<Arc<AgentState>>,
    Query(query): Query<EventsQuery>,
) -> Json<EventsResponse> {
    Json(state.log.lock().since(query.after))
}

async fn post_configure(
    State(state): State<Arc<AgentState>>,
    Json(request): Json<ConfigureRequest>,
) -> ApiResult {
    let tree = TreeCloner::new()
        .clone_tree(&request.tree)
        .map_err(EngineError::from)?;
    state.engine.configure(tree).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_run(State(state): State<Arc<AgentState>>) -> ApiResult {
    state.engine.run().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_stop(
    State(state): State<Arc<AgentState>>,
    Json(request): Json<StopRequest>,
) -> ApiResult {
    state.engine.stop(request.mode).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_reset(State(state): State<Arc<AgentState>>) -> ApiResult {
    state.engine.reset().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_exit(State(state): State<Arc<AgentState>>) -> ApiResult {
    state.engine.exit().await?;
    let _ = state.exit.send(true);
    info!(host = %state.engine.host(), "exit requested by coordinator");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rload_engine::EngineEventKind;

    fn event(kind: EngineEventKind) -> EngineEvent {
        EngineEvent::now("agent", kind)
    }

    #[test]
    fn log_returns_events_after_cursor() {
        let mut log = EventLog::new(8);
        log.push(event(EngineEventKind::TestStarted));
        log.push(event(EngineEventKind::TestEnded));

        let all = log.since(0);
        assert_eq!(all.next, 2);
        assert_eq!(all.events.len(), 2);

        let tail = log.since(1);
        assert_eq!(tail.events.len(), 1);
        assert_eq!(tail.events[0].kind, EngineEventKind::TestEnded);
        assert!(log.since(2).events.is_empty());
    }

    #[test]
    fn log_drops_oldest_beyond_capacity() {
        let mut log = EventLog::new(2);
        for _ in 0..3 {
            log.push(event(EngineEventKind::TestStarted));
        }
        let all = log.since(0);
        assert_eq!(all.next, 3);
        assert_eq!(all.events.len(), 2);
    }

    #[test]
    fn stale_cursor_restarts_from_retained_events() {
        let mut log = EventLog::new(4);
        log.push(event(EngineEventKind::TestStarted));
        assert_eq!(log.since(40).events.len(), 1);
    }
}
