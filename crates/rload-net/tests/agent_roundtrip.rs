//! ---
//! rload_section: "06-remote-transport"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "HTTP transport between coordinators and remote engines."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rload_common::{EngineConfig, RemoteConfig};
use rload_engine::{
    Engine, EngineError, EngineEventKind, EngineState, RemoteCoordinator, StandardEngine,
};
use rload_net::{AgentHandle, EngineAgentBuilder, HttpConnector};
use rload_tree::{clone_tree, Category, ConfigNode, Element};

async fn spawn_agent() -> (AgentHandle, StandardEngine) {
    let engine = StandardEngine::new("agent", EngineConfig::default());
    let handle = EngineAgentBuilder::new("127.0.0.1:0".parse().expect("addr"), Arc::new(engine.clone()))
        .spawn()
        .await
        .expect("agent binds");
    (handle, engine)
}

fn remote_config(hosts: &str) -> Arc<RwLock<RemoteConfig>> {
    Arc::new(RwLock::new(RemoteConfig {
        hosts: Some(hosts.to_owned()),
        timeout: Duration::from_secs(2),
        retry_delay: Duration::from_millis(10),
        event_poll_interval: Duration::from_millis(20),
        ..RemoteConfig::default()
    }))
}

fn plan() -> ConfigNode {
    ConfigNode::new("plan", Category::TestPlan).with_child(
        ConfigNode::new("users", Category::ThreadGroup)
            .with_element(
                Element::new("thread_group")
                    .with("num_threads", 2i64)
                    .with("loops", 3i64),
            )
            .with_child(ConfigNode::new("home", Category::Sampler)),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_engine_drives_agent_engine() {
    rload_logging::init();
    let (agent, local) = spawn_agent().await;
    let host = agent.local_addr().to_string();
    let connector = HttpConnector::new(remote_config(&host)).expect("client");
    let remote = connector.connect_http(&host).await.expect("connect");

    assert_eq!(remote.host(), host);
    assert_eq!(remote.state().await, Ok(EngineState::Idle));
    assert_eq!(remote.run().await, Err(EngineError::NotConfigured));

    let mut events = remote.subscribe();
    remote
        .configure(clone_tree(&plan(), None).expect("clone"))
        .await
        .expect("configure");
    assert_eq!(local.current_state(), EngineState::Configured);
    remote.run().await.expect("run");

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("events flow");
            if event.kind == EngineEventKind::TestEnded {
                break;
            }
        }
    })
    .await
    .expect("run ends");
    assert_eq!(local.stats().samples, 6);

    remote.exit().await.expect("exit");
    assert!(agent.is_exit_requested());
    assert_eq!(local.current_state(), EngineState::Terminated);
    agent.shutdown().await.expect("agent stops");
}

#[tokio::test]
async fn configuration_errors_cross_the_wire() {
    let (agent, _local) = spawn_agent().await;
    let host = agent.local_addr().to_string();
    let connector = HttpConnector::new(remote_config(&host)).expect("client");
    let remote = connector.connect_http(&host).await.expect("connect");

    let empty = ConfigNode::new("plan", Category::TestPlan);
    let err = remote
        .configure(clone_tree(&empty, None).expect("clone"))
        .await
        .expect_err("no thread group");
    assert!(matches!(err, EngineError::Configuration(reason) if reason.contains("no thread group")));
    agent.shutdown().await.expect("agent stops");
}

#[tokio::test]
async fn out_of_range_ramp_up_is_rejected_not_crashed() {
    let (agent, engine) = spawn_agent().await;
    let host = agent.local_addr().to_string();
    let connector = HttpConnector::new(remote_config(&host)).expect("client");
    let remote = connector.connect_http(&host).await.expect("connect");

    let oversized = ConfigNode::new("plan", Category::TestPlan).with_child(
        ConfigNode::new("users", Category::ThreadGroup)
            .with_element(Element::new("thread_group").with("ramp_up", 1e30)),
    );
    let err = remote
        .configure(clone_tree(&oversized, None).expect("clone"))
        .await
        .expect_err("ramp_up too large");
    assert!(matches!(err, EngineError::Configuration(reason) if reason.contains("ramp_up")));

    remote
        .configure(clone_tree(&plan(), None).expect("clone"))
        .await
        .expect("agent still serves");
    assert_eq!(engine.current_state(), EngineState::Configured);
    agent.shutdown().await.expect("agent stops");
}

#[tokio::test]
async fn refused_connection_is_a_transport_error() {
    let (agent, _local) = spawn_agent().await;
    let host = agent.local_addr().to_string();
    agent.shutdown().await.expect("agent stops");

    let connector = HttpConnector::new(remote_config(&host)).expect("client");
    let err = connector.connect_http(&host).await.expect_err("nothing listens");
    assert!(matches!(EngineError::from(err), EngineError::Transport(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coordinator_runs_plan_on_two_agents() {
    let (first, first_engine) = spawn_agent().await;
    let (second, second_engine) = spawn_agent().await;
    let hosts = format!("{},{}", first.local_addr(), second.local_addr());
    let config = remote_config(&hosts);
    let connector = Arc::new(HttpConnector::new(config.clone()).expect("client"));
    let mut coordinator = RemoteCoordinator::new(connector, config, 64);
    let mut events = coordinator.subscribe();

    let (init, start) = coordinator.launch_all(&plan(), false).await;
    assert!(init.is_clean(), "{:?}", init.failure_message());
    assert!(start.is_clean(), "{:?}", start.failure_message());

    let expected = [first.local_addr().to_string(), second.local_addr().to_string()];
    let mut ended = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while ended.len() < 2 {
            let event = events.recv().await.expect("merged stream open");
            assert!(expected.contains(&event.host), "unexpected host {}", event.host);
            if event.kind == EngineEventKind::TestEnded {
                ended.push(event.host);
            }
        }
    })
    .await
    .expect("both agents finish");
    assert!(coordinator.status().all_ended());

    let exit = coordinator.exit_all().await;
    assert_eq!(exit.succeeded.len(), 2);
    assert_eq!(coordinator.handle_count(), 0);
    assert_eq!(first_engine.current_state(), EngineState::Terminated);
    assert_eq!(second_engine.current_state(), EngineState::Terminated);

    first.shutdown().await.expect("first stops");
    second.shutdown().await.expect("second stops");
}
