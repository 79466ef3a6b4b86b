//! ---
//! rload_section: "06-remote-transport"
//! rload_subsection: "module"
//! rload_type: "source"
//! rload_scope: "code"
//! rload_description: "HTTP transport between coordinators and remote engines."
//! rload_version: "v0.0.0-prealpha"
//! rload_owner: "tbd"
//! ---
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use rload_common::RemoteConfig;
use rload_engine::{Engine, EngineError, EngineEvent, EngineState, RemoteConnector, StopMode};
use rload_tree::ClonedTree;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::wire::{ConfigureRequest, ErrorBody, EventsResponse, StatusResponse, StopRequest};

/// Local event buffer per remote engine.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid engine address {0:?}")]
    InvalidAddress(String),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("engine at {url} rejected the request ({status}): {}", .body.as_ref().map_or("no details", |body| body.error.as_str()))]
    Rejected {
        url: String,
        status: u16,
        body: Option<ErrorBody>,
    },
    #[error("unexpected response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl From<ClientError> for EngineError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Rejected {
                body: Some(body), ..
            } => body.into_engine_error(),
            other => EngineError::Transport(other.to_string()),
        }
    }
}

/// Base URL of the agent serving `host`, adding `default_port` when the
/// host names none.
pub fn base_url(host: &str, default_port: u16) -> Result<String, ClientError> {
    let host = host.trim();
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(ClientError::InvalidAddress(host.to_owned()));
    }
    if host.starts_with("http://") || host.starts_with("https://") {
        return Ok(host.trim_end_matches('/').to_owned());
    }
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(format!("http://{addr}"));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(format!("http://{}", SocketAddr::new(ip, default_port)));
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && !name.contains(':') => {
            let port: u16 = port
                .parse()
                .map_err(|_| ClientError::InvalidAddress(host.to_owned()))?;
            Ok(format!("http://{name}:{port}"))
        }
        Some(_) => Err(ClientError::InvalidAddress(host.to_owned())),
        None => Ok(format!("http://{host}:{default_port}")),
    }
}

/// Thin JSON-over-HTTP access to one agent.
#[derive(Debug)]
struct EngineApi {
    client: Client,
    base: String,
    timeout: Duration,
}

impl EngineApi {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<Response, ClientError> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| ClientError::Request {
                url: url.to_owned(),
                source,
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.json::<ErrorBody>().await.ok();
        Err(ClientError::Rejected {
            url: url.to_owned(),
            status: status.as_u16(),
            body,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path);
        let response = self.send(&url, self.client.get(&url)).await?;
        response
            .json::<T>()
            .await
            .map_err(|source| ClientError::Decode { url, source })
    }

    async fn post<B: Serialize>(&self, path: &str, body: Option<&B>) -> Result<(), ClientError> {
        let url = self.url(path);
        let mut request = self.client.post(&url);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(&url, request).await.map(|_| ())
    }

    async fn post_empty(&self, path: &str) -> Result<(), ClientError> {
        self.post::<()>(path, None).await
    }
}

/// An engine living behind an agent, driven over HTTP.
#[derive(Debug)]
pub struct HttpRemoteEngine {
    host: String,
    api: Arc<EngineApi>,
    events: broadcast::Sender<EngineEvent>,
    poller: JoinHandle<()>,
}

impl HttpRemoteEngine {
    pub fn base_url(&self) -> &str {
        &self.api.base
    }
}

impl Drop for HttpRemoteEngine {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[async_trait]
impl Engine for HttpRemoteEngine {
    fn host(&self) -> &str {
        &self.host
    }

    async fn configure(&self, tree: ClonedTree) -> Result<(), EngineError> {
        let request = ConfigureRequest {
            tree: tree.into_root(),
        };
        Ok(self.api.post("/engine/configure", Some(&request)).await?)
    }

    async fn run(&self) -> Result<(), EngineError> {
        Ok(self.api.post_empty("/engine/run").await?)
    }

    async fn stop(&self, mode: StopMode) -> Result<(), EngineError> {
        Ok(self
            .api
            .post("/engine/stop", Some(&StopRequest { mode }))
            .await?)
    }

    async fn reset(&self) -> Result<(), EngineError> {
        Ok(self.api.post_empty("/engine/reset").await?)
    }

    async fn exit(&self) -> Result<(), EngineError> {
        Ok(self.api.post_empty("/engine/exit").await?)
    }

    async fn state(&self) -> Result<EngineState, EngineError> {
        let status: StatusResponse = self.api.get("/engine/status").await?;
        Ok(status.state)
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

fn spawn_poller(
    host: String,
    api: Arc<EngineApi>,
    events: broadcast::Sender<EngineEvent>,
    mut cursor: u64,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failing = false;
        loop {
            ticker.tick().await;
            let path = format!("/engine/events?after={cursor}");
            match api.get::<EventsResponse>(&path).await {
                Ok(batch) => {
                    if failing {
                        info!(host = %host, "remote event polling recovered");
                        failing = false;
                    }
                    cursor = batch.next;
                    for event in batch.events {
                        let _ = events.send(event);
                    }
                }
                Err(err) => {
                    if !failing {
                        warn!(host = %host, error = %err, "remote event polling failed");
                        failing = true;
                    }
                }
            }
        }
    })
}

/// [`RemoteConnector`] reaching agents over HTTP.
pub struct HttpConnector {
    client: Client,
    config: Arc<RwLock<RemoteConfig>>,
}

impl HttpConnector {
    pub fn new(config: Arc<RwLock<RemoteConfig>>) -> Result<Self, ClientError> {
        let client = Client::builder()
            .build()
            .map_err(|source| ClientError::Request {
                url: String::from("<client>"),
                source,
            })?;
        Ok(Self { client, config })
    }

    /// Connect and return the concrete engine type.
    pub async fn connect_http(&self, host: &str) -> Result<HttpRemoteEngine, ClientError> {
        let (port, timeout, poll_interval) = {
            let config = self.config.read();
            (config.port, config.timeout, config.event_poll_interval)
        };
        let api = Arc::new(EngineApi {
            client: self.client.clone(),
            base: base_url(host, port)?,
            timeout,
        });
        let status: StatusResponse = api.get("/engine/status").await?;
        debug!(host, base = %api.base, state = %status.state, "remote engine reachable");

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let poller = spawn_poller(
            host.to_owned(),
            api.clone(),
            events.clone(),
            status.last_event,
            poll_interval,
        );
        Ok(HttpRemoteEngine {
            host: host.to_owned(),
            api,
            events,
            poller,
        })
    }
}

#[async_trait]
impl RemoteConnector for HttpConnector {
    async fn connect(&self, host: &str) -> Result<Arc<dyn Engine>, EngineError> {
        let engine = self.connect_http(host).await?;
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_added_to_bare_hosts() {
        assert_eq!(base_url("10.0.0.1", 1099).expect("ip"), "http://10.0.0.1:1099");
        assert_eq!(
            base_url(" engine-a ", 1099).expect("name"),
            "http://engine-a:1099"
        );
        assert_eq!(base_url("::1", 1099).expect("v6"), "http://[::1]:1099");
    }

    #[test]
    fn explicit_ports_and_urls_are_kept() {
        assert_eq!(
            base_url("10.0.0.2:2099", 1099).expect("ip and port"),
            "http://10.0.0.2:2099"
        );
        assert_eq!(
            base_url("engine-b:8080", 1099).expect("name and port"),
            "http://engine-b:8080"
        );
        assert_eq!(
            base_url("http://engine-c:7000/", 1099).expect("url"),
            "http://engine-c:7000"
        );
    }

    #[test]
    fn malformed_hosts_are_rejected() {
        assert!(matches!(
            base_url("engine:port", 1099),
            Err(ClientError::InvalidAddress(_))
        ));
        assert!(base_url("", 1099).is_err());
        assert!(base_url("two words", 1099).is_err());
    }

    #[test]
    fn agent_rejections_map_back_to_engine_errors() {
        let err = ClientError::Rejected {
            url: "http://a/engine/run".into(),
            status: 409,
            body: Some(ErrorBody::from(&EngineError::NotConfigured)),
        };
        assert_eq!(EngineError::from(err), EngineError::NotConfigured);

        let bare = ClientError::Rejected {
            url: "http://a/engine/run".into(),
            status: 500,
            body: None,
        };
        assert!(matches!(EngineError::from(bare), EngineError::Transport(_)));
    }
}
