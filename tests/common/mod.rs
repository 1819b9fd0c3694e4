//! Shared harness for integration tests: in-process mock instances and a
//! gateway bound to ephemeral ports.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use insightbridge_gateway::config::{GatewayConfig, InstanceConfig, ServiceConfig};
use insightbridge_gateway::server::{self, GatewayState};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What a mock instance saw for one request.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

/// A mock instance. `hits` counts every non-`/health` request.
pub struct MockInstance {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicU32>,
}

#[allow(dead_code)]
impl MockInstance {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Start an instance that answers `GET /health` with `health_status` and
/// every other request with `handler`.
pub async fn start_instance<F>(health_status: u16, handler: F) -> MockInstance
where
    F: Fn(SeenRequest) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let handler = Arc::new(handler);

    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    let counter = counter.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
                        let (status, text) = if parts.uri.path() == "/health" {
                            (health_status, r#"{"status":"ok"}"#.to_string())
                        } else {
                            counter.fetch_add(1, Ordering::SeqCst);
                            handler(SeenRequest {
                                method: parts.method.to_string(),
                                path: parts.uri.path().to_string(),
                                query: parts.uri.query().map(str::to_string),
                                headers: parts.headers,
                                body,
                            })
                        };
                        let resp = Response::builder()
                            .status(status)
                            .header("content-type", "application/json")
                            .body(Full::new(Bytes::from(text)))
                            .unwrap();
                        Ok::<_, Infallible>(resp)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    MockInstance { addr, hits }
}

/// An instance that accepts connections and never responds.
#[allow(dead_code)]
pub async fn start_silent_instance() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// An address nothing listens on.
#[allow(dead_code)]
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn service(name: &str, prefix: &str, instances: &[(&str, String)]) -> ServiceConfig {
    ServiceConfig {
        name: name.into(),
        prefix: prefix.into(),
        strip_prefix: true,
        instances: instances
            .iter()
            .map(|(id, url)| InstanceConfig {
                id: (*id).into(),
                url: url.clone(),
                weight: 1,
            })
            .collect(),
    }
}

/// Config with probing off and a long open timeout; tests flip what they need.
pub fn base_config(services: Vec<ServiceConfig>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.health_check.enabled = false;
    config.circuit_breaker.open_timeout_ms = 60_000;
    config.proxy.forward_timeout_ms = 2_000;
    config.services = services;
    config
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub state: GatewayState,
    pub client: reqwest::Client,
    shutdown: CancellationToken,
    proxy: JoinHandle<anyhow::Result<()>>,
}

#[allow(dead_code)]
impl TestGateway {
    pub async fn start(config: GatewayConfig) -> Self {
        config.validate().unwrap();
        let state = GatewayState::new(config).unwrap();
        let shutdown = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let admin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let admin_addr = admin_listener.local_addr().unwrap();

        let proxy = tokio::spawn(server::serve_proxy(
            listener,
            state.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(server::serve_admin(
            admin_listener,
            state.clone(),
            shutdown.clone(),
        ));

        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr,
            admin_addr,
            state,
            client,
            shutdown,
            proxy,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn admin_url(&self, path: &str) -> String {
        format!("http://{}{}", self.admin_addr, path)
    }

    pub async fn get(&self, path: &str) -> (u16, String) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.text().await.unwrap())
    }

    /// Poll `cond` every 20ms for up to 5s.
    pub async fn wait_until<F: Fn(&GatewayState) -> bool>(&self, cond: F) -> bool {
        for _ in 0..250 {
            if cond(&self.state) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.proxy.await.unwrap().unwrap();
        self.state.shutdown().await;
    }
}
