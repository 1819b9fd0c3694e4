use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::proxy::BoxBody;
use crate::routing::PrefixRouter;
use crate::upstream::{CircuitBreakerRegistry, ServiceRegistry};
use anyhow::Result;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Pooled forwarding client. Wraps an `HttpsConnector` so both `http://` and
/// `https://` instance URLs work; HTTP/2 is negotiated via ALPN.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const POOL_MAX_IDLE_PER_HOST: usize = 32;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared gateway state, cheaply cloneable.
///
/// The router is the composition point: it holds the registry and the
/// breakers side by side, and neither knows about the other.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub metrics: Metrics,
    pub router: Arc<PrefixRouter>,
    pub registry: Arc<ServiceRegistry>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub client: UpstreamClient,
}

impl GatewayState {
    /// Build every component from `config`. Starts the health probers, so
    /// this must run inside a tokio runtime.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let metrics = Metrics::install();
        let registry = ServiceRegistry::from_config(&config)?;
        let breakers = CircuitBreakerRegistry::with_keys(
            config.circuit_breaker.clone(),
            registry.breaker_keys(),
        );
        let router = PrefixRouter::new(&config.services);

        info!(
            "server: state built, services={}, instances={}, breakers={}, strategy={}",
            registry.services().len(),
            config.total_instance_count(),
            breakers.len(),
            registry.strategy().as_str()
        );

        Ok(Self {
            config: Arc::new(config),
            metrics,
            router: Arc::new(router),
            registry: Arc::new(registry),
            breakers: Arc::new(breakers),
            client: build_upstream_client(),
        })
    }

    /// Stop background work owned by the state.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

fn build_upstream_client() -> UpstreamClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(POOL_IDLE_TIMEOUT));
    http.set_connect_timeout(Some(CONNECT_TIMEOUT));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(https)
}
