use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Admin API listener (health, readiness, metrics, service snapshot).
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Static topology: every logical service and its instances.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// "round_robin", "least_connections", "weighted".
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
        }
    }
}

fn default_strategy() -> String {
    "round_robin".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Open the circuit once `failures / (failures + successes) * 100` reaches this.
    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold_percent: f64,

    /// How long an open circuit rejects calls before allowing a trial.
    #[serde(default = "default_cb_open_timeout")]
    pub open_timeout_ms: u64,

    /// When `false`, upstream 4xx responses count as breaker successes.
    #[serde(default)]
    pub count_client_errors: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold_percent: default_cb_failure_threshold(),
            open_timeout_ms: default_cb_open_timeout(),
            count_client_errors: false,
        }
    }
}

fn default_cb_failure_threshold() -> f64 {
    50.0
}

fn default_cb_open_timeout() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_hc_path")]
    pub path: String,

    #[serde(default = "default_hc_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_hc_timeout")]
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_hc_path(),
            interval_secs: default_hc_interval(),
            timeout_ms: default_hc_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_hc_path() -> String {
    "/health".to_string()
}

fn default_hc_interval() -> u64 {
    30
}

fn default_hc_timeout() -> u64 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Deadline for a forwarded request to produce a response head.
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_ms: u64,

    /// Reject requests whose Content-Length exceeds this with 413.
    #[serde(default)]
    pub max_body_bytes: Option<u64>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            forward_timeout_ms: default_forward_timeout(),
            max_body_bytes: None,
        }
    }
}

fn default_forward_timeout() -> u64 {
    10_000
}

/// One logical service: a path prefix and its interchangeable instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Inbound path prefix routed to this service, e.g. "/api/tags".
    pub prefix: String,

    /// Forward only the path remainder after `prefix`.
    #[serde(default = "default_true")]
    pub strip_prefix: bool,

    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,

    /// Base URL, e.g. "http://10.0.0.1:8001".
    pub url: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}
