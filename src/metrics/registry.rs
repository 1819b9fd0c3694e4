use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. The first call installs; later calls share the same
    /// handle, so several gateways in one process (tests) render one registry.
    pub fn install() -> Self {
        let handle = HANDLE.get_or_init(install_recorder).clone();
        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.run_upkeep();
        self.handle.render()
    }
}

fn install_recorder() -> PrometheusHandle {
    let builder = match PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Suffix("_duration_seconds".to_string()),
        LATENCY_BUCKETS,
    ) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("metrics: invalid bucket config, using defaults, error={}", e);
            PrometheusBuilder::new()
        }
    };

    let recorder = builder.build_recorder();
    let handle = recorder.handle();
    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("metrics: a global recorder is already installed, /metrics will be empty");
    }

    describe_metrics();
    handle
}

fn describe_metrics() {
    // request path
    describe_counter!(
        "gateway_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_histogram!(
        "gateway_upstream_request_duration_seconds",
        Unit::Seconds,
        "Upstream request duration (time spent waiting for upstream)"
    );

    // circuit breaker
    describe_counter!(
        "gateway_circuit_breaker_rejected_total",
        Unit::Count,
        "Total calls rejected by an open circuit breaker"
    );
    describe_counter!(
        "gateway_circuit_breaker_transitions_total",
        Unit::Count,
        "Circuit breaker state transitions by target state"
    );

    // upstream health
    describe_counter!(
        "gateway_health_check_total",
        Unit::Count,
        "Total active health check attempts"
    );
    describe_gauge!(
        "gateway_instance_healthy",
        Unit::Count,
        "Instance health from the last probe: 1=healthy 0=unhealthy"
    );

    // connections
    describe_gauge!(
        "gateway_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "gateway_connections_total",
        Unit::Count,
        "Total connections accepted"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        let a = Metrics::install();
        let b = Metrics::install();
        metrics::counter!("gateway_connections_total", "status" => "accepted").increment(1);
        assert!(a.render().contains("gateway_connections_total"));
        assert!(b.render().contains("gateway_connections_total"));
    }
}
