use crate::config::HealthCheckConfig;
use crate::upstream::loadbalance::ServiceInstance;
use crate::upstream::registry::LogicalService;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of the most recent probe of one instance. Replaced wholesale on
/// every probe.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthRecord {
    pub healthy: bool,
    pub last_check: SystemTime,
    pub last_response_time_ms: u64,
    pub last_error: Option<String>,
}

/// Probe timing and target, resolved from `HealthCheckConfig`.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl From<&HealthCheckConfig> for ProbeSettings {
    fn from(cfg: &HealthCheckConfig) -> Self {
        Self {
            path: cfg.path.clone(),
            interval: Duration::from_secs(cfg.interval_secs),
            timeout: Duration::from_millis(cfg.timeout_ms),
        }
    }
}

/// Build a shared HTTP client for health checks.
pub fn build_health_check_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .no_proxy()
        .build()
}

/// Issue one bounded GET to `<instance.url><path>`. Only the status code
/// matters: any 2xx is healthy, everything else (including timeout and
/// transport errors) is unhealthy with the reason recorded.
pub async fn probe(
    client: &reqwest::Client,
    instance: &ServiceInstance,
    path: &str,
    timeout: Duration,
) -> HealthRecord {
    let url = format!("{}{}", instance.url(), path);
    let start = Instant::now();

    let result = client.get(&url).timeout(timeout).send().await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let (healthy, last_error) = match result {
        Ok(resp) if resp.status().is_success() => (true, None),
        Ok(resp) => (
            false,
            Some(format!("unhealthy status {}", resp.status().as_u16())),
        ),
        Err(e) if e.is_timeout() => (
            false,
            Some(format!("timed out after {}ms", timeout.as_millis())),
        ),
        Err(e) => (false, Some(e.to_string())),
    };

    HealthRecord {
        healthy,
        last_check: SystemTime::now(),
        last_response_time_ms: elapsed_ms,
        last_error,
    }
}

/// Cancellable handle for one service's probe loop.
pub struct ProberHandle {
    service: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProberHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop, abort in-flight probes and wait for the task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(
                "health: prober task ended abnormally, service={}, error={}",
                self.service, e
            );
        }
    }
}

/// Instance ids of a service with a check currently running.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    /// Claim `id`, or `None` when a check for it is already running.
    fn try_claim(&self, id: &str) -> Option<InFlightSlot> {
        let mut ids = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !ids.insert(id.to_string()) {
            return None;
        }
        Some(InFlightSlot {
            ids: self.0.clone(),
            id: id.to_string(),
        })
    }
}

/// Released on drop, so a check task that panics or is aborted still frees
/// its instance for the next tick.
struct InFlightSlot {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

/// Start the recurring probe loop for `service`.
///
/// Each tick launches at most one probe per instance. An instance whose
/// previous probe is still running is skipped for that tick, so a slow
/// upstream never overlaps with itself and never delays the others.
pub fn spawn_prober(
    service: Arc<LogicalService>,
    client: reqwest::Client,
    settings: ProbeSettings,
) -> ProberHandle {
    let cancel = CancellationToken::new();
    let name = service.name().to_string();

    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            info!(
                "health: prober starting, service={}, instances={}, interval={}, path={}",
                service.name(),
                service.instances().len(),
                humantime::format_duration(settings.interval),
                settings.path
            );

            let mut ticker = tokio::time::interval(settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut probes: JoinSet<()> = JoinSet::new();
            let in_flight = InFlight::default();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for instance in service.instances() {
                            let Some(slot) = in_flight.try_claim(instance.id()) else {
                                debug!(
                                    "health: previous probe still running, service={}, instance={}",
                                    service.name(),
                                    instance.id()
                                );
                                continue;
                            };
                            let client = client.clone();
                            let service = service.clone();
                            let instance = instance.clone();
                            let settings = settings.clone();
                            probes.spawn(async move {
                                let _slot = slot;
                                check_one_instance(&client, &service, &instance, &settings).await;
                            });
                        }
                    }
                    Some(joined) = probes.join_next(), if !probes.is_empty() => {
                        if let Err(e) = joined {
                            warn!("health: probe task failed, service={}, error={}", service.name(), e);
                        }
                    }
                }
            }

            probes.shutdown().await;
            info!("health: prober stopped, service={}", service.name());
        }
    });

    ProberHandle {
        service: name,
        cancel,
        task,
    }
}

async fn check_one_instance(
    client: &reqwest::Client,
    service: &LogicalService,
    instance: &ServiceInstance,
    settings: &ProbeSettings,
) {
    let record = probe(client, instance, &settings.path, settings.timeout).await;
    let result = if record.healthy { "healthy" } else { "unhealthy" };

    metrics::counter!(
        "gateway_health_check_total",
        "service" => service.name().to_owned(),
        "instance" => instance.id().to_owned(),
        "result" => result,
    )
    .increment(1);

    if record.healthy {
        debug!(
            "health: check passed, service={}, instance={}, latency_ms={}",
            service.name(),
            instance.id(),
            record.last_response_time_ms
        );
    } else {
        warn!(
            "health: check failed, service={}, instance={}, error={}",
            service.name(),
            instance.id(),
            record.last_error.as_deref().unwrap_or("unknown")
        );
    }

    service.record_health(instance.id(), record);
}
