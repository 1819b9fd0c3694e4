use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::upstream::health::{
    build_health_check_client, spawn_prober, HealthRecord, ProbeSettings, ProberHandle,
};
use crate::upstream::loadbalance::{LoadBalancer, RequestGuard, ServiceInstance, Strategy};
use arc_swap::ArcSwapOption;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Circuit-breaker key for one instance of one service.
pub fn breaker_key(service: &str, instance_id: &str) -> String {
    format!("{}-{}", service, instance_id)
}

/// A named group of interchangeable instances with its own balancer.
///
/// The instance list is fixed at registration. Health records start empty,
/// which counts as healthy until the first probe lands.
pub struct LogicalService {
    name: String,
    instances: Vec<ServiceInstance>,
    lb: LoadBalancer,
    health: HashMap<String, ArcSwapOption<HealthRecord>>,
}

impl LogicalService {
    pub fn new(name: &str, instances: Vec<ServiceInstance>, strategy: Strategy) -> Self {
        let health = instances
            .iter()
            .map(|i| (i.id().to_string(), ArcSwapOption::empty()))
            .collect();
        Self {
            name: name.to_string(),
            instances,
            lb: LoadBalancer::new(strategy),
            health,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instances(&self) -> &[ServiceInstance] {
        &self.instances
    }

    pub fn strategy(&self) -> Strategy {
        self.lb.strategy()
    }

    /// Latest probe result, `None` before the first probe completes.
    pub fn health(&self, instance_id: &str) -> Option<Arc<HealthRecord>> {
        self.health.get(instance_id)?.load_full()
    }

    pub fn is_healthy(&self, instance_id: &str) -> bool {
        match self.health.get(instance_id) {
            Some(slot) => (*slot.load()).as_ref().map_or(true, |r| r.healthy),
            None => false,
        }
    }

    /// Replace the instance's record. Returns false for an unknown id.
    pub fn record_health(&self, instance_id: &str, record: HealthRecord) -> bool {
        let Some(slot) = self.health.get(instance_id) else {
            return false;
        };
        metrics::gauge!(
            "gateway_instance_healthy",
            "service" => self.name.clone(),
            "instance" => instance_id.to_owned(),
        )
        .set(if record.healthy { 1.0 } else { 0.0 });
        slot.store(Some(Arc::new(record)));
        true
    }

    /// Healthy instances in registration order.
    pub fn healthy_instances(&self) -> Vec<ServiceInstance> {
        self.instances
            .iter()
            .filter(|i| self.is_healthy(i.id()))
            .cloned()
            .collect()
    }

    pub fn select(&self) -> Option<RequestGuard> {
        let healthy = self.healthy_instances();
        self.lb.select(&healthy)
    }
}

/// Owns every logical service, its balancer and its health prober.
///
/// Built once at startup and shared behind an `Arc`; services are only added
/// during construction.
pub struct ServiceRegistry {
    strategy: Strategy,
    probing: Option<(ProbeSettings, reqwest::Client)>,
    services: Vec<Arc<LogicalService>>,
    by_name: HashMap<String, usize>,
    probers: Mutex<Vec<ProberHandle>>,
}

impl ServiceRegistry {
    /// Registry without health probing. Every instance stays healthy unless a
    /// record is written explicitly.
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            probing: None,
            services: Vec::new(),
            by_name: HashMap::new(),
            probers: Mutex::new(Vec::new()),
        }
    }

    /// Registry that starts a prober for every service it registers. Must be
    /// used from within a tokio runtime.
    pub fn with_health_checks(
        strategy: Strategy,
        settings: ProbeSettings,
        client: reqwest::Client,
    ) -> Self {
        Self {
            probing: Some((settings, client)),
            ..Self::new(strategy)
        }
    }

    pub fn from_config(config: &GatewayConfig) -> anyhow::Result<Self> {
        let strategy = Strategy::from_name(&config.load_balancer.strategy).ok_or_else(|| {
            GatewayError::Config(format!(
                "unknown load balancer strategy: {}",
                config.load_balancer.strategy
            ))
        })?;

        let mut registry = if config.health_check.enabled {
            let client = build_health_check_client()?;
            Self::with_health_checks(strategy, ProbeSettings::from(&config.health_check), client)
        } else {
            Self::new(strategy)
        };

        for svc in &config.services {
            let instances = svc.instances.iter().map(ServiceInstance::from).collect();
            registry.register_service(&svc.name, instances)?;
        }
        Ok(registry)
    }

    /// Record a service and its instances, set up its balancer and start its
    /// health prober when probing is enabled.
    pub fn register_service(
        &mut self,
        name: &str,
        instances: Vec<ServiceInstance>,
    ) -> Result<(), GatewayError> {
        if self.by_name.contains_key(name) {
            return Err(GatewayError::Config(format!(
                "service already registered: {}",
                name
            )));
        }
        if instances.is_empty() {
            return Err(GatewayError::Config(format!(
                "service has no instances: {}",
                name
            )));
        }
        let mut seen = HashSet::new();
        for inst in &instances {
            if !seen.insert(inst.id()) {
                return Err(GatewayError::Config(format!(
                    "duplicate instance id '{}' in service {}",
                    inst.id(),
                    name
                )));
            }
        }

        let taken: HashSet<String> = self.breaker_keys().into_iter().collect();
        for inst in &instances {
            let key = breaker_key(name, inst.id());
            if taken.contains(&key) {
                return Err(GatewayError::Config(format!(
                    "instance '{}' in service {} collides with circuit breaker key '{}' of another service",
                    inst.id(),
                    name,
                    key
                )));
            }
        }

        let service = Arc::new(LogicalService::new(name, instances, self.strategy));
        info!(
            "registry: service registered, name={}, instances={}, strategy={}",
            name,
            service.instances().len(),
            self.strategy.as_str()
        );

        if let Some((settings, client)) = &self.probing {
            let handle = spawn_prober(service.clone(), client.clone(), settings.clone());
            self.probers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(handle);
        }

        self.by_name.insert(name.to_string(), self.services.len());
        self.services.push(service);
        Ok(())
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn service(&self, name: &str) -> Option<&Arc<LogicalService>> {
        self.by_name.get(name).map(|&idx| &self.services[idx])
    }

    /// Services in registration order.
    pub fn services(&self) -> &[Arc<LogicalService>] {
        &self.services
    }

    /// Healthy instances of `name`; empty for an unknown service.
    pub fn get_healthy_instances(&self, name: &str) -> Vec<ServiceInstance> {
        self.service(name)
            .map(|s| s.healthy_instances())
            .unwrap_or_default()
    }

    /// Pick an instance of `name` and mark one call in flight on it.
    pub fn select_instance(&self, name: &str) -> Result<RequestGuard, GatewayError> {
        let service = self
            .service(name)
            .ok_or_else(|| GatewayError::UnknownService(name.to_string()))?;
        service
            .select()
            .ok_or_else(|| GatewayError::NoHealthyInstance(name.to_string()))
    }

    pub fn record_health(&self, service: &str, instance_id: &str, record: HealthRecord) -> bool {
        self.service(service)
            .map(|s| s.record_health(instance_id, record))
            .unwrap_or(false)
    }

    /// Every `{service}-{instance}` key, the complete breaker key space.
    pub fn breaker_keys(&self) -> Vec<String> {
        self.services
            .iter()
            .flat_map(|s| s.instances().iter().map(|i| breaker_key(s.name(), i.id())))
            .collect()
    }

    /// Names of services with no healthy instance left.
    pub fn unavailable_services(&self) -> Vec<String> {
        self.services
            .iter()
            .filter(|s| s.instances().iter().all(|i| !s.is_healthy(i.id())))
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn prober_count(&self) -> usize {
        self.probers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Cancel every prober and wait for them to exit. Safe to call twice.
    pub async fn shutdown(&self) {
        let handles = std::mem::take(
            &mut *self
                .probers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let count = handles.len();
        for handle in handles {
            handle.shutdown().await;
        }
        if count > 0 {
            info!("registry: health probers stopped, count={}", count);
        }
    }
}
