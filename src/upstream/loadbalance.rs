pub mod least_conn;
pub mod round_robin;
pub mod weighted;

use crate::config::InstanceConfig;
use least_conn::LeastConnBalancer;
use round_robin::RoundRobinBalancer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weighted::WeightedBalancer;

/// One backend of a logical service. Identity, URL and weight never change
/// after registration; the in-flight counter is shared between clones.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    id: Arc<str>,
    /// Base URL without a trailing slash.
    url: Arc<str>,
    pub weight: u32,
    active_requests: Arc<AtomicUsize>,
}

impl ServiceInstance {
    pub fn new(id: &str, url: &str, weight: u32) -> Self {
        Self {
            id: Arc::from(id),
            url: Arc::from(url.trim_end_matches('/')),
            weight: weight.max(1),
            active_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn inc_active(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

impl From<&InstanceConfig> for ServiceInstance {
    fn from(cfg: &InstanceConfig) -> Self {
        Self::new(&cfg.id, &cfg.url, cfg.weight)
    }
}

/// Deployment-wide selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    Weighted,
}

impl Strategy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "round_robin" | "roundrobin" => Some(Self::RoundRobin),
            "least_connections" | "least_conn" => Some(Self::LeastConnections),
            "weighted" | "weighted_random" => Some(Self::Weighted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::Weighted => "weighted",
        }
    }
}

/// Per-service balancer. Picks one instance out of the caller-supplied
/// healthy set; the set may shrink or grow between calls.
pub enum LoadBalancer {
    RoundRobin(RoundRobinBalancer),
    LeastConnections(LeastConnBalancer),
    Weighted(WeightedBalancer),
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        match strategy {
            Strategy::RoundRobin => Self::RoundRobin(RoundRobinBalancer::new()),
            Strategy::LeastConnections => Self::LeastConnections(LeastConnBalancer::new()),
            Strategy::Weighted => Self::Weighted(WeightedBalancer::new()),
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Self::RoundRobin(_) => Strategy::RoundRobin,
            Self::LeastConnections(_) => Strategy::LeastConnections,
            Self::Weighted(_) => Strategy::Weighted,
        }
    }

    /// Select an instance and mark one call in flight on it. Returns `None`
    /// only when `healthy` is empty.
    pub fn select(&self, healthy: &[ServiceInstance]) -> Option<RequestGuard> {
        let instance = match self {
            // Least-connections reads and bumps the counter under its own lock.
            Self::LeastConnections(lb) => return lb.do_select(healthy).map(RequestGuard::adopt),
            Self::RoundRobin(lb) => lb.do_select(healthy)?,
            Self::Weighted(lb) => lb.do_select(healthy)?,
        };
        Some(RequestGuard::acquire(instance))
    }
}

/// RAII guard for one in-flight call. Decrements the instance's counter on drop.
#[derive(Debug)]
pub struct RequestGuard {
    pub instance: ServiceInstance,
}

impl RequestGuard {
    fn acquire(instance: ServiceInstance) -> Self {
        instance.inc_active();
        Self { instance }
    }

    /// Wrap an instance whose counter was already incremented.
    fn adopt(instance: ServiceInstance) -> Self {
        Self { instance }
    }

    pub fn id(&self) -> &str {
        self.instance.id()
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.instance.dec_active();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn make_instances(n: usize) -> Vec<ServiceInstance> {
        (0..n)
            .map(|i| ServiceInstance::new(&format!("i{}", i), &format!("http://10.0.0.{}:80", i + 1), 1))
            .collect()
    }

    #[test]
    fn test_instance_from_config() {
        let cfg = InstanceConfig {
            id: "tags-1".into(),
            url: "http://127.0.0.1:8002/".into(),
            weight: 4,
        };
        let inst = ServiceInstance::from(&cfg);
        assert_eq!(inst.id(), "tags-1");
        assert_eq!(inst.url(), "http://127.0.0.1:8002");
        assert_eq!(inst.weight, 4);
        assert_eq!(inst.active_requests(), 0);
    }

    #[test]
    fn test_instance_counter_shared_between_clones() {
        let a = ServiceInstance::new("a", "http://h", 1);
        let b = a.clone();
        a.inc_active();
        a.inc_active();
        assert_eq!(b.active_requests(), 2);
        b.dec_active();
        assert_eq!(a.active_requests(), 1);
    }

    #[test]
    fn test_zero_weight_clamped() {
        assert_eq!(ServiceInstance::new("a", "http://h", 0).weight, 1);
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(Strategy::from_name("round_robin"), Some(Strategy::RoundRobin));
        assert_eq!(Strategy::from_name("roundrobin"), Some(Strategy::RoundRobin));
        assert_eq!(
            Strategy::from_name("least_connections"),
            Some(Strategy::LeastConnections)
        );
        assert_eq!(Strategy::from_name("least_conn"), Some(Strategy::LeastConnections));
        assert_eq!(Strategy::from_name("weighted"), Some(Strategy::Weighted));
        assert_eq!(Strategy::from_name("weighted_random"), Some(Strategy::Weighted));
        assert_eq!(Strategy::from_name("peak_ewma"), None);
        for s in [Strategy::RoundRobin, Strategy::LeastConnections, Strategy::Weighted] {
            assert_eq!(Strategy::from_name(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_select_empty_returns_none() {
        for s in [Strategy::RoundRobin, Strategy::LeastConnections, Strategy::Weighted] {
            let lb = LoadBalancer::new(s);
            assert!(lb.select(&[]).is_none(), "empty {:?} should return None", s);
        }
    }

    #[test]
    fn test_every_strategy_reaches_all_instances() {
        let instances = make_instances(3);
        for s in [Strategy::RoundRobin, Strategy::LeastConnections, Strategy::Weighted] {
            let lb = LoadBalancer::new(s);
            let mut seen = HashSet::new();
            // Guards stay alive so least-connections sees the load build up.
            let mut held = Vec::new();
            for _ in 0..300 {
                let guard = lb.select(&instances).unwrap();
                seen.insert(guard.id().to_string());
                held.push(guard);
            }
            assert_eq!(seen.len(), 3, "{:?} should reach every instance", s);
            drop(held);
            assert!(instances.iter().all(|i| i.active_requests() == 0));
        }
    }

    #[test]
    fn test_guard_tracks_in_flight_for_every_strategy() {
        for s in [Strategy::RoundRobin, Strategy::LeastConnections, Strategy::Weighted] {
            let lb = LoadBalancer::new(s);
            let instances = make_instances(1);
            {
                let _guard = lb.select(&instances).unwrap();
                assert_eq!(instances[0].active_requests(), 1);
            }
            assert_eq!(instances[0].active_requests(), 0);
        }
    }

    #[test]
    fn test_strategy_accessor() {
        assert_eq!(
            LoadBalancer::new(Strategy::Weighted).strategy(),
            Strategy::Weighted
        );
    }
}
