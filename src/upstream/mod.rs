pub mod circuit_breaker;
pub mod health;
pub mod loadbalance;
pub mod registry;

pub use circuit_breaker::{BreakerError, CircuitBreakerRegistry, CircuitSnapshot, CircuitStatus};
pub use health::{build_health_check_client, probe, HealthRecord, ProbeSettings, ProberHandle};
pub use loadbalance::{LoadBalancer, RequestGuard, ServiceInstance, Strategy};
pub use registry::{breaker_key, LogicalService, ServiceRegistry};
