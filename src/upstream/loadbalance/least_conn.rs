use super::ServiceInstance;
use std::sync::Mutex;

/// Least-connections balancer.
///
/// Picks the instance with the fewest in-flight calls; ties go to the
/// earliest instance in registration order. Reading the counters and
/// bumping the winner happen under one per-service lock so two concurrent
/// selections cannot both see the same minimum.
#[derive(Default)]
pub struct LeastConnBalancer {
    select_lock: Mutex<()>,
}

impl LeastConnBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the chosen instance with its in-flight counter already incremented.
    pub fn do_select(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        let _guard = self
            .select_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let chosen = instances.iter().min_by_key(|i| i.active_requests())?;
        chosen.inc_active();
        Some(chosen.clone())
    }
}
