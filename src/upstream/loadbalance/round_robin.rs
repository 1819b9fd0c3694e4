use super::ServiceInstance;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin over the current healthy set.
///
/// The cursor is never reset when the healthy set changes size; it wraps by
/// modulo instead, so a health flap does not bias selection toward index 0.
#[derive(Default)]
pub struct RoundRobinBalancer {
    cursor: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn do_select(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let count = self.cursor.fetch_add(1, Ordering::Relaxed);
        Some(instances[count % instances.len()].clone())
    }

    #[cfg(test)]
    fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}
