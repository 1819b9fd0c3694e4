use super::ServiceInstance;
use rand::Rng;

/// Weighted random selection by running subtraction.
///
/// Draw `r` uniformly from `[0, total_weight)`, then walk the list subtracting
/// each weight until `r` drops to zero or below. If rounding leaves nothing
/// selected, the first instance is returned.
#[derive(Default)]
pub struct WeightedBalancer;

impl WeightedBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn do_select(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        let draw = rand::thread_rng().gen::<f64>();
        Self::pick(instances, draw)
    }

    /// `unit` is a sample in `[0, 1)`; larger values exercise the fallback.
    fn pick(instances: &[ServiceInstance], unit: f64) -> Option<ServiceInstance> {
        let first = instances.first()?;
        let total: f64 = instances.iter().map(|i| i.weight.max(1) as f64).sum();
        let mut r = unit * total;
        for inst in instances {
            r -= inst.weight.max(1) as f64;
            if r <= 0.0 {
                return Some(inst.clone());
            }
        }
        Some(first.clone())
    }
}
