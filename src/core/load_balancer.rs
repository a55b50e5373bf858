use std::sync::atomic::{AtomicUsize, Ordering};

use url::Url;

/// Trait defining the interface for picking an upstream of a service
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select a target from a list of targets
    fn select_target(&self, targets: &[Url]) -> Option<Url>;
}

/// Round-robin load balancing strategy; one instance per route so routes sharing a service
/// rotate independently.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select_target(&self, targets: &[Url]) -> Option<Url> {
        if targets.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(targets[count % targets.len()].clone())
    }
}
