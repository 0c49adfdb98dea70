//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{is_eligible, LoadBalancer, LoadBalancerContext};
use crate::upstream::Host;

/// Round-robin selector.
/// Stores an internal counter to rotate through hosts.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn choose_host(
        &self,
        hosts: &[Arc<Host>],
        ctx: &dyn LoadBalancerContext,
    ) -> Option<Arc<Host>> {
        if hosts.is_empty() {
            return None;
        }

        // Bounded scan so an all-ineligible cluster terminates.
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = hosts.len();
        (0..len)
            .map(|i| &hosts[(start + i) % len])
            .find(|host| is_eligible(host, ctx))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::EmptyContext;

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let h1 = Arc::new(Host::new("127.0.0.1:8080", 100));
        let h2 = Arc::new(Host::new("127.0.0.1:8081", 100));
        let hosts = vec![h1.clone(), h2.clone()];

        let s1 = lb.choose_host(&hosts, &EmptyContext).unwrap();
        assert_eq!(s1.address(), h1.address());

        let s2 = lb.choose_host(&hosts, &EmptyContext).unwrap();
        assert_eq!(s2.address(), h2.address());

        let s3 = lb.choose_host(&hosts, &EmptyContext).unwrap();
        assert_eq!(s3.address(), h1.address());
    }

    #[test]
    fn test_skips_unhealthy() {
        let lb = RoundRobin::new();
        let sick = Arc::new(Host::new("127.0.0.1:8080", 100));
        sick.mark_failure(1);
        let well = Arc::new(Host::new("127.0.0.1:8081", 100));
        let hosts = vec![sick, well.clone()];

        for _ in 0..3 {
            let chosen = lb.choose_host(&hosts, &EmptyContext).unwrap();
            assert_eq!(chosen.address(), well.address());
        }

        well.mark_failure(1);
        assert!(lb.choose_host(&hosts, &EmptyContext).is_none());
    }
}
