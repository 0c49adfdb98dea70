//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{is_eligible, LoadBalancer, LoadBalancerContext};
use crate::upstream::Host;

/// Selects the eligible host with the fewest active streams.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn choose_host(
        &self,
        hosts: &[Arc<Host>],
        ctx: &dyn LoadBalancerContext,
    ) -> Option<Arc<Host>> {
        // Ties go to the first host for stability.
        hosts
            .iter()
            .filter(|host| is_eligible(host, ctx))
            .min_by_key(|host| host.active_connections())
            .cloned()
    }
}
