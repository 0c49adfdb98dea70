//! Cluster-level policy and counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::PassiveHealthConfig;
use crate::resilience::RetryBudget;

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct ClusterStats {
    pub upstream_request_timeout: Counter,
    pub upstream_request_retry: Counter,
    pub upstream_request_retry_overflow: Counter,
    pub upstream_response_success: Counter,
    pub upstream_response_failed: Counter,
}

/// Shared description of a cluster.
#[derive(Debug)]
pub struct ClusterInfo {
    name: String,
    stats: ClusterStats,
    retry_budget: RetryBudget,
    health: PassiveHealthConfig,
}

impl ClusterInfo {
    pub fn new(
        name: impl Into<String>,
        max_concurrent_retries: usize,
        health: PassiveHealthConfig,
    ) -> Self {
        Self {
            name: name.into(),
            stats: ClusterStats::default(),
            retry_budget: RetryBudget::new(max_concurrent_retries),
            health,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    pub fn retry_budget(&self) -> &RetryBudget {
        &self.retry_budget
    }

    pub fn health(&self) -> &PassiveHealthConfig {
        &self.health
    }
}
