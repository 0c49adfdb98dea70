//! Upstream host.
//!
//! # Responsibilities
//! - Represent a single upstream host of a cluster
//! - Track active streams (for Least Connections LB)
//! - Enforce max stream limits
//! - Track passive health state (Healthy/Unhealthy)

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::HostConfig;
use crate::upstream::cluster::Counter;

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

/// Per-host request counters.
#[derive(Debug, Default)]
pub struct HostStats {
    pub upstream_request_total: Counter,
    pub upstream_request_timeout: Counter,
    pub upstream_response_success: Counter,
    pub upstream_response_failed: Counter,
}

/// A single upstream host.
#[derive(Debug)]
pub struct Host {
    address: String,
    weight: u32,
    max_connections: usize,
    active_connections: AtomicUsize,
    metadata: BTreeMap<String, String>,

    /// Current health state (0=Unknown, 1=Healthy, 2=Unhealthy).
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,

    stats: HostStats,
}

impl Host {
    pub fn new(address: impl Into<String>, max_connections: usize) -> Self {
        Self {
            address: address.into(),
            weight: 1,
            max_connections,
            active_connections: AtomicUsize::new(0),
            metadata: BTreeMap::new(),
            state: AtomicU8::new(HealthState::Unknown as u8),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            stats: HostStats::default(),
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        let mut host = Self::new(config.address.clone(), config.max_connections);
        host.weight = config.weight;
        host.metadata = config.metadata.clone();
        host
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    /// Number of streams currently holding a guard on this host.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Reserve one stream slot; `None` when the host is at its limit.
    pub fn try_create_guard(self: &Arc<Self>) -> Option<HostConnectionGuard> {
        let mut prev = self.active_connections.load(Ordering::Relaxed);
        loop {
            if prev >= self.max_connections {
                return None;
            }
            match self.active_connections.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(HostConnectionGuard { host: self.clone() })
    }

    // --- Health Logic ---

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Relaxed))
    }

    /// Healthy or Unknown.
    pub fn is_healthy(&self) -> bool {
        self.health() != HealthState::Unhealthy
    }

    /// Report a successful upstream response.
    pub fn mark_success(&self, healthy_threshold: u32) {
        self.consecutive_failures.store(0, Ordering::Relaxed);

        if self.health() == HealthState::Healthy {
            return;
        }

        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if successes >= healthy_threshold {
            self.state.store(HealthState::Healthy as u8, Ordering::Relaxed);
            tracing::info!(host = %self.address, "Host marked healthy");
        }
    }

    /// Report a failed upstream response or reset.
    pub fn mark_failure(&self, unhealthy_threshold: u32) {
        self.consecutive_successes.store(0, Ordering::Relaxed);

        if self.health() == HealthState::Unhealthy {
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= unhealthy_threshold {
            self.state.store(HealthState::Unhealthy as u8, Ordering::Relaxed);
            tracing::warn!(host = %self.address, failures, "Host marked unhealthy");
        }
    }
}

/// Holds one stream slot of a host; released on drop.
#[derive(Debug)]
pub struct HostConnectionGuard {
    host: Arc<Host>,
}

impl Deref for HostConnectionGuard {
    type Target = Host;
    fn deref(&self) -> &Self::Target {
        &self.host
    }
}

impl Drop for HostConnectionGuard {
    fn drop(&mut self) {
        self.host.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}
