//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Stream asks the cluster manager for a connection pool
//!     → cluster's hosts + LoadBalancerContext (the stream)
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (rotate through hosts)
//!         - least_conn.rs (pick host with fewest active streams)
//!     → chosen host wrapped in a connection pool
//! ```
//!
//! # Design Decisions
//! - Unhealthy hosts are excluded from selection
//! - A route's metadata criteria narrow the eligible hosts
//! - Algorithm selection per cluster

pub mod least_conn;
pub mod round_robin;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::protocol::HeaderMap;
use crate::proxy::ConnectionInfo;
use crate::upstream::Host;

pub use least_conn::LeastConnections;
pub use round_robin::RoundRobin;

/// Host metadata a route requires of its upstream hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataMatchCriteria {
    required: BTreeMap<String, String>,
}

impl MetadataMatchCriteria {
    /// `None` when there is nothing to match.
    pub fn new(required: BTreeMap<String, String>) -> Option<Self> {
        if required.is_empty() {
            None
        } else {
            Some(Self { required })
        }
    }

    pub fn matches(&self, metadata: &BTreeMap<String, String>) -> bool {
        self.required
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

/// What a load balancer may know about the stream it is choosing for.
pub trait LoadBalancerContext {
    fn metadata_match_criteria(&self) -> Option<&MetadataMatchCriteria>;

    fn downstream_headers(&self) -> Option<&HeaderMap>;

    fn downstream_connection(&self) -> Option<&ConnectionInfo>;
}

/// Context with no criteria, headers or connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyContext;

impl LoadBalancerContext for EmptyContext {
    fn metadata_match_criteria(&self) -> Option<&MetadataMatchCriteria> {
        None
    }

    fn downstream_headers(&self) -> Option<&HeaderMap> {
        None
    }

    fn downstream_connection(&self) -> Option<&ConnectionInfo> {
        None
    }
}

/// Host selection strategy.
pub trait LoadBalancer: Send + Sync + Debug {
    fn choose_host(
        &self,
        hosts: &[Arc<Host>],
        ctx: &dyn LoadBalancerContext,
    ) -> Option<Arc<Host>>;
}

/// Healthy and matching the context's metadata criteria.
pub fn is_eligible(host: &Host, ctx: &dyn LoadBalancerContext) -> bool {
    host.is_healthy()
        && ctx
            .metadata_match_criteria()
            .map_or(true, |criteria| criteria.matches(host.metadata()))
}
