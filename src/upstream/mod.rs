//! Upstream subsystem.
//!
//! # Data Flow
//! ```text
//! Stream selected a cluster name
//!     → ClusterManager::get_cluster_snapshot
//!     → ClusterManager::conn_pool_for_cluster (load balancer picks a host)
//!     → ConnectionPool::new_stream (host slot + StreamConnector)
//!     → RequestSender (request frames out)
//!     → UpstreamEventListener (response frames / resets back)
//! ```
//!
//! # Design Decisions
//! - Transports sit behind `StreamConnector`; nothing here does I/O
//! - Host slots are RAII guards released when the sender is dropped
//! - `RequestSender::reset` never re-enters the listener

pub mod cluster;
pub mod host;
pub mod manager;

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::load_balancer::LoadBalancerContext;
use crate::protocol::{HeaderMap, Protocol};
use crate::stream::{SendError, StreamResetReason};

pub use cluster::{ClusterInfo, ClusterStats, Counter};
pub use host::{HealthState, Host, HostConnectionGuard, HostStats};
pub use manager::{Cluster, HostConnPool, StaticClusterManager};

/// Why a connection pool could not open a stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolFailure {
    #[error("host has no stream capacity left")]
    Overflow,

    #[error("connection failed: {0}")]
    ConnectionFailure(String),
}

impl PoolFailure {
    pub fn reset_reason(&self) -> StreamResetReason {
        match self {
            PoolFailure::Overflow => StreamResetReason::Overflow,
            PoolFailure::ConnectionFailure(_) => StreamResetReason::ConnectionFailed,
        }
    }
}

/// Callbacks from an upstream stream to the proxy.
pub trait UpstreamEventListener: Send + Sync {
    /// A complete upstream response arrived.
    fn on_receive(&self, headers: HeaderMap, data: Option<Bytes>, trailers: Option<HeaderMap>);

    /// The upstream stream was reset.
    fn on_reset_stream(&self, reason: StreamResetReason);
}

/// Request side of one upstream stream.
pub trait RequestSender: Send + Sync {
    fn append_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), SendError>;

    fn append_data(&self, data: Bytes, end_stream: bool) -> Result<(), SendError>;

    fn append_trailers(&self, trailers: HeaderMap) -> Result<(), SendError>;

    /// Reset the stream locally. Must not call back into the listener.
    fn reset(&self, reason: StreamResetReason);
}

/// Opens upstream streams on a transport.
pub trait StreamConnector: Send + Sync {
    /// `listener` is `None` for oneway requests.
    fn connect(
        &self,
        host: &Arc<Host>,
        protocol: &Protocol,
        listener: Option<Arc<dyn UpstreamEventListener>>,
    ) -> Result<Arc<dyn RequestSender>, PoolFailure>;
}

/// A freshly opened upstream stream.
pub struct UpstreamStream {
    pub host: Arc<Host>,
    pub sender: Arc<dyn RequestSender>,
}

/// Streams to one chosen host.
pub trait ConnectionPool: Send + Sync {
    fn protocol(&self) -> &Protocol;

    fn host(&self) -> &Arc<Host>;

    fn new_stream(
        &self,
        listener: Option<Arc<dyn UpstreamEventListener>>,
    ) -> Result<UpstreamStream, PoolFailure>;
}

/// Read view of one cluster, held for the lifetime of a stream.
pub trait ClusterSnapshot: Send + Sync {
    fn cluster_info(&self) -> Arc<ClusterInfo>;
}

pub trait ClusterManager: Send + Sync {
    fn get_cluster_snapshot(&self, name: &str) -> Option<Arc<dyn ClusterSnapshot>>;

    /// Hand a snapshot back once the stream is done with it.
    fn put_cluster_snapshot(&self, _snapshot: Arc<dyn ClusterSnapshot>) {}

    /// `None` when the cluster has no eligible host.
    fn conn_pool_for_cluster(
        &self,
        ctx: &dyn LoadBalancerContext,
        snapshot: &Arc<dyn ClusterSnapshot>,
        protocol: &Protocol,
    ) -> Option<Arc<dyn ConnectionPool>>;
}
