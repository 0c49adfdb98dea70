//! Static cluster manager.
//!
//! # Responsibilities
//! - Build clusters and hosts from configuration
//! - Apply the cluster's load balancer to pick a host per stream
//! - Hand out per-host connection pools backed by a `StreamConnector`

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::config::{ClusterConfig, LbPolicy};
use crate::load_balancer::{LeastConnections, LoadBalancer, LoadBalancerContext, RoundRobin};
use crate::protocol::{HeaderMap, Protocol};
use crate::stream::{SendError, StreamResetReason};
use crate::upstream::{
    ClusterInfo, ClusterManager, ClusterSnapshot, ConnectionPool, Host, HostConnectionGuard,
    PoolFailure, RequestSender, StreamConnector, UpstreamEventListener, UpstreamStream,
};

/// Hosts of one cluster and the strategy choosing among them.
#[derive(Debug)]
pub struct Cluster {
    info: Arc<ClusterInfo>,
    hosts: Vec<Arc<Host>>,
    lb: Box<dyn LoadBalancer>,
}

impl Cluster {
    pub fn new(info: ClusterInfo, hosts: Vec<Arc<Host>>, lb: Box<dyn LoadBalancer>) -> Self {
        Self {
            info: Arc::new(info),
            hosts,
            lb,
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        let info = ClusterInfo::new(
            config.name.clone(),
            config.max_concurrent_retries,
            config.health.clone(),
        );
        let hosts = config
            .hosts
            .iter()
            .map(|h| Arc::new(Host::from_config(h)))
            .collect();
        let lb: Box<dyn LoadBalancer> = match config.lb_policy {
            LbPolicy::RoundRobin => Box::new(RoundRobin::new()),
            LbPolicy::LeastConnections => Box::new(LeastConnections::new()),
        };
        Self::new(info, hosts, lb)
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }
}

impl ClusterSnapshot for Cluster {
    fn cluster_info(&self) -> Arc<ClusterInfo> {
        self.info.clone()
    }
}

/// Cluster manager over a fixed set of clusters.
pub struct StaticClusterManager {
    clusters: HashMap<String, Arc<Cluster>>,
    connector: Arc<dyn StreamConnector>,
}

impl StaticClusterManager {
    pub fn new(clusters: Vec<Cluster>, connector: Arc<dyn StreamConnector>) -> Self {
        let clusters = clusters
            .into_iter()
            .map(|c| (c.info.name().to_string(), Arc::new(c)))
            .collect();
        Self {
            clusters,
            connector,
        }
    }

    pub fn from_config(configs: &[ClusterConfig], connector: Arc<dyn StreamConnector>) -> Self {
        Self::new(configs.iter().map(Cluster::from_config).collect(), connector)
    }

    pub fn cluster(&self, name: &str) -> Option<&Arc<Cluster>> {
        self.clusters.get(name)
    }
}

impl ClusterManager for StaticClusterManager {
    fn get_cluster_snapshot(&self, name: &str) -> Option<Arc<dyn ClusterSnapshot>> {
        match self.clusters.get(name) {
            Some(cluster) => Some(cluster.clone() as Arc<dyn ClusterSnapshot>),
            None => {
                tracing::debug!(cluster = %name, "Cluster not found");
                None
            }
        }
    }

    fn conn_pool_for_cluster(
        &self,
        ctx: &dyn LoadBalancerContext,
        snapshot: &Arc<dyn ClusterSnapshot>,
        protocol: &Protocol,
    ) -> Option<Arc<dyn ConnectionPool>> {
        let info = snapshot.cluster_info();
        let cluster = self.clusters.get(info.name())?;

        let Some(host) = cluster.lb.choose_host(&cluster.hosts, ctx) else {
            tracing::debug!(
                cluster = %info.name(),
                host_count = cluster.hosts.len(),
                "No eligible host found in cluster"
            );
            return None;
        };

        Some(Arc::new(HostConnPool {
            host,
            protocol: protocol.clone(),
            connector: self.connector.clone(),
        }))
    }
}

/// Streams to one host through the manager's connector.
pub struct HostConnPool {
    host: Arc<Host>,
    protocol: Protocol,
    connector: Arc<dyn StreamConnector>,
}

impl ConnectionPool for HostConnPool {
    fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    fn host(&self) -> &Arc<Host> {
        &self.host
    }

    fn new_stream(
        &self,
        listener: Option<Arc<dyn UpstreamEventListener>>,
    ) -> Result<UpstreamStream, PoolFailure> {
        let guard = self.host.try_create_guard().ok_or(PoolFailure::Overflow)?;
        let sender = self.connector.connect(&self.host, &self.protocol, listener)?;
        Ok(UpstreamStream {
            host: self.host.clone(),
            sender: Arc::new(GuardedSender {
                inner: sender,
                _guard: guard,
            }),
        })
    }
}

/// Keeps the host slot reserved while the sender is alive.
struct GuardedSender {
    inner: Arc<dyn RequestSender>,
    _guard: HostConnectionGuard,
}

impl RequestSender for GuardedSender {
    fn append_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), SendError> {
        self.inner.append_headers(headers, end_stream)
    }

    fn append_data(&self, data: Bytes, end_stream: bool) -> Result<(), SendError> {
        self.inner.append_data(data, end_stream)
    }

    fn append_trailers(&self, trailers: HeaderMap) -> Result<(), SendError> {
        self.inner.append_trailers(trailers)
    }

    fn reset(&self, reason: StreamResetReason) {
        self.inner.reset(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::EmptyContext;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingConnector {
        connects: Mutex<Vec<String>>,
    }

    struct NullSender;

    impl RequestSender for NullSender {
        fn append_headers(&self, _: HeaderMap, _: bool) -> Result<(), SendError> {
            Ok(())
        }
        fn append_data(&self, _: Bytes, _: bool) -> Result<(), SendError> {
            Ok(())
        }
        fn append_trailers(&self, _: HeaderMap) -> Result<(), SendError> {
            Ok(())
        }
        fn reset(&self, _: StreamResetReason) {}
    }

    impl StreamConnector for RecordingConnector {
        fn connect(
            &self,
            host: &Arc<Host>,
            _protocol: &Protocol,
            _listener: Option<Arc<dyn UpstreamEventListener>>,
        ) -> Result<Arc<dyn RequestSender>, PoolFailure> {
            self.connects.lock().unwrap().push(host.address().to_string());
            Ok(Arc::new(NullSender))
        }
    }

    fn manager(max_connections: usize) -> (StaticClusterManager, Arc<RecordingConnector>) {
        let config: ClusterConfig = toml::from_str(&format!(
            r#"
            name = "backend"
            hosts = [{{ address = "10.0.0.1:80", max_connections = {max_connections} }}]
            "#
        ))
        .unwrap();
        let connector = Arc::new(RecordingConnector::default());
        (
            StaticClusterManager::from_config(&[config], connector.clone()),
            connector,
        )
    }

    #[test]
    fn test_unknown_cluster() {
        let (manager, _) = manager(1);
        assert!(manager.get_cluster_snapshot("nope").is_none());
    }

    #[test]
    fn test_pool_overflow_and_release() {
        let (manager, connector) = manager(1);
        let snapshot = manager.get_cluster_snapshot("backend").unwrap();
        let pool = manager
            .conn_pool_for_cluster(&EmptyContext, &snapshot, &Protocol::HTTP1)
            .unwrap();

        let first = pool.new_stream(None).unwrap();
        assert_eq!(first.host.address(), "10.0.0.1:80");
        assert_eq!(pool.new_stream(None).err(), Some(PoolFailure::Overflow));

        drop(first);
        assert!(pool.new_stream(None).is_ok());
        assert_eq!(connector.connects.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_no_healthy_host() {
        let (manager, _) = manager(1);
        let snapshot = manager.get_cluster_snapshot("backend").unwrap();
        for host in manager.cluster("backend").unwrap().hosts() {
            host.mark_failure(1);
        }
        assert!(manager
            .conn_pool_for_cluster(&EmptyContext, &snapshot, &Protocol::HTTP1)
            .is_none());
    }
}
