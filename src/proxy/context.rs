//! Listener-wide proxy context shared by every connection.

use std::sync::Arc;

use crate::config::{ProxyConfig, ProxySettings};
use crate::observability::{AccessLog, JsonAccessLog, LogTracer, Tracer};
use crate::protocol::ConverterRegistry;
use crate::routing::RouterHandle;
use crate::stream::{StreamFilterChainFactory, StreamPool};
use crate::upstream::ClusterManager;

/// Collaborators and settings of one listener.
pub struct ProxyContext {
    pub(crate) settings: ProxySettings,
    pub(crate) routers: RouterHandle,
    pub(crate) cluster_manager: Arc<dyn ClusterManager>,
    pub(crate) converters: ConverterRegistry,
    pub(crate) access_logs: Vec<Arc<dyn AccessLog>>,
    pub(crate) filter_factories: Vec<Arc<dyn StreamFilterChainFactory>>,
    pub(crate) tracer: Option<Arc<dyn Tracer>>,
    pub(crate) pool: StreamPool,
}

impl ProxyContext {
    pub fn builder(
        settings: ProxySettings,
        routers: RouterHandle,
        cluster_manager: Arc<dyn ClusterManager>,
    ) -> ProxyContextBuilder {
        ProxyContextBuilder {
            settings,
            routers,
            cluster_manager,
            converters: ConverterRegistry::new(),
            access_logs: Vec::new(),
            filter_factories: Vec::new(),
            tracer: None,
        }
    }

    /// Builder preloaded from configuration: JSON access log and log tracer
    /// when enabled.
    pub fn from_config(
        config: &ProxyConfig,
        routers: RouterHandle,
        cluster_manager: Arc<dyn ClusterManager>,
    ) -> ProxyContextBuilder {
        let mut builder = Self::builder(config.proxy.clone(), routers, cluster_manager);
        if config.observability.access_log {
            builder = builder.access_log(Arc::new(JsonAccessLog));
        }
        if config.observability.tracing_enabled {
            builder = builder.tracer(Arc::new(LogTracer));
        }
        builder
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn routers(&self) -> &RouterHandle {
        &self.routers
    }

    pub fn pool(&self) -> &StreamPool {
        &self.pool
    }
}

pub struct ProxyContextBuilder {
    settings: ProxySettings,
    routers: RouterHandle,
    cluster_manager: Arc<dyn ClusterManager>,
    converters: ConverterRegistry,
    access_logs: Vec<Arc<dyn AccessLog>>,
    filter_factories: Vec<Arc<dyn StreamFilterChainFactory>>,
    tracer: Option<Arc<dyn Tracer>>,
}

impl ProxyContextBuilder {
    pub fn converters(mut self, converters: ConverterRegistry) -> Self {
        self.converters = converters;
        self
    }

    pub fn access_log(mut self, log: Arc<dyn AccessLog>) -> Self {
        self.access_logs.push(log);
        self
    }

    pub fn filter_factory(mut self, factory: Arc<dyn StreamFilterChainFactory>) -> Self {
        self.filter_factories.push(factory);
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn build(self) -> Arc<ProxyContext> {
        let pool = StreamPool::new(self.settings.stream_pool_capacity);
        Arc::new(ProxyContext {
            settings: self.settings,
            routers: self.routers,
            cluster_manager: self.cluster_manager,
            converters: self.converters,
            access_logs: self.access_logs,
            filter_factories: self.filter_factories,
            tracer: self.tracer,
            pool,
        })
    }
}
