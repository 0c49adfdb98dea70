//! Shared mock collaborators for integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use mesh_proxy::config::{parse_config, ProxyConfig};
use mesh_proxy::observability::AccessLog;
use mesh_proxy::protocol::{HeaderMap, Protocol};
use mesh_proxy::proxy::{ConnectionInfo, Proxy, ProxyContext, ProxyContextBuilder};
use mesh_proxy::routing::{RouterHandle, StaticRouter};
use mesh_proxy::stream::{
    FilterChainFactoryCallbacks, RequestInfo, ResponseSender, SendError, StreamEventListener,
    StreamFilterChainFactory, StreamResetReason,
};
use mesh_proxy::upstream::{
    Host, PoolFailure, RequestSender, StaticClusterManager, StreamConnector,
    UpstreamEventListener,
};

/// Test configuration assembled from TOML fragments.
pub struct TestConfig {
    pub timeouts: &'static str,
    pub retries: &'static str,
    pub routes: &'static str,
    pub clusters: &'static str,
}

pub const DEFAULT_ROUTE: &str = r#"
[[routes]]
name = "default"
path_prefix = "/"
cluster = "backend"
"#;

pub const BACKEND: &str = r#"
[[clusters]]
name = "backend"
hosts = [{ address = "10.0.0.1:8080" }, { address = "10.0.0.2:8080" }]
health = { unhealthy_threshold = 100, healthy_threshold = 1 }
"#;

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            timeouts: "global_ms = 0",
            retries: r#"max_attempts = 3
retry_on = ["connect-failure", "reset", "per-try-timeout"]"#,
            routes: DEFAULT_ROUTE,
            clusters: BACKEND,
        }
    }
}

impl TestConfig {
    pub fn build(&self) -> ProxyConfig {
        let toml = format!(
            "[proxy]\nname = \"test\"\n\n[timeouts]\n{}\n\n[retries]\n{}\n{}\n{}",
            self.timeouts, self.retries, self.routes, self.clusters
        );
        parse_config(&toml).unwrap()
    }
}

pub fn config() -> ProxyConfig {
    TestConfig::default().build()
}

pub fn request(path: &str) -> HeaderMap {
    [(":path", path), ("host", "example.com")].into_iter().collect()
}

// --- Downstream ---

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Headers(HeaderMap, bool),
    Data(Bytes, bool),
    Trailers(HeaderMap),
}

/// Records response frames and resets written by the stream.
#[derive(Default)]
pub struct MockResponseSender {
    frames: Mutex<Vec<Frame>>,
    resets: Mutex<Vec<StreamResetReason>>,
    listeners: Mutex<Vec<Arc<dyn StreamEventListener>>>,
}

impl MockResponseSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn resets(&self) -> Vec<StreamResetReason> {
        self.resets.lock().unwrap().clone()
    }

    pub fn headers(&self) -> Option<HeaderMap> {
        self.frames().into_iter().find_map(|f| match f {
            Frame::Headers(h, _) => Some(h),
            _ => None,
        })
    }

    pub fn status(&self) -> Option<u16> {
        self.headers().and_then(|h| h.status())
    }

    pub fn body(&self) -> Option<Bytes> {
        self.frames().into_iter().find_map(|f| match f {
            Frame::Data(d, _) => Some(d),
            _ => None,
        })
    }

    /// Simulate a reset initiated by the client or the transport.
    pub fn reset_from_peer(&self, reason: StreamResetReason) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_reset_stream(reason);
        }
    }
}

impl ResponseSender for MockResponseSender {
    fn append_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), SendError> {
        self.frames.lock().unwrap().push(Frame::Headers(headers, end_stream));
        Ok(())
    }

    fn append_data(&self, data: Bytes, end_stream: bool) -> Result<(), SendError> {
        self.frames.lock().unwrap().push(Frame::Data(data, end_stream));
        Ok(())
    }

    fn append_trailers(&self, trailers: HeaderMap) -> Result<(), SendError> {
        self.frames.lock().unwrap().push(Frame::Trailers(trailers));
        Ok(())
    }

    fn reset_stream(&self, reason: StreamResetReason) {
        self.resets.lock().unwrap().push(reason);
        self.reset_from_peer(reason);
    }

    fn add_event_listener(&self, listener: Arc<dyn StreamEventListener>) {
        self.listeners.lock().unwrap().push(listener);
    }
}

// --- Upstream ---

/// What an upstream attempt does once the whole request arrived.
#[derive(Debug, Clone)]
pub enum Behavior {
    Respond {
        status: u16,
        body: Option<&'static str>,
    },
    Reset(StreamResetReason),
    /// The pool refuses the stream.
    Fail,
    /// Never answers.
    Hang,
}

impl Behavior {
    pub fn ok() -> Self {
        Behavior::Respond {
            status: 200,
            body: Some("hello"),
        }
    }
}

/// Frames received by upstream hosts.
#[derive(Default)]
pub struct UpstreamLog {
    pub headers: Mutex<Vec<HeaderMap>>,
    pub data: Mutex<Vec<Bytes>>,
    pub resets: AtomicUsize,
}

/// Connector whose attempts follow a script, then a fallback behavior.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    connects: AtomicUsize,
    listeners: Mutex<Vec<bool>>,
    attempt: Mutex<Option<Arc<dyn UpstreamEventListener>>>,
    protocols: Mutex<Vec<Protocol>>,
    pub log: Arc<UpstreamLog>,
}

impl ScriptedConnector {
    pub fn new(script: Vec<Behavior>, fallback: Behavior) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            connects: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
            attempt: Mutex::new(None),
            protocols: Mutex::new(Vec::new()),
            log: Arc::new(UpstreamLog::default()),
        })
    }

    pub fn always(behavior: Behavior) -> Arc<Self> {
        Self::new(Vec::new(), behavior)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Whether each attempt was given a response listener.
    pub fn listeners(&self) -> Vec<bool> {
        self.listeners.lock().unwrap().clone()
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        self.protocols.lock().unwrap().clone()
    }

    pub fn upstream_resets(&self) -> usize {
        self.log.resets.load(Ordering::SeqCst)
    }

    /// Reset the latest attempt from the upstream side.
    pub fn reset_attempt(&self, reason: StreamResetReason) {
        let listener = self.attempt.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_reset_stream(reason);
        }
    }
}

impl StreamConnector for ScriptedConnector {
    fn connect(
        &self,
        _host: &Arc<Host>,
        protocol: &Protocol,
        listener: Option<Arc<dyn UpstreamEventListener>>,
    ) -> Result<Arc<dyn RequestSender>, PoolFailure> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().push(listener.is_some());
        *self.attempt.lock().unwrap() = listener.clone();
        self.protocols.lock().unwrap().push(protocol.clone());

        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if let Behavior::Fail = behavior {
            return Err(PoolFailure::ConnectionFailure("refused".into()));
        }
        Ok(Arc::new(ScriptedSender {
            behavior,
            listener,
            log: self.log.clone(),
        }))
    }
}

struct ScriptedSender {
    behavior: Behavior,
    listener: Option<Arc<dyn UpstreamEventListener>>,
    log: Arc<UpstreamLog>,
}

impl ScriptedSender {
    fn finish(&self) {
        let Some(listener) = &self.listener else {
            return;
        };
        match &self.behavior {
            Behavior::Respond { status, body } => {
                let headers: HeaderMap = [(":status", status.to_string())].into_iter().collect();
                listener.on_receive(headers, body.map(|b| Bytes::from_static(b.as_bytes())), None);
            }
            Behavior::Reset(reason) => listener.on_reset_stream(*reason),
            Behavior::Fail | Behavior::Hang => {}
        }
    }
}

impl RequestSender for ScriptedSender {
    fn append_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), SendError> {
        self.log.headers.lock().unwrap().push(headers);
        if end_stream {
            self.finish();
        }
        Ok(())
    }

    fn append_data(&self, data: Bytes, end_stream: bool) -> Result<(), SendError> {
        self.log.data.lock().unwrap().push(data);
        if end_stream {
            self.finish();
        }
        Ok(())
    }

    fn append_trailers(&self, _trailers: HeaderMap) -> Result<(), SendError> {
        self.finish();
        Ok(())
    }

    fn reset(&self, _reason: StreamResetReason) {
        self.log.resets.fetch_add(1, Ordering::SeqCst);
    }
}

// --- Observability ---

/// Access log that keeps `(response code, response flags)` per record.
#[derive(Default)]
pub struct CountingAccessLog {
    records: Mutex<Vec<(Option<u16>, String)>>,
    bytes_received: Mutex<Vec<u64>>,
}

impl CountingAccessLog {
    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn records(&self) -> Vec<(Option<u16>, String)> {
        self.records.lock().unwrap().clone()
    }

    pub fn bytes_received(&self) -> Vec<u64> {
        self.bytes_received.lock().unwrap().clone()
    }
}

impl AccessLog for CountingAccessLog {
    fn log(&self, _: Option<&HeaderMap>, _: Option<&HeaderMap>, info: &RequestInfo) {
        self.records
            .lock()
            .unwrap()
            .push((info.response_code(), info.response_flags().to_string()));
        self.bytes_received
            .lock()
            .unwrap()
            .push(info.bytes_received());
    }
}

// --- Filters ---

/// Factory built from a closure.
pub struct FnFactory<F>(pub F);

impl<F> StreamFilterChainFactory for FnFactory<F>
where
    F: Fn(&mut dyn FilterChainFactoryCallbacks) + Send + Sync,
{
    fn create_filter_chain(&self, callbacks: &mut dyn FilterChainFactoryCallbacks) {
        (self.0)(callbacks)
    }
}

// --- Wiring ---

pub struct Harness {
    pub proxy: Proxy,
    pub connector: Arc<ScriptedConnector>,
    pub clusters: Arc<StaticClusterManager>,
    pub access_log: Arc<CountingAccessLog>,
}

impl Harness {
    pub fn new(config: &ProxyConfig, connector: Arc<ScriptedConnector>) -> Self {
        Self::with(config, connector, |builder| builder)
    }

    pub fn with(
        config: &ProxyConfig,
        connector: Arc<ScriptedConnector>,
        customize: impl FnOnce(ProxyContextBuilder) -> ProxyContextBuilder,
    ) -> Self {
        let clusters = Arc::new(StaticClusterManager::from_config(
            &config.clusters,
            connector.clone(),
        ));
        let access_log = Arc::new(CountingAccessLog::default());
        let routers = RouterHandle::new(StaticRouter::from_config(config));
        let builder = ProxyContext::from_config(config, routers, clusters.clone())
            .access_log(access_log.clone());
        let context = customize(builder).build();

        Self {
            proxy: Proxy::new(context, ConnectionInfo::default()),
            connector,
            clusters,
            access_log,
        }
    }

    /// Send a headers-only request and wait for the stream to finish.
    pub async fn get(&self, path: &str) -> Arc<MockResponseSender> {
        let sender = MockResponseSender::new();
        let stream = self.proxy.new_stream(Some(sender.clone()));
        stream.on_receive(request(path), None, None).await.unwrap();
        sender
    }
}

/// Yield to spawned tasks until `ready` holds.
pub async fn until(ready: impl Fn() -> bool) {
    while !ready() {
        tokio::task::yield_now().await;
    }
}
