//! Proxy entry points.
//!
//! # Data Flow
//! ```text
//! Listener startup:
//!     ProxyConfig → ProxyContext (routers, clusters, converters, logs, filters)
//!
//! Per downstream connection:
//!     Proxy::new(context, connection)
//!     → Proxy::new_stream(response sender)   one per decoded request
//!     → DownStream::on_receive(frames)       spawns the stream pipeline
//!     → Proxy::on_connection_close           resets streams still active
//! ```

pub mod connection;
pub mod context;

use std::sync::Arc;

use dashmap::DashMap;

use crate::observability::metrics;
use crate::stream::cell::StreamCell;
use crate::stream::{DownStream, ResponseSender, StreamResetReason};

pub use connection::{ConnectionId, ConnectionInfo};
pub use context::{ProxyContext, ProxyContextBuilder};

/// Streams of one connection that have not finished cleanup.
pub(crate) type ActiveStreams = Arc<DashMap<u32, Arc<StreamCell>>>;

/// Stream controller for one downstream connection.
pub struct Proxy {
    context: Arc<ProxyContext>,
    connection: Arc<ConnectionInfo>,
    active: ActiveStreams,
}

impl Proxy {
    pub fn new(context: Arc<ProxyContext>, connection: ConnectionInfo) -> Self {
        tracing::debug!(
            connection_id = %connection.id,
            remote = ?connection.remote_addr,
            "Proxy attached to connection"
        );
        Self {
            context,
            connection: Arc::new(connection),
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.context
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    /// Create a stream for a decoded request. Without a response sender the
    /// request is oneway: it is forwarded and no response is awaited.
    pub fn new_stream(&self, response_sender: Option<Arc<dyn ResponseSender>>) -> DownStream {
        let record = self.context.pool.acquire();
        let cell = record.cell.clone();
        let stream = DownStream::new(
            self.context.clone(),
            self.connection.clone(),
            self.active.clone(),
            record,
            response_sender,
        );
        self.active.insert(stream.id(), cell);
        metrics::record_stream_started(&self.context.settings.name);
        tracing::debug!(
            stream_id = stream.id(),
            connection_id = %self.connection.id,
            oneway = stream.is_oneway(),
            "New stream"
        );
        stream
    }

    /// Streams of this connection not yet cleaned up.
    pub fn active_streams(&self) -> usize {
        self.active.len()
    }

    /// Reset every active stream of a closing connection.
    pub fn on_connection_close(&self) {
        let streams: Vec<(u32, Arc<StreamCell>)> = self
            .active
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        tracing::info!(
            connection_id = %self.connection.id,
            streams = streams.len(),
            "Connection closed, resetting active streams"
        );
        for (id, cell) in streams {
            cell.mark_downstream_reset(id, StreamResetReason::ConnectionTermination);
        }
    }
}
