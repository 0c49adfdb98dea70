//! Downstream transport seams.

use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::HeaderMap;
use crate::stream::cell::StreamCell;
use crate::stream::error::SendError;
use crate::stream::reason::StreamResetReason;

/// Response side of a downstream stream, implemented by the transport.
pub trait ResponseSender: Send + Sync {
    fn append_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), SendError>;

    fn append_data(&self, data: Bytes, end_stream: bool) -> Result<(), SendError>;

    fn append_trailers(&self, trailers: HeaderMap) -> Result<(), SendError>;

    /// Reset the downstream stream. The transport may report the reset to
    /// registered listeners, synchronously or later.
    fn reset_stream(&self, reason: StreamResetReason);

    /// Register for resets initiated by the transport or the peer.
    fn add_event_listener(&self, listener: Arc<dyn StreamEventListener>);
}

pub trait StreamEventListener: Send + Sync {
    fn on_reset_stream(&self, reason: StreamResetReason);
}

/// Downstream reset listener of one stream.
pub(crate) struct DownstreamResetHandle {
    cell: Arc<StreamCell>,
    stream_id: u32,
}

impl DownstreamResetHandle {
    pub fn new(cell: Arc<StreamCell>, stream_id: u32) -> Self {
        Self { cell, stream_id }
    }
}

impl StreamEventListener for DownstreamResetHandle {
    fn on_reset_stream(&self, reason: StreamResetReason) {
        if self.cell.mark_downstream_reset(self.stream_id, reason) {
            tracing::debug!(stream_id = self.stream_id, %reason, "Downstream reset");
        }
    }
}
