//! Upstream attempts.
//!
//! Each dispatch of the request to an upstream host is an attempt. The
//! pipeline task keeps an [`UpstreamRequest`]; the parts callbacks need live
//! in an [`AttemptCell`], published on the stream cell so timers can reset
//! the in-flight attempt.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::protocol::{HeaderMap, Protocol};
use crate::stream::cell::{lock, StreamCell, UpstreamResponse};
use crate::stream::reason::StreamResetReason;
use crate::upstream::{ConnectionPool, Host, RequestSender, UpstreamEventListener};

/// Shared state of one attempt.
#[derive(Default)]
pub(crate) struct AttemptCell {
    retry_pending: AtomicBool,
    sender: Mutex<Option<Arc<dyn RequestSender>>>,
    host: Mutex<Option<Arc<Host>>>,
}

impl AttemptCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set once this attempt is abandoned for a retry; its callbacks are ignored from then on.
    pub fn retry_pending(&self) -> bool {
        self.retry_pending.load(Ordering::Acquire)
    }

    pub fn set_retry_pending(&self) {
        self.retry_pending.store(true, Ordering::Release);
    }

    pub fn attach(&self, sender: Arc<dyn RequestSender>, host: Arc<Host>) {
        *lock(&self.sender) = Some(sender);
        *lock(&self.host) = Some(host);
    }

    pub fn sender(&self) -> Option<Arc<dyn RequestSender>> {
        lock(&self.sender).clone()
    }

    pub fn host(&self) -> Option<Arc<Host>> {
        lock(&self.host).clone()
    }

    /// Reset the upstream stream locally, once.
    pub fn reset_stream(&self) {
        let sender = lock(&self.sender).take();
        if let Some(sender) = sender {
            sender.reset(StreamResetReason::LocalReset);
        }
    }

    fn detach(&self) {
        lock(&self.sender).take();
    }
}

impl fmt::Debug for AttemptCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptCell")
            .field("retry_pending", &self.retry_pending())
            .field("attached", &lock(&self.sender).is_some())
            .finish()
    }
}

/// Attempt state owned by the pipeline task.
pub(crate) struct UpstreamRequest {
    pub protocol: Protocol,
    /// `None` for the placeholder attempt of a synthesized response.
    pub pool: Option<Arc<dyn ConnectionPool>>,
    pub cell: Arc<AttemptCell>,
    pub send_complete: bool,
}

impl UpstreamRequest {
    pub fn new(pool: Option<Arc<dyn ConnectionPool>>, protocol: Protocol) -> Self {
        Self {
            protocol,
            pool,
            cell: Arc::new(AttemptCell::new()),
            send_complete: false,
        }
    }

    pub fn retry_pending(&self) -> bool {
        self.cell.retry_pending()
    }
}

/// Listener handed to the connection pool for one attempt.
pub(crate) struct UpstreamHandle {
    stream: Arc<StreamCell>,
    stream_id: u32,
    attempt: Arc<AttemptCell>,
}

impl UpstreamHandle {
    pub fn new(stream: Arc<StreamCell>, stream_id: u32, attempt: Arc<AttemptCell>) -> Self {
        Self {
            stream,
            stream_id,
            attempt,
        }
    }
}

impl UpstreamEventListener for UpstreamHandle {
    fn on_receive(&self, headers: HeaderMap, data: Option<Bytes>, trailers: Option<HeaderMap>) {
        if self.attempt.retry_pending() || self.stream.flags.upstream_process_done() {
            tracing::debug!(stream_id = self.stream_id, "Ignoring response of abandoned attempt");
            return;
        }
        let stored = self.stream.store_response(
            self.stream_id,
            UpstreamResponse {
                headers,
                data,
                trailers,
            },
        );
        if !stored {
            tracing::debug!(stream_id = self.stream_id, "Ignoring response of finished stream");
        }
    }

    fn on_reset_stream(&self, reason: StreamResetReason) {
        if self.attempt.retry_pending() {
            tracing::debug!(
                stream_id = self.stream_id,
                %reason,
                "Ignoring reset of abandoned attempt"
            );
            return;
        }
        self.attempt.detach();
        if self.stream.mark_upstream_reset(self.stream_id, reason) {
            tracing::debug!(stream_id = self.stream_id, %reason, "Upstream reset");
        }
    }
}
