//! Per-stream trace spans.
//!
//! A [`Tracer`] opens one [`Span`] when a stream receives its request; the
//! stream tags it and finishes it during terminal cleanup.

use std::collections::BTreeMap;
use std::time::Instant;

use uuid::Uuid;

use crate::protocol::HeaderMap;

/// Request header carrying an inbound trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Tag keys set by the stream controller.
pub mod tags {
    pub const ROUTE: &str = "route";
    pub const UPSTREAM_HOST: &str = "upstream.host";
    pub const RESPONSE_CODE: &str = "response.code";
    pub const RESPONSE_FLAGS: &str = "response.flags";
    pub const BYTES_RECEIVED: &str = "request.size";
    pub const BYTES_SENT: &str = "response.size";
}

pub trait Span: Send {
    fn trace_id(&self) -> &str;

    fn set_tag(&mut self, key: &'static str, value: String);

    fn finish(&mut self);
}

pub trait Tracer: Send + Sync {
    fn start(&self, headers: Option<&HeaderMap>) -> Box<dyn Span>;
}

/// Tracer that emits finished spans as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn start(&self, headers: Option<&HeaderMap>) -> Box<dyn Span> {
        let trace_id = headers
            .and_then(|h| h.get(TRACE_ID_HEADER))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Box::new(LogSpan {
            trace_id,
            tags: BTreeMap::new(),
            started: Instant::now(),
            finished: false,
        })
    }
}

#[derive(Debug)]
struct LogSpan {
    trace_id: String,
    tags: BTreeMap<&'static str, String>,
    started: Instant,
    finished: bool,
}

impl Span for LogSpan {
    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn set_tag(&mut self, key: &'static str, value: String) {
        self.tags.insert(key, value);
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        tracing::info!(
            target: "mesh_proxy::trace",
            trace_id = %self.trace_id,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            tags = ?self.tags,
            "Span finished"
        );
    }
}
