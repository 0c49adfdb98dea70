//! Access logging.

use std::time::UNIX_EPOCH;

use serde_json::{json, Value};

use crate::protocol::HeaderMap;
use crate::stream::RequestInfo;

/// Sink for one record per finished stream.
pub trait AccessLog: Send + Sync {
    fn log(
        &self,
        request_headers: Option<&HeaderMap>,
        response_headers: Option<&HeaderMap>,
        info: &RequestInfo,
    );
}

/// Writes each record as a single JSON line under the `access_log` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonAccessLog;

impl JsonAccessLog {
    pub fn record(
        request_headers: Option<&HeaderMap>,
        response_headers: Option<&HeaderMap>,
        info: &RequestInfo,
    ) -> Value {
        let start_ms = info
            .start_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let millis = |d: Option<std::time::Duration>| d.map(|d| d.as_millis() as u64);

        json!({
            "start_time_ms": start_ms,
            "route": info.route_name(),
            "path": request_headers.and_then(|h| h.get(crate::protocol::headers::PATH)),
            "host": request_headers.and_then(|h| h.get(crate::protocol::headers::HOST)),
            "upstream_host": info.upstream_host(),
            "downstream_remote": info.downstream_remote_address().map(|a| a.to_string()),
            "response_code": info.response_code(),
            "response_status": response_headers.and_then(HeaderMap::status),
            "response_flags": info.response_flags().to_string(),
            "bytes_received": info.bytes_received(),
            "bytes_sent": info.bytes_sent(),
            "request_received_ms": millis(info.request_received_duration()),
            "response_received_ms": millis(info.response_received_duration()),
            "duration_ms": millis(info.finished_duration()),
        })
    }
}

impl AccessLog for JsonAccessLog {
    fn log(
        &self,
        request_headers: Option<&HeaderMap>,
        response_headers: Option<&HeaderMap>,
        info: &RequestInfo,
    ) {
        let record = Self::record(request_headers, response_headers, info);
        tracing::info!(target: "access_log", "{}", record);
    }
}
