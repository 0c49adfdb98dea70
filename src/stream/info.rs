//! Per-request bookkeeping reported to access logs and spans.

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use super::reason::{ResponseFlag, ResponseFlags};

/// Timing, size and outcome of one downstream request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    start_time: SystemTime,
    start: Instant,
    request_received: Option<Duration>,
    response_received: Option<Duration>,
    finished: Option<Duration>,
    bytes_received: u64,
    bytes_sent: u64,
    response_code: Option<u16>,
    response_flags: ResponseFlags,
    upstream_host: Option<String>,
    route_name: Option<String>,
    downstream_local_address: Option<SocketAddr>,
    downstream_remote_address: Option<SocketAddr>,
}

impl RequestInfo {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            start: Instant::now(),
            request_received: None,
            response_received: None,
            finished: None,
            bytes_received: 0,
            bytes_sent: 0,
            response_code: None,
            response_flags: ResponseFlags::default(),
            upstream_host: None,
            route_name: None,
            downstream_local_address: None,
            downstream_remote_address: None,
        }
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub(crate) fn mark_request_received(&mut self) {
        self.request_received = Some(self.start.elapsed());
    }

    pub(crate) fn mark_response_received(&mut self) {
        self.response_received = Some(self.start.elapsed());
    }

    pub(crate) fn mark_finished(&mut self) -> Duration {
        let elapsed = self.start.elapsed();
        self.finished = Some(elapsed);
        elapsed
    }

    /// Time from stream start until the request was fully sent upstream.
    pub fn request_received_duration(&self) -> Option<Duration> {
        self.request_received
    }

    /// Time from stream start until the upstream response arrived.
    pub fn response_received_duration(&self) -> Option<Duration> {
        self.response_received
    }

    /// Total stream duration, set at terminal cleanup.
    pub fn finished_duration(&self) -> Option<Duration> {
        self.finished
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub(crate) fn add_bytes_received(&mut self, n: u64) {
        self.bytes_received += n;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub(crate) fn add_bytes_sent(&mut self, n: u64) {
        self.bytes_sent += n;
    }

    pub fn response_code(&self) -> Option<u16> {
        self.response_code
    }

    pub(crate) fn set_response_code(&mut self, code: u16) {
        self.response_code = Some(code);
    }

    pub fn response_flags(&self) -> ResponseFlags {
        self.response_flags
    }

    pub fn has_response_flag(&self, flag: ResponseFlag) -> bool {
        self.response_flags.contains(flag)
    }

    pub(crate) fn set_response_flag(&mut self, flag: ResponseFlag) {
        self.response_flags.insert(flag);
    }

    pub fn upstream_host(&self) -> Option<&str> {
        self.upstream_host.as_deref()
    }

    pub(crate) fn set_upstream_host(&mut self, address: &str) {
        self.upstream_host = Some(address.to_string());
    }

    pub fn route_name(&self) -> Option<&str> {
        self.route_name.as_deref()
    }

    pub(crate) fn set_route_name(&mut self, name: &str) {
        self.route_name = Some(name.to_string());
    }

    pub fn downstream_local_address(&self) -> Option<SocketAddr> {
        self.downstream_local_address
    }

    pub fn downstream_remote_address(&self) -> Option<SocketAddr> {
        self.downstream_remote_address
    }

    pub(crate) fn set_downstream_addresses(
        &mut self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) {
        self.downstream_local_address = local;
        self.downstream_remote_address = remote;
    }
}

impl Default for RequestInfo {
    fn default() -> Self {
        Self::new()
    }
}
