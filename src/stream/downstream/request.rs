//! Request side: dispatch to upstream attempts, timers and retries.

use std::sync::Arc;

use bytes::Bytes;

use crate::observability::metrics;
use crate::protocol::{codes, HeaderMap, Protocol};
use crate::resilience::{parse_proxy_timeout, RetryState};
use crate::stream::cell::StreamCell;
use crate::stream::error::{SendError, StreamError};
use crate::stream::reason::{ResponseFlag, StreamResetReason};
use crate::stream::timer::Timer;
use crate::stream::upstream::{AttemptCell, UpstreamHandle, UpstreamRequest};
use crate::upstream::{ClusterInfo, ConnectionPool, RequestSender, UpstreamEventListener};

use super::DownStream;

impl DownStream {
    /// Resolve the route into a cluster and dispatch the request headers.
    pub(super) fn receive_headers(&mut self, end: bool) {
        if end {
            self.downstream_recv_done = true;
        }

        let Some(route) = self.route.clone() else {
            self.request_info.set_response_flag(ResponseFlag::NoRouteFound);
            self.send_hijack_reply(codes::ROUTER_UNAVAILABLE);
            return;
        };
        self.request_info.set_route_name(route.name());

        if let Some(direct) = route.direct_response_rule() {
            tracing::debug!(stream_id = self.id, status = direct.status, "Direct response route");
            let body = direct.body.as_deref().map(str::as_bytes);
            self.send_hijack_reply_with_body(direct.status, body);
            return;
        }

        let Some(rule) = route.route_rule() else {
            self.request_info.set_response_flag(ResponseFlag::NoRouteFound);
            self.send_hijack_reply(codes::ROUTER_UNAVAILABLE);
            return;
        };

        let Some(snapshot) = self.snapshot.clone() else {
            self.request_info.set_response_flag(ResponseFlag::NoRouteFound);
            self.send_hijack_reply(codes::ROUTER_UNAVAILABLE);
            return;
        };
        let cluster = snapshot.cluster_info();
        self.cluster = Some(cluster.clone());

        let pool = match self.initialize_upstream_connection_pool() {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!(stream_id = self.id, error = %e, "No upstream connection pool");
                self.request_info.set_response_flag(ResponseFlag::NoHealthyUpstream);
                self.send_hijack_reply(codes::NO_HEALTHY_UPSTREAM);
                return;
            }
        };

        self.timeout = parse_proxy_timeout(rule.timeout(), self.req_headers.as_ref());
        self.retry_state = Some(RetryState::new(rule.retry_policy(), cluster));
        if let Some(headers) = self.req_headers.as_mut() {
            rule.finalize_request_headers(headers, &self.request_info);
        }

        self.start_attempt(pool);
        self.upstream_append_headers(end);
        if end {
            self.on_upstream_request_sent();
        }
    }

    pub(super) fn receive_data(&mut self, end: bool) {
        if self.cell.flags.upstream_process_done() {
            return;
        }
        if end {
            self.downstream_recv_done = true;
            self.on_upstream_request_sent();
        }

        self.upstream_append_data(end);

        if self.cell.flags.upstream_process_done() {
            self.clean_stream();
        }
    }

    pub(super) fn receive_trailers(&mut self) {
        if self.cell.flags.upstream_process_done() {
            return;
        }
        self.downstream_recv_done = true;
        self.on_upstream_request_sent();

        self.upstream_append_trailers();

        if self.cell.flags.upstream_process_done() {
            self.clean_stream();
        }
    }

    /// Protocol spoken to the upstream; `Auto` follows the downstream side.
    pub(super) fn upstream_protocol(&self) -> Protocol {
        let configured = self
            .route
            .as_ref()
            .and_then(|route| route.route_rule())
            .and_then(|rule| rule.upstream_protocol().cloned())
            .unwrap_or_else(|| self.context.settings.upstream_protocol.clone());
        if configured.is_auto() {
            self.downstream_protocol.clone()
        } else {
            configured
        }
    }

    fn initialize_upstream_connection_pool(
        &self,
    ) -> Result<Arc<dyn ConnectionPool>, StreamError> {
        let snapshot = self.snapshot.as_ref().ok_or(StreamError::NoClusterSnapshot)?;
        let protocol = self.upstream_protocol();
        self.context
            .cluster_manager
            .conn_pool_for_cluster(self, snapshot, &protocol)
            .ok_or_else(|| StreamError::NoHealthyUpstream {
                cluster: snapshot.cluster_info().name().to_string(),
            })
    }

    fn start_attempt(&mut self, pool: Arc<dyn ConnectionPool>) {
        let protocol = pool.protocol().clone();
        let request = UpstreamRequest::new(Some(pool), protocol);
        self.cell.set_attempt(Some(request.cell.clone()));
        self.upstream_request = Some(request);
    }

    fn attempt_handle(&self, attempt: Arc<AttemptCell>) -> UpstreamHandle {
        UpstreamHandle::new(self.cell.clone(), self.id, attempt)
    }

    fn upstream_append_headers(&mut self, end: bool) {
        let Some(request) = self.upstream_request.as_ref() else {
            return;
        };
        let Some(pool) = request.pool.clone() else {
            return;
        };
        let attempt = request.cell.clone();
        let protocol = request.protocol.clone();

        let handle = Arc::new(self.attempt_handle(attempt.clone()));
        let listener: Option<Arc<dyn UpstreamEventListener>> = if self.oneway {
            None
        } else {
            Some(handle.clone())
        };

        let stream = match pool.new_stream(listener) {
            Ok(stream) => stream,
            Err(failure) => {
                tracing::debug!(
                    stream_id = self.id,
                    error = %failure,
                    "Upstream stream not opened"
                );
                handle.on_reset_stream(failure.reset_reason());
                return;
            }
        };

        stream.host.stats().upstream_request_total.inc();
        self.request_info.set_upstream_host(stream.host.address());
        attempt.attach(stream.sender.clone(), stream.host.clone());

        let headers = match &self.req_headers {
            Some(headers) => self.convert_headers(&self.downstream_protocol, &protocol, headers),
            None => HeaderMap::new(),
        };
        tracing::debug!(
            stream_id = self.id,
            host = %stream.host.address(),
            protocol = %protocol,
            end,
            "Request headers sent upstream"
        );
        if let Err(e) = stream.sender.append_headers(headers, end) {
            self.on_upstream_send_error(attempt, e);
            return;
        }
        if end {
            self.mark_send_complete();
        }
    }

    fn upstream_append_data(&mut self, end: bool) {
        let Some((attempt, sender, protocol)) = self.live_attempt() else {
            return;
        };
        let Some(data) = self.req_data.as_ref() else {
            return;
        };
        let data = Bytes::copy_from_slice(data);
        let data = self.convert_data(&self.downstream_protocol, &protocol, data);

        if let Err(e) = sender.append_data(data, end) {
            self.on_upstream_send_error(attempt, e);
            return;
        }
        if end {
            self.mark_send_complete();
        }
    }

    fn upstream_append_trailers(&mut self) {
        let Some((attempt, sender, protocol)) = self.live_attempt() else {
            return;
        };
        let Some(trailers) = self.req_trailers.as_ref() else {
            return;
        };
        let trailers = self.convert_trailers(&self.downstream_protocol, &protocol, trailers);

        if let Err(e) = sender.append_trailers(trailers) {
            self.on_upstream_send_error(attempt, e);
            return;
        }
        self.mark_send_complete();
    }

    /// Attempt with an attached upstream sender.
    fn live_attempt(&self) -> Option<(Arc<AttemptCell>, Arc<dyn RequestSender>, Protocol)> {
        let request = self.upstream_request.as_ref()?;
        let sender = request.cell.sender()?;
        Some((request.cell.clone(), sender, request.protocol.clone()))
    }

    fn mark_send_complete(&mut self) {
        if let Some(request) = self.upstream_request.as_mut() {
            request.send_complete = true;
        }
    }

    fn on_upstream_send_error(&self, attempt: Arc<AttemptCell>, error: SendError) {
        tracing::warn!(stream_id = self.id, error = %error, "Upstream write failed");
        self.attempt_handle(attempt)
            .on_reset_stream(StreamResetReason::ConnectionTermination);
    }

    /// The whole request is upstream: arm the timers.
    fn on_upstream_request_sent(&mut self) {
        if !self.upstream_request_sent {
            self.upstream_request_sent = true;
            self.request_info.mark_request_received();
        }

        if self.oneway {
            return;
        }
        let live = self
            .upstream_request
            .as_ref()
            .is_some_and(|request| request.pool.is_some());
        if !live {
            return;
        }

        if self.global_timer.is_none() && !self.timeout.global.is_zero() {
            let cell = self.cell.clone();
            let id = self.id;
            let cluster = self.cluster.clone();
            self.global_timer = Some(Timer::new(
                self.timeout.global,
                "global_timeout",
                move || on_global_timeout(&cell, id, cluster.as_deref()),
            ));
        }
        self.arm_per_try_timer();
    }

    fn arm_per_try_timer(&mut self) {
        self.per_try_timer = None;
        if self.timeout.per_try.is_zero() {
            return;
        }
        let Some(request) = self.upstream_request.as_ref() else {
            return;
        };

        let cell = self.cell.clone();
        let id = self.id;
        let attempt = request.cell.clone();
        let cluster = self.cluster.clone();
        self.per_try_timer = Some(Timer::new(
            self.timeout.per_try,
            "per_try_timeout",
            move || on_per_try_timeout(&cell, id, &attempt, cluster.as_deref()),
        ));
    }

    /// Abandon the current attempt; the pipeline redrives from `Retry`.
    pub(super) fn setup_retry(&mut self, end: bool) {
        if let Some(request) = self.upstream_request.as_ref() {
            request.cell.set_retry_pending();
            if !end {
                request.cell.reset_stream();
            }
        }
        self.per_try_timer = None;
    }

    /// Resend the buffered request on a fresh attempt.
    pub(super) async fn do_retry(&mut self) {
        self.cell.flags.clear_reuse();
        self.cell.clear_response();
        self.resp_headers = None;
        self.buffers.reclaim(self.resp_data.take());
        self.resp_trailers = None;

        let backoff = self
            .retry_state
            .as_ref()
            .map_or(std::time::Duration::ZERO, RetryState::backoff);
        if !backoff.is_zero() {
            tracing::debug!(
                stream_id = self.id,
                backoff_ms = backoff.as_millis() as u64,
                "Backing off before retry"
            );
            tokio::time::sleep(backoff).await;
            if self.cell.flags.upstream_reset() || self.cell.flags.downstream_reset() {
                return;
            }
        }

        let pool = match self.initialize_upstream_connection_pool() {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!(stream_id = self.id, error = %e, "No upstream for retry");
                self.request_info.set_response_flag(ResponseFlag::NoHealthyUpstream);
                self.send_hijack_reply(codes::NO_HEALTHY_UPSTREAM);
                self.clean_up();
                return;
            }
        };

        let attempts = self.retry_state.as_ref().map_or(1, RetryState::attempts);
        tracing::info!(stream_id = self.id, attempt = attempts, "Retrying upstream request");

        self.start_attempt(pool);
        let has_data = self.req_data.is_some();
        let has_trailers = self.req_trailers.is_some();
        self.upstream_append_headers(!has_data && !has_trailers);
        if has_data {
            self.upstream_append_data(!has_trailers);
        }
        if has_trailers {
            self.upstream_append_trailers();
        }

        self.downstream_recv_done = true;
        self.on_upstream_request_sent();
    }

    pub(super) fn convert_headers(
        &self,
        from: &Protocol,
        to: &Protocol,
        headers: &HeaderMap,
    ) -> HeaderMap {
        if self.no_convert || from == to {
            return headers.clone();
        }
        match self.context.converters.convert_headers(from, to, headers) {
            Ok(converted) => converted,
            Err(e) => {
                self.conversion_failed(from, to, "headers", &e);
                headers.clone()
            }
        }
    }

    pub(super) fn convert_data(&self, from: &Protocol, to: &Protocol, data: Bytes) -> Bytes {
        if self.no_convert || from == to {
            return data;
        }
        match self.context.converters.convert_data(from, to, &data) {
            Ok(converted) => converted,
            Err(e) => {
                self.conversion_failed(from, to, "data", &e);
                data
            }
        }
    }

    pub(super) fn convert_trailers(
        &self,
        from: &Protocol,
        to: &Protocol,
        trailers: &HeaderMap,
    ) -> HeaderMap {
        if self.no_convert || from == to {
            return trailers.clone();
        }
        match self.context.converters.convert_trailers(from, to, trailers) {
            Ok(converted) => converted,
            Err(e) => {
                self.conversion_failed(from, to, "trailers", &e);
                trailers.clone()
            }
        }
    }

    fn conversion_failed(
        &self,
        from: &Protocol,
        to: &Protocol,
        frame: &'static str,
        error: &dyn std::error::Error,
    ) {
        tracing::warn!(
            stream_id = self.id,
            from = %from,
            to = %to,
            frame,
            error = %error,
            "Protocol conversion failed, forwarding original"
        );
        metrics::record_conversion_failure(from.as_str(), to.as_str());
    }
}

fn on_global_timeout(cell: &Arc<StreamCell>, id: u32, cluster: Option<&ClusterInfo>) {
    if cell.id() != id || cell.flags.cleaned() {
        return;
    }
    tracing::warn!(stream_id = id, "Global timeout fired");

    if let Some(cluster) = cluster {
        cluster.stats().upstream_request_timeout.inc();
        metrics::record_upstream_timeout(cluster.name(), "global");
    }
    cell.clear_reuse_for(id);
    if let Some(attempt) = cell.attempt_for(id) {
        if let Some(host) = attempt.host() {
            host.stats().upstream_request_timeout.inc();
        }
        attempt.reset_stream();
    }
    // Marked on the stream directly: a global timeout also ends a retry in backoff.
    cell.mark_upstream_reset(id, StreamResetReason::UpstreamGlobalTimeout);
}

fn on_per_try_timeout(
    cell: &Arc<StreamCell>,
    id: u32,
    attempt: &Arc<AttemptCell>,
    cluster: Option<&ClusterInfo>,
) {
    if cell.id() != id || cell.flags.cleaned() {
        return;
    }
    if cell.flags.response_started() || attempt.retry_pending() {
        return;
    }
    tracing::warn!(stream_id = id, "Per-try timeout fired");

    if let Some(cluster) = cluster {
        cluster.stats().upstream_request_timeout.inc();
        metrics::record_upstream_timeout(cluster.name(), "per_try");
    }
    if let Some(host) = attempt.host() {
        host.stats().upstream_request_timeout.inc();
    }
    cell.clear_reuse_for(id);
    attempt.reset_stream();
    UpstreamHandle::new(cell.clone(), id, attempt.clone())
        .on_reset_stream(StreamResetReason::UpstreamPerTryTimeout);
}
