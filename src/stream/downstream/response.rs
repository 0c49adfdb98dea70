//! Response side: upstream failures, hijacks and downstream emission.

use bytes::Bytes;

use crate::observability::metrics;
use crate::protocol::{codes, headers, HeaderMap, Protocol};
use crate::resilience::RetryCheck;
use crate::stream::filter::DirectReply;
use crate::stream::reason::{ResponseFlag, StreamResetReason};
use crate::stream::upstream::UpstreamRequest;

use super::DownStream;

impl DownStream {
    /// React to a reset of the in-flight attempt: retry, hijack an error
    /// response, or reset downstream once the response has started.
    pub(super) fn on_upstream_reset(&mut self, reason: StreamResetReason) {
        let global = reason == StreamResetReason::UpstreamGlobalTimeout;
        let pending = self
            .upstream_request
            .as_ref()
            .is_some_and(UpstreamRequest::retry_pending);
        if !global && pending {
            self.cell.flags.clear_upstream_reset();
            return;
        }

        if !global && !self.oneway && !self.cell.flags.response_started() {
            let check = self
                .retry_state
                .as_mut()
                .map(|rs| rs.retry(None, Some(reason)));
            match check {
                Some(RetryCheck::ShouldRetry) => {
                    tracing::info!(
                        stream_id = self.id,
                        reason = %reason,
                        "Upstream reset, retrying"
                    );
                    self.setup_retry(true);
                    self.record_upstream_outcome(false);
                    self.cell.flags.clear_upstream_reset();
                    return;
                }
                Some(RetryCheck::RetryOverflow) => {
                    self.request_info.set_response_flag(ResponseFlag::UpstreamOverflow);
                }
                Some(RetryCheck::NoRetry) | None => {}
            }
        }

        self.clean_up();

        if self.cell.flags.response_started() {
            tracing::error!(
                stream_id = self.id,
                reason = %reason,
                "Upstream reset after response started, resetting downstream"
            );
            self.reset_stream();
            return;
        }

        self.record_upstream_outcome(false);
        if let Some(request) = self.upstream_request.as_ref() {
            request.cell.reset_stream();
        }

        let code = if reason.is_timeout() {
            self.request_info.set_response_flag(ResponseFlag::UpstreamRequestTimeout);
            codes::TIMEOUT_EXCEPTION
        } else {
            self.request_info.set_response_flag(reason.response_flag());
            codes::NO_HEALTHY_UPSTREAM
        };
        tracing::error!(stream_id = self.id, reason = %reason, code, "Upstream reset");

        self.cell.flags.clear_upstream_reset();
        self.send_hijack_reply(code);
    }

    pub(super) fn receive_upstream_headers(&mut self, end: bool) {
        let status = self.resp_headers.as_ref().and_then(HeaderMap::status);

        if !self.hijacked {
            if let Some(code) = status {
                let check = self
                    .retry_state
                    .as_mut()
                    .map(|rs| rs.retry(Some(code), None));
                match check {
                    Some(RetryCheck::ShouldRetry) => {
                        tracing::info!(
                            stream_id = self.id,
                            status = code,
                            "Upstream status, retrying"
                        );
                        self.setup_retry(end);
                        self.record_upstream_outcome(false);
                        return;
                    }
                    Some(RetryCheck::RetryOverflow) => {
                        self.request_info.set_response_flag(ResponseFlag::UpstreamOverflow);
                    }
                    Some(RetryCheck::NoRetry) | None => {}
                }
                if let Some(rs) = self.retry_state.as_mut() {
                    rs.reset();
                }
            }
            self.record_upstream_outcome(status.map_or(true, |code| code < 500));
        }

        self.cell.flags.set_response_started();

        if let (Some(route), Some(headers)) = (self.route.clone(), self.resp_headers.as_mut()) {
            if let Some(rule) = route.route_rule() {
                rule.finalize_response_headers(headers, &self.request_info);
            }
        }

        if end {
            self.on_upstream_response_recv_finished();
        }
        self.append_headers(end);
    }

    /// Feed cluster/host counters and passive health.
    pub(super) fn record_upstream_outcome(&self, success: bool) {
        let Some(cluster) = self.cluster.as_ref() else {
            return;
        };
        let stats = cluster.stats();
        if success {
            stats.upstream_response_success.inc();
        } else {
            stats.upstream_response_failed.inc();
        }
        metrics::record_upstream_response(cluster.name(), success);

        let host = self.upstream_request.as_ref().and_then(|r| r.cell.host());
        if let Some(host) = host {
            if success {
                host.stats().upstream_response_success.inc();
                host.mark_success(cluster.health().healthy_threshold);
            } else {
                host.stats().upstream_response_failed.inc();
                host.mark_failure(cluster.health().unhealthy_threshold);
            }
        }
    }

    fn on_upstream_response_recv_finished(&mut self) {
        if !self.upstream_request_sent {
            if let Some(request) = self.upstream_request.as_ref() {
                request.cell.reset_stream();
            }
        }
        self.clean_up();
    }

    /// Protocol the response frames are in.
    fn response_protocol(&self) -> Protocol {
        match self.upstream_request.as_ref() {
            Some(request) => request.protocol.clone(),
            None => self.upstream_protocol(),
        }
    }

    fn append_headers(&mut self, end: bool) {
        if end {
            self.cell.flags.set_upstream_process_done();
        }
        let Some(headers) = self.resp_headers.as_ref() else {
            return;
        };
        if let Some(code) = headers.status() {
            self.request_info.set_response_code(code);
        }

        if let Some(sender) = self.response_sender.clone() {
            let headers = if self.hijacked {
                headers.clone()
            } else {
                self.convert_headers(&self.response_protocol(), &self.downstream_protocol, headers)
            };
            if let Err(e) = sender.append_headers(headers, end) {
                tracing::warn!(stream_id = self.id, error = %e, "Downstream header write failed");
            }
        }

        if end {
            self.end_stream();
        }
    }

    pub(super) fn append_data(&mut self, end: bool) {
        if end {
            self.cell.flags.set_upstream_process_done();
        }
        let Some(data) = self.resp_data.as_ref() else {
            return;
        };
        let data = Bytes::copy_from_slice(data);
        self.request_info.add_bytes_sent(data.len() as u64);

        if let Some(sender) = self.response_sender.clone() {
            let data = if self.hijacked {
                data
            } else {
                self.convert_data(&self.response_protocol(), &self.downstream_protocol, data)
            };
            if let Err(e) = sender.append_data(data, end) {
                tracing::warn!(stream_id = self.id, error = %e, "Downstream data write failed");
            }
        }

        if end {
            self.end_stream();
        }
    }

    pub(super) fn append_trailers(&mut self) {
        self.cell.flags.set_upstream_process_done();

        if let (Some(sender), Some(trailers)) =
            (self.response_sender.clone(), self.resp_trailers.as_ref())
        {
            let trailers = if self.hijacked {
                trailers.clone()
            } else {
                let from = self.response_protocol();
                self.convert_trailers(&from, &self.downstream_protocol, trailers)
            };
            if let Err(e) = sender.append_trailers(trailers) {
                tracing::warn!(stream_id = self.id, error = %e, "Downstream trailer write failed");
            }
        }

        self.end_stream();
    }

    pub(super) fn send_hijack_reply(&mut self, code: u16) {
        self.send_hijack_reply_with_body(code, None);
    }

    /// Replace the response with a proxy-synthesized one.
    pub(super) fn send_hijack_reply_with_body(&mut self, code: u16, body: Option<&[u8]>) {
        let mut headers = match self.req_headers.as_ref() {
            Some(headers) => headers.clone(),
            None => {
                tracing::warn!(stream_id = self.id, "Hijacking without request headers");
                HeaderMap::new()
            }
        };
        headers.set(headers::STATUS, code.to_string());
        tracing::error!(stream_id = self.id, code, "Sending hijack reply");

        self.request_info.set_response_code(code);
        self.cell.flags.clear_reuse();
        self.resp_headers = Some(headers);
        self.buffers.reclaim(self.resp_data.take());
        self.resp_data = body.map(|b| self.buffers.fill(b));
        self.resp_trailers = None;
        self.direct_response = true;
        self.hijacked = true;
        metrics::record_hijack(code);
    }

    pub(super) fn send_direct_response(&mut self, reply: DirectReply) {
        let code = reply.headers.status();
        tracing::debug!(stream_id = self.id, code, "Filter sent direct response");
        if let Some(code) = code {
            self.request_info.set_response_code(code);
            metrics::record_hijack(code);
        }

        self.cell.flags.clear_reuse();
        self.resp_headers = Some(reply.headers);
        self.buffers.reclaim(self.resp_data.take());
        self.resp_data = reply.body.map(|b| self.buffers.fill(&b));
        self.resp_trailers = reply.trailers;
        self.direct_response = true;
        self.hijacked = true;
    }

    /// Reset the downstream stream locally.
    pub(super) fn reset_stream(&mut self) {
        self.cell.flags.clear_reuse();
        self.cell
            .mark_downstream_reset(self.id, StreamResetReason::LocalReset);
        if let Some(sender) = self.response_sender.as_ref() {
            sender.reset_stream(StreamResetReason::LocalReset);
        }
    }
}
