//! Terminal cleanup and record recycling.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::observability::metrics;
use crate::observability::span::tags;
use crate::stream::pool::PooledStream;
use crate::stream::reason::StreamResetReason;
use crate::stream::timer::panic_message;

use super::DownStream;

impl DownStream {
    /// Stop timers and release the retry budget. Idempotent.
    pub(super) fn clean_up(&mut self) {
        self.per_try_timer = None;
        self.global_timer = None;
        if let Some(rs) = self.retry_state.as_mut() {
            rs.reset();
        }
    }

    /// Terminal transition; only the first call does anything.
    pub(super) fn clean_stream(&mut self) {
        if !self.cell.flags.claim_cleanup() {
            return;
        }
        let duration = self.request_info.mark_finished();

        if let Some(request) = self.upstream_request.as_ref() {
            if !self.cell.flags.upstream_process_done() && !self.oneway {
                self.cell.flags.set_upstream_process_done();
                request.cell.reset_stream();
            }
        }
        self.cell.set_attempt(None);

        self.clean_up();
        self.destroy_filters();
        metrics::record_stream_finished(&self.context.settings.name, duration);
        self.finish_tracing();
        self.write_log();
        self.active.remove(&self.id);
        self.give_stream();

        tracing::debug!(
            stream_id = self.id,
            duration_ms = duration.as_millis() as u64,
            recycle = self.recycle,
            "Stream finished"
        );
    }

    pub(super) fn end_stream(&mut self) {
        if self.response_sender.is_some() && !self.downstream_recv_done {
            self.cell.flags.clear_reuse();
        }
        self.clean_stream();
    }

    pub(super) fn on_downstream_reset(&mut self) {
        let reason = self
            .cell
            .downstream_reset_reason()
            .unwrap_or(StreamResetReason::LocalReset);
        tracing::debug!(
            stream_id = self.id,
            reason = %reason,
            "Downstream reset, finishing stream"
        );
        metrics::record_downstream_reset(&self.context.settings.name, reason.as_str());
        self.clean_stream();
    }

    /// End a stream the pipeline could not finish.
    pub(super) fn force_terminate(&mut self) {
        self.cell.flags.clear_reuse();
        if self.response_sender.is_some() && !self.cell.flags.upstream_process_done() {
            self.reset_stream();
        }
        self.clean_stream();
    }

    fn give_stream(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.context.cluster_manager.put_cluster_snapshot(snapshot);
        }
        let flags = &self.cell.flags;
        self.recycle =
            flags.reuse_buffer() && !flags.upstream_reset() && !flags.downstream_reset();
    }

    fn destroy_filters(&mut self) {
        for mut filter in std::mem::take(&mut self.sender_filters) {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| filter.on_destroy())) {
                self.filter_panicked(panic.as_ref());
            }
        }
        for (mut filter, _) in std::mem::take(&mut self.receiver_filters) {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| filter.on_destroy())) {
                self.filter_panicked(panic.as_ref());
            }
        }
    }

    fn filter_panicked(&self, panic: &(dyn std::any::Any + Send)) {
        tracing::error!(
            stream_id = self.id,
            panic = %panic_message(panic),
            "Filter destroy hook panicked"
        );
        metrics::record_internal_panic("filter_destroy");
    }

    fn finish_tracing(&mut self) {
        let Some(mut span) = self.span.take() else {
            return;
        };
        let info = &self.request_info;
        if let Some(route) = info.route_name() {
            span.set_tag(tags::ROUTE, route.to_string());
        }
        if let Some(host) = info.upstream_host() {
            span.set_tag(tags::UPSTREAM_HOST, host.to_string());
        }
        if let Some(code) = info.response_code() {
            span.set_tag(tags::RESPONSE_CODE, code.to_string());
        }
        span.set_tag(tags::RESPONSE_FLAGS, info.response_flags().to_string());
        span.set_tag(tags::BYTES_RECEIVED, info.bytes_received().to_string());
        span.set_tag(tags::BYTES_SENT, info.bytes_sent().to_string());
        span.finish();
    }

    fn write_log(&mut self) {
        if !self.cell.flags.claim_log() {
            return;
        }
        let logs = self.context.access_logs.iter().chain(self.access_logs.iter());
        for log in logs {
            let result = catch_unwind(AssertUnwindSafe(|| {
                log.log(
                    self.req_headers.as_ref(),
                    self.resp_headers.as_ref(),
                    &self.request_info,
                )
            }));
            if let Err(panic) = result {
                tracing::error!(
                    stream_id = self.id,
                    panic = %panic_message(panic.as_ref()),
                    "Access log writer panicked"
                );
                metrics::record_internal_panic("access_log");
            }
        }
    }
}

impl Drop for DownStream {
    fn drop(&mut self) {
        if !self.cell.flags.cleaned() {
            tracing::debug!(stream_id = self.id, "Stream dropped before cleanup");
            self.force_terminate();
        }
        if !self.recycle {
            return;
        }

        let req_data = self.req_data.take();
        let resp_data = self.resp_data.take();
        self.buffers.reclaim(req_data);
        self.buffers.reclaim(resp_data);
        let record = PooledStream {
            cell: self.cell.clone(),
            buffers: std::mem::take(&mut self.buffers),
        };
        self.context.pool.release(record);
    }
}
