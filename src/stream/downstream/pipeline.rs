//! Phase dispatch and the state check that follows each phase.

use crate::observability::metrics;
use crate::protocol::codes;
use crate::stream::error::StreamError;
use crate::stream::filter::{
    run_receiver_filters, run_sender_filters, FilterActions, FilterPhase, ReceiveContext,
    SendContext,
};
use crate::stream::phase::{Phase, Signal, Step};
use crate::stream::reason::ResponseFlag;
use crate::stream::upstream::UpstreamRequest;

use super::DownStream;

impl DownStream {
    /// Drive the pipeline from `start` until it exits or the pass cap is hit.
    pub(super) async fn run(mut self, start: Phase) -> Result<(), StreamError> {
        let passes = self.context.settings.max_phase_passes;
        let mut phase = start;

        for _ in 0..passes {
            self.cell.clean_notify();
            match self.run_phases(phase).await {
                None => return Ok(()),
                Some(next) => phase = next,
            }
        }

        tracing::error!(
            stream_id = self.id,
            passes,
            phase = ?phase,
            "Phase pipeline did not finish, terminating stream"
        );
        metrics::record_phase_cycle_exhausted(&self.context.settings.name);
        self.force_terminate();
        Err(StreamError::PhaseCycleExhausted { passes, phase })
    }

    /// One pass. `None` once the stream exits, otherwise the phase the next
    /// pass starts at.
    async fn run_phases(&mut self, start: Phase) -> Option<Phase> {
        let mut phase = start;
        for _ in 0..Phase::COUNT {
            let step = self.run_phase(phase).await;
            match step.signal {
                Signal::Continue => phase = step.next,
                Signal::Exit => return None,
                Signal::Rematch => return Some(Phase::MatchRoute),
                Signal::Retry => return Some(Phase::Retry),
                Signal::Respond => return Some(self.respond_phase()),
            }
        }
        Some(phase)
    }

    async fn run_phase(&mut self, phase: Phase) -> Step {
        tracing::debug!(stream_id = self.id, phase = ?phase, "Entering phase");

        match phase {
            Phase::Init => Step::advance(Phase::DownFilter),

            Phase::DownFilter => {
                self.run_receive_filters(FilterPhase::BeforeRoute);
                Step::checked(Phase::MatchRoute, self.check())
            }

            Phase::MatchRoute => {
                self.match_route();
                Step::checked(Phase::DownFilterAfterRoute, self.check())
            }

            Phase::DownFilterAfterRoute => {
                self.run_receive_filters(FilterPhase::AfterRoute);
                Step::checked(Phase::DownRecvHeader, self.check())
            }

            Phase::DownRecvHeader => {
                let end = self.req_data.is_none() && self.req_trailers.is_none();
                self.receive_headers(end);
                Step::checked(Phase::DownRecvData, self.check())
            }

            Phase::DownRecvData => {
                if self.req_data.is_none() || self.downstream_recv_done {
                    return Step::advance(Phase::DownRecvTrailer);
                }
                let end = self.req_trailers.is_none();
                self.receive_data(end);
                Step::checked(Phase::DownRecvTrailer, self.check())
            }

            Phase::DownRecvTrailer => {
                if self.req_trailers.is_none() || self.downstream_recv_done {
                    return Step::advance(Phase::Oneway);
                }
                self.receive_trailers();
                Step::checked(Phase::Oneway, self.check())
            }

            Phase::Oneway => {
                if !self.oneway {
                    return Step::advance(Phase::Retry);
                }
                self.clean_stream();
                Step::checked(Phase::Retry, self.check())
            }

            Phase::Retry => {
                let pending = self
                    .upstream_request
                    .as_ref()
                    .is_some_and(UpstreamRequest::retry_pending);
                if !pending {
                    return Step::advance(Phase::WaitNotify);
                }
                self.do_retry().await;
                Step::checked(Phase::WaitNotify, self.check())
            }

            Phase::WaitNotify => {
                let signal = self.wait_notify().await;
                Step::checked(Phase::UpFilter, signal)
            }

            Phase::UpFilter => {
                self.run_send_filters();
                if self.upstream_request.is_none() {
                    // Synthesized responses have no live attempt.
                    let protocol = self.upstream_protocol();
                    self.upstream_request = Some(UpstreamRequest::new(None, protocol));
                }
                Step::checked(Phase::UpRecvHeader, self.check())
            }

            Phase::UpRecvHeader => {
                if self.resp_headers.is_none() {
                    return Step::advance(Phase::UpRecvData);
                }
                let end = self.resp_data.is_none() && self.resp_trailers.is_none();
                self.receive_upstream_headers(end);
                Step::checked(Phase::UpRecvData, self.check())
            }

            Phase::UpRecvData => {
                if self.resp_data.is_none() {
                    return Step::advance(Phase::UpRecvTrailer);
                }
                let end = self.resp_trailers.is_none();
                self.append_data(end);
                Step::checked(Phase::UpRecvTrailer, self.check())
            }

            Phase::UpRecvTrailer => {
                if self.resp_trailers.is_none() {
                    return Step::advance(Phase::End);
                }
                self.append_trailers();
                Step::checked(Phase::End, self.check())
            }

            Phase::End => Step::exit(),
        }
    }

    /// Inspect stream state after a phase and decide where control goes.
    pub(super) fn check(&mut self) -> Signal {
        if self.cell.id() != self.id || self.cell.flags.cleaned() {
            return Signal::Exit;
        }

        let mut signal = Signal::Continue;

        if self.cell.flags.upstream_reset() {
            if let Some(reason) = self.cell.upstream_reset_reason() {
                self.on_upstream_reset(reason);
            }
            signal = Signal::Exit;
        }

        if self.cell.flags.downstream_reset() {
            self.on_downstream_reset();
            return Signal::Exit;
        }

        if self.cell.flags.cleaned() {
            return Signal::Exit;
        }

        if self.direct_response {
            self.direct_response = false;
            return Signal::Respond;
        }

        if self.cell.flags.upstream_process_done() {
            signal = Signal::Exit;
        }

        let retry_pending = self
            .upstream_request
            .as_ref()
            .is_some_and(UpstreamRequest::retry_pending);
        if !self.hijacked && retry_pending {
            return Signal::Retry;
        }

        if self.receiver_filters_again {
            self.receiver_filters_again = false;
            return Signal::Rematch;
        }

        signal
    }

    /// Suspend until an upstream response, a reset or a retry setup.
    async fn wait_notify(&mut self) -> Signal {
        let cell = self.cell.clone();
        loop {
            let signal = self.check();
            if signal != Signal::Continue {
                return signal;
            }
            if self.take_upstream_response() {
                return Signal::Continue;
            }
            cell.wait_notify().await;
        }
    }

    fn take_upstream_response(&mut self) -> bool {
        let Some(response) = self.cell.take_response() else {
            return false;
        };
        self.request_info.mark_response_received();
        self.resp_headers = Some(response.headers);
        self.resp_data = response.data.map(|d| self.buffers.fill(&d));
        self.resp_trailers = response.trailers;
        tracing::debug!(stream_id = self.id, "Upstream response received");
        true
    }

    pub(super) fn respond_phase(&self) -> Phase {
        if self.oneway {
            Phase::Oneway
        } else {
            Phase::UpFilter
        }
    }

    fn run_receive_filters(&mut self, phase: FilterPhase) {
        if self.receiver_filters.is_empty() {
            return;
        }
        let mut actions = FilterActions::default();
        let mut ctx = ReceiveContext {
            phase,
            headers: &mut self.req_headers,
            data: &mut self.req_data,
            trailers: &mut self.req_trailers,
            route: self.route.as_ref(),
            info: &self.request_info,
            actions: &mut actions,
        };
        run_receiver_filters(&mut self.receiver_filters, &mut ctx);
        self.apply_filter_actions(actions);
    }

    fn apply_filter_actions(&mut self, actions: FilterActions) {
        if let Some(convert) = actions.convert {
            self.no_convert = !convert;
        }
        if actions.rematch {
            self.receiver_filters_again = true;
        }
        if let Some(reply) = actions.direct {
            self.send_direct_response(reply);
        } else if let Some(code) = actions.hijack {
            self.send_hijack_reply(code);
        }
    }

    fn run_send_filters(&mut self) {
        if self.sender_filters.is_empty() {
            return;
        }
        let mut ctx = SendContext {
            request_headers: self.req_headers.as_ref(),
            headers: &mut self.resp_headers,
            data: &mut self.resp_data,
            trailers: &mut self.resp_trailers,
            info: &self.request_info,
        };
        run_sender_filters(&mut self.sender_filters, &mut ctx);
    }

    fn match_route(&mut self) {
        let Some(router) = self.context.routers.load() else {
            tracing::warn!(stream_id = self.id, "No router configured");
            self.request_info.set_response_flag(ResponseFlag::NoRouteFound);
            self.send_hijack_reply(codes::ROUTER_UNAVAILABLE);
            return;
        };

        if let Some(previous) = self.snapshot.take() {
            self.context.cluster_manager.put_cluster_snapshot(previous);
        }
        self.cluster = None;

        self.route = self
            .req_headers
            .as_ref()
            .and_then(|headers| router.match_route(headers));
        let Some(route) = self.route.clone() else {
            tracing::debug!(stream_id = self.id, "No route matched");
            return;
        };

        if let Some(rule) = route.route_rule() {
            let cluster = rule.cluster_name();
            self.snapshot = self.context.cluster_manager.get_cluster_snapshot(&cluster);
            if self.snapshot.is_none() {
                tracing::warn!(
                    stream_id = self.id,
                    cluster = %cluster,
                    "Cluster snapshot not found"
                );
            }
        }
        tracing::debug!(stream_id = self.id, route = %route.name(), "Route matched");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::{ProxyConfig, ProxySettings};
    use crate::protocol::{HeaderMap, Protocol};
    use crate::proxy::{ConnectionInfo, Proxy, ProxyContext};
    use crate::routing::{RouterHandle, StaticRouter};
    use crate::stream::filter::{
        FilterChainFactoryCallbacks, FilterPhase, FilterStatus, ReceiveContext,
        StreamFilterChainFactory, StreamReceiverFilter,
    };
    use crate::stream::{Phase, StreamError};
    use crate::upstream::{
        Host, PoolFailure, RequestSender, StaticClusterManager, StreamConnector,
        UpstreamEventListener,
    };

    struct Refusing;

    impl StreamConnector for Refusing {
        fn connect(
            &self,
            _: &Arc<Host>,
            _: &Protocol,
            _: Option<Arc<dyn UpstreamEventListener>>,
        ) -> Result<Arc<dyn RequestSender>, PoolFailure> {
            Err(PoolFailure::ConnectionFailure("refused".into()))
        }
    }

    struct AlwaysRematch;

    impl StreamReceiverFilter for AlwaysRematch {
        fn on_receive(&mut self, ctx: &mut ReceiveContext<'_>) -> FilterStatus {
            ctx.rematch_route();
            FilterStatus::Continue
        }
    }

    struct RematchFactory;

    impl StreamFilterChainFactory for RematchFactory {
        fn create_filter_chain(&self, callbacks: &mut dyn FilterChainFactoryCallbacks) {
            callbacks.add_receiver_filter(Box::new(AlwaysRematch), FilterPhase::AfterRoute);
        }
    }

    #[tokio::test]
    async fn test_endless_rematch_exhausts_passes() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [[routes]]
            name = "teapot"
            direct_response = { status = 418 }
            "#,
        )
        .unwrap();
        let context = ProxyContext::builder(
            ProxySettings::default(),
            RouterHandle::new(StaticRouter::from_config(&config)),
            Arc::new(StaticClusterManager::new(Vec::new(), Arc::new(Refusing))),
        )
        .filter_factory(Arc::new(RematchFactory))
        .build();
        let proxy = Proxy::new(context, ConnectionInfo::default());

        let mut stream = proxy.new_stream(None);
        stream.req_headers = Some(HeaderMap::new());

        let result = stream.run(Phase::Init).await;
        assert_eq!(
            result,
            Err(StreamError::PhaseCycleExhausted {
                passes: 5,
                phase: Phase::MatchRoute
            })
        );
        assert_eq!(proxy.active_streams(), 0);
    }
}
