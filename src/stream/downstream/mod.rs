//! The downstream stream: one per decoded request.
//!
//! A [`DownStream`] is created by [`crate::proxy::Proxy::new_stream`], filled
//! by [`DownStream::on_receive`] and then driven by its own task through the
//! phase pipeline. The task owns every field below; upstream listeners,
//! timers and the downstream reset listener only see the shared
//! [`StreamCell`].

mod lifecycle;
mod pipeline;
mod request;
mod response;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::task::JoinHandle;

use crate::load_balancer::{LoadBalancerContext, MetadataMatchCriteria};
use crate::observability::{metrics, AccessLog, Span};
use crate::protocol::{DecodeError, HeaderMap, Protocol};
use crate::proxy::{ActiveStreams, ConnectionInfo, ProxyContext};
use crate::resilience::{RetryState, Timeout};
use crate::routing::Route;
use crate::stream::cell::StreamCell;
use crate::stream::filter::{
    FilterChainFactoryCallbacks, FilterPhase, StreamReceiverFilter, StreamSenderFilter,
};
use crate::stream::info::RequestInfo;
use crate::stream::phase::{Phase, Signal};
use crate::stream::pool::{PooledStream, StreamBuffers};
use crate::stream::sender::{DownstreamResetHandle, ResponseSender};
use crate::stream::timer::{panic_message, Timer};
use crate::stream::upstream::UpstreamRequest;
use crate::upstream::{ClusterInfo, ClusterSnapshot};

pub struct DownStream {
    id: u32,
    cell: Arc<StreamCell>,
    buffers: StreamBuffers,
    context: Arc<ProxyContext>,
    connection: Arc<ConnectionInfo>,
    active: ActiveStreams,

    response_sender: Option<Arc<dyn ResponseSender>>,
    oneway: bool,
    downstream_protocol: Protocol,

    route: Option<Arc<dyn Route>>,
    snapshot: Option<Arc<dyn ClusterSnapshot>>,
    cluster: Option<Arc<ClusterInfo>>,
    timeout: Timeout,
    retry_state: Option<RetryState>,
    upstream_request: Option<UpstreamRequest>,
    per_try_timer: Option<Timer>,
    global_timer: Option<Timer>,

    request_info: RequestInfo,
    span: Option<Box<dyn Span>>,

    req_headers: Option<HeaderMap>,
    req_data: Option<BytesMut>,
    req_trailers: Option<HeaderMap>,
    resp_headers: Option<HeaderMap>,
    resp_data: Option<BytesMut>,
    resp_trailers: Option<HeaderMap>,

    /// Every request frame has been handed to the upstream side.
    downstream_recv_done: bool,
    upstream_request_sent: bool,
    /// A synthesized response is pending emission.
    direct_response: bool,
    hijacked: bool,
    receiver_filters_again: bool,
    no_convert: bool,
    /// Decided at cleanup; the record goes back to the pool on drop.
    recycle: bool,

    receiver_filters: Vec<(Box<dyn StreamReceiverFilter>, FilterPhase)>,
    sender_filters: Vec<Box<dyn StreamSenderFilter>>,
    access_logs: Vec<Arc<dyn AccessLog>>,
}

impl DownStream {
    pub(crate) fn new(
        context: Arc<ProxyContext>,
        connection: Arc<ConnectionInfo>,
        active: ActiveStreams,
        record: PooledStream,
        response_sender: Option<Arc<dyn ResponseSender>>,
    ) -> Self {
        let PooledStream { cell, buffers } = record;
        let id = cell.id();

        if let Some(sender) = &response_sender {
            sender.add_event_listener(Arc::new(DownstreamResetHandle::new(cell.clone(), id)));
        }

        let mut request_info = RequestInfo::new();
        request_info.set_downstream_addresses(connection.local_addr, connection.remote_addr);

        let mut stream = Self {
            id,
            cell,
            buffers,
            oneway: response_sender.is_none(),
            downstream_protocol: context.settings.downstream_protocol.clone(),
            response_sender,
            context,
            connection,
            active,
            route: None,
            snapshot: None,
            cluster: None,
            timeout: Timeout::default(),
            retry_state: None,
            upstream_request: None,
            per_try_timer: None,
            global_timer: None,
            request_info,
            span: None,
            req_headers: None,
            req_data: None,
            req_trailers: None,
            resp_headers: None,
            resp_data: None,
            resp_trailers: None,
            downstream_recv_done: false,
            upstream_request_sent: false,
            direct_response: false,
            hijacked: false,
            receiver_filters_again: false,
            no_convert: false,
            recycle: false,
            receiver_filters: Vec::new(),
            sender_filters: Vec::new(),
            access_logs: Vec::new(),
        };

        let factories = stream.context.filter_factories.clone();
        for factory in &factories {
            factory.create_filter_chain(&mut stream);
        }
        stream
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    pub fn request_info(&self) -> &RequestInfo {
        &self.request_info
    }

    /// Hand the decoded request to the stream and start its pipeline.
    pub fn on_receive(
        mut self,
        headers: HeaderMap,
        data: Option<Bytes>,
        trailers: Option<HeaderMap>,
    ) -> JoinHandle<()> {
        if let Some(tracer) = self.context.tracer.clone() {
            self.span = Some(tracer.start(Some(&headers)));
        }
        self.req_headers = Some(headers);
        self.req_data = data.map(|d| self.buffers.fill(&d));
        self.req_trailers = trailers;
        if let Some(data) = &self.req_data {
            self.request_info.add_bytes_received(data.len() as u64);
        }

        tracing::debug!(
            stream_id = self.id,
            has_data = self.req_data.is_some(),
            has_trailers = self.req_trailers.is_some(),
            "Request received"
        );
        self.spawn(Phase::Init)
    }

    /// Answer a request the codec could not decode.
    pub fn on_decode_error(
        mut self,
        error: DecodeError,
        headers: Option<HeaderMap>,
    ) -> JoinHandle<()> {
        tracing::warn!(stream_id = self.id, error = %error, "Request decode failed");
        self.req_headers = headers;
        self.send_hijack_reply(error.hijack_code());

        let start = match self.check() {
            Signal::Respond => self.respond_phase(),
            _ => Phase::End,
        };
        self.spawn(start)
    }

    /// Run the pipeline on its own task under a supervisor that contains
    /// failures of the pipeline task.
    fn spawn(self, start: Phase) -> JoinHandle<()> {
        let id = self.id;
        let pipeline = tokio::spawn(self.run(start));

        tokio::spawn(async move {
            match pipeline.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(stream_id = id, error = %e, "Stream pipeline failed");
                }
                Err(e) if e.is_panic() => {
                    let panic = e.into_panic();
                    tracing::error!(
                        stream_id = id,
                        panic = %panic_message(panic.as_ref()),
                        "Stream pipeline panicked"
                    );
                    metrics::record_internal_panic("pipeline");
                }
                Err(_) => {
                    tracing::warn!(stream_id = id, "Stream pipeline cancelled");
                }
            }
        })
    }
}

impl LoadBalancerContext for DownStream {
    fn metadata_match_criteria(&self) -> Option<&MetadataMatchCriteria> {
        self.route.as_ref()?.route_rule()?.metadata_match_criteria()
    }

    fn downstream_headers(&self) -> Option<&HeaderMap> {
        self.req_headers.as_ref()
    }

    fn downstream_connection(&self) -> Option<&ConnectionInfo> {
        Some(&self.connection)
    }
}

impl FilterChainFactoryCallbacks for DownStream {
    fn add_receiver_filter(&mut self, filter: Box<dyn StreamReceiverFilter>, phase: FilterPhase) {
        self.receiver_filters.push((filter, phase));
    }

    fn add_sender_filter(&mut self, filter: Box<dyn StreamSenderFilter>) {
        self.sender_filters.push(filter);
    }

    fn add_access_log(&mut self, log: Arc<dyn AccessLog>) {
        self.access_logs.push(log);
    }
}
