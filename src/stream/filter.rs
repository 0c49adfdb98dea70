//! Stream filters.
//!
//! Receiver filters see the downstream request before route matching
//! ([`FilterPhase::BeforeRoute`]) or after it ([`FilterPhase::AfterRoute`]).
//! Sender filters see the response before it is emitted downstream. A filter
//! returning [`FilterStatus::Stop`] ends its chain for this pass.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::observability::AccessLog;
use crate::protocol::HeaderMap;
use crate::routing::Route;
use crate::stream::info::RequestInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    Stop,
}

/// Where in the pipeline a receiver filter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPhase {
    BeforeRoute,
    AfterRoute,
}

pub trait StreamReceiverFilter: Send {
    fn on_receive(&mut self, ctx: &mut ReceiveContext<'_>) -> FilterStatus;

    /// Called exactly once when the stream is cleaned up.
    fn on_destroy(&mut self) {}
}

pub trait StreamSenderFilter: Send {
    fn on_send(&mut self, ctx: &mut SendContext<'_>) -> FilterStatus;

    /// Called exactly once when the stream is cleaned up.
    fn on_destroy(&mut self) {}
}

/// Registration surface offered to filter chain factories.
pub trait FilterChainFactoryCallbacks {
    fn add_receiver_filter(&mut self, filter: Box<dyn StreamReceiverFilter>, phase: FilterPhase);

    fn add_sender_filter(&mut self, filter: Box<dyn StreamSenderFilter>);

    fn add_access_log(&mut self, log: Arc<dyn AccessLog>);
}

/// Installs filters on every new stream.
pub trait StreamFilterChainFactory: Send + Sync {
    fn create_filter_chain(&self, callbacks: &mut dyn FilterChainFactoryCallbacks);
}

/// Synthesized response requested by a filter.
#[derive(Debug, Clone, Default)]
pub struct DirectReply {
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub trailers: Option<HeaderMap>,
}

/// Requests a receiver filter made; applied once its chain finishes.
#[derive(Debug, Default)]
pub(crate) struct FilterActions {
    pub hijack: Option<u16>,
    pub direct: Option<DirectReply>,
    pub rematch: bool,
    pub convert: Option<bool>,
}

impl FilterActions {
    fn ends_chain(&self) -> bool {
        self.hijack.is_some() || self.direct.is_some()
    }
}

/// View of the downstream request handed to receiver filters.
pub struct ReceiveContext<'a> {
    pub(crate) phase: FilterPhase,
    pub(crate) headers: &'a mut Option<HeaderMap>,
    pub(crate) data: &'a mut Option<BytesMut>,
    pub(crate) trailers: &'a mut Option<HeaderMap>,
    pub(crate) route: Option<&'a Arc<dyn Route>>,
    pub(crate) info: &'a RequestInfo,
    pub(crate) actions: &'a mut FilterActions,
}

impl ReceiveContext<'_> {
    pub fn phase(&self) -> FilterPhase {
        self.phase
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    pub fn headers_mut(&mut self) -> Option<&mut HeaderMap> {
        self.headers.as_mut()
    }

    pub fn set_headers(&mut self, headers: HeaderMap) {
        *self.headers = Some(headers);
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn set_data(&mut self, data: &[u8]) {
        let buf = self.data.get_or_insert_with(BytesMut::new);
        buf.clear();
        buf.extend_from_slice(data);
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub fn set_trailers(&mut self, trailers: HeaderMap) {
        *self.trailers = Some(trailers);
    }

    /// Matched route; `None` before route matching or when nothing matched.
    pub fn route(&self) -> Option<&Arc<dyn Route>> {
        self.route
    }

    pub fn request_info(&self) -> &RequestInfo {
        self.info
    }

    /// Answer with a hijack code instead of forwarding.
    pub fn send_hijack_reply(&mut self, code: u16) {
        self.actions.hijack = Some(code);
    }

    /// Answer with the given frames instead of forwarding.
    pub fn send_direct_response(&mut self, reply: DirectReply) {
        self.actions.direct = Some(reply);
    }

    /// Run route matching again after this pass.
    pub fn rematch_route(&mut self) {
        self.actions.rematch = true;
    }

    /// Enable or disable protocol conversion for this stream.
    pub fn set_convert(&mut self, convert: bool) {
        self.actions.convert = Some(convert);
    }
}

/// View of the response handed to sender filters.
pub struct SendContext<'a> {
    pub(crate) request_headers: Option<&'a HeaderMap>,
    pub(crate) headers: &'a mut Option<HeaderMap>,
    pub(crate) data: &'a mut Option<BytesMut>,
    pub(crate) trailers: &'a mut Option<HeaderMap>,
    pub(crate) info: &'a RequestInfo,
}

impl SendContext<'_> {
    pub fn request_headers(&self) -> Option<&HeaderMap> {
        self.request_headers
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    pub fn headers_mut(&mut self) -> Option<&mut HeaderMap> {
        self.headers.as_mut()
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn set_data(&mut self, data: &[u8]) {
        let buf = self.data.get_or_insert_with(BytesMut::new);
        buf.clear();
        buf.extend_from_slice(data);
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    pub fn set_trailers(&mut self, trailers: HeaderMap) {
        *self.trailers = Some(trailers);
    }

    pub fn request_info(&self) -> &RequestInfo {
        self.info
    }
}

/// Run the receiver filters registered for `phase`.
pub(crate) fn run_receiver_filters(
    filters: &mut [(Box<dyn StreamReceiverFilter>, FilterPhase)],
    ctx: &mut ReceiveContext<'_>,
) {
    for (filter, phase) in filters.iter_mut() {
        if *phase != ctx.phase {
            continue;
        }
        let status = filter.on_receive(ctx);
        if status == FilterStatus::Stop || ctx.actions.ends_chain() {
            break;
        }
    }
}

pub(crate) fn run_sender_filters(
    filters: &mut [Box<dyn StreamSenderFilter>],
    ctx: &mut SendContext<'_>,
) {
    for filter in filters.iter_mut() {
        if filter.on_send(ctx) == FilterStatus::Stop {
            break;
        }
    }
}
