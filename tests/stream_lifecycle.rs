//! Stream lifecycle: forwarding, cleanup, resets and record reuse.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use common::*;
use mesh_proxy::protocol::HeaderMap;
use mesh_proxy::stream::{
    FilterChainFactoryCallbacks, FilterPhase, FilterStatus, ReceiveContext, ResponseSender,
    SendContext, SendError, StreamEventListener, StreamReceiverFilter, StreamResetReason,
    StreamSenderFilter,
};

#[tokio::test]
async fn test_request_forwarded_and_response_emitted() {
    let h = Harness::new(&config(), ScriptedConnector::always(Behavior::ok()));

    let sender = h.get("/users").await;

    assert_eq!(sender.status(), Some(200));
    assert_eq!(sender.body(), Some(Bytes::from_static(b"hello")));
    assert!(matches!(sender.frames()[0], Frame::Headers(_, false)));
    assert!(matches!(sender.frames()[1], Frame::Data(_, true)));
    assert!(sender.resets().is_empty());

    let upstream = h.connector.log.headers.lock().unwrap().clone();
    assert_eq!(upstream.len(), 1);
    assert_eq!(upstream[0].get(":path"), Some("/users"));

    assert_eq!(h.connector.connects(), 1);
    assert_eq!(h.access_log.records(), vec![(Some(200), "-".to_string())]);
    assert_eq!(h.proxy.active_streams(), 0);
}

#[tokio::test]
async fn test_request_body_and_trailers_forwarded() {
    let h = Harness::new(&config(), ScriptedConnector::always(Behavior::ok()));
    let sender = MockResponseSender::new();
    let stream = h.proxy.new_stream(Some(sender.clone()));
    let trailers = [("grpc-status", "0")].into_iter().collect();

    stream
        .on_receive(request("/"), Some(Bytes::from_static(b"payload")), Some(trailers))
        .await
        .unwrap();

    let data = h.connector.log.data.lock().unwrap().clone();
    assert_eq!(data, vec![Bytes::from_static(b"payload")]);
    assert_eq!(sender.status(), Some(200));
    assert_eq!(h.access_log.count(), 1);
}

#[tokio::test]
async fn test_downstream_reset_cleans_up_once() {
    let h = Harness::new(&config(), ScriptedConnector::always(Behavior::Hang));
    let sender = MockResponseSender::new();
    let stream = h.proxy.new_stream(Some(sender.clone()));
    let handle = stream.on_receive(request("/"), None, None);

    until(|| h.connector.connects() == 1).await;
    sender.reset_from_peer(StreamResetReason::RemoteReset);
    sender.reset_from_peer(StreamResetReason::ConnectionTermination);
    h.proxy.on_connection_close();
    handle.await.unwrap();

    assert!(sender.frames().is_empty());
    assert_eq!(h.connector.upstream_resets(), 1);
    assert_eq!(h.access_log.records(), vec![(None, "-".to_string())]);
    assert_eq!(h.proxy.active_streams(), 0);
    assert_eq!(h.proxy.context().pool().idle(), 0);
}

/// Downstream sender whose header write coincides with an upstream reset.
struct ResetOnHeaders {
    inner: Arc<MockResponseSender>,
    connector: Arc<ScriptedConnector>,
}

impl ResponseSender for ResetOnHeaders {
    fn append_headers(&self, headers: HeaderMap, end_stream: bool) -> Result<(), SendError> {
        self.inner.append_headers(headers, end_stream)?;
        self.connector.reset_attempt(StreamResetReason::RemoteReset);
        Ok(())
    }

    fn append_data(&self, data: Bytes, end_stream: bool) -> Result<(), SendError> {
        self.inner.append_data(data, end_stream)
    }

    fn append_trailers(&self, trailers: HeaderMap) -> Result<(), SendError> {
        self.inner.append_trailers(trailers)
    }

    fn reset_stream(&self, reason: StreamResetReason) {
        self.inner.reset_stream(reason)
    }

    fn add_event_listener(&self, listener: Arc<dyn StreamEventListener>) {
        self.inner.add_event_listener(listener)
    }
}

#[tokio::test]
async fn test_upstream_reset_after_response_started_resets_downstream() {
    let h = Harness::new(&config(), ScriptedConnector::always(Behavior::ok()));
    let sender = MockResponseSender::new();
    let downstream = Arc::new(ResetOnHeaders {
        inner: sender.clone(),
        connector: h.connector.clone(),
    });

    h.proxy
        .new_stream(Some(downstream))
        .on_receive(request("/"), None, None)
        .await
        .unwrap();

    let frames = sender.frames();
    assert_eq!(frames.len(), 1);
    assert!(matches!(&frames[0], Frame::Headers(headers, false) if headers.status() == Some(200)));
    assert_eq!(sender.body(), None);
    assert_eq!(sender.resets(), vec![StreamResetReason::LocalReset]);
    assert_eq!(h.connector.connects(), 1);
    assert_eq!(h.access_log.count(), 1);
    assert_eq!(h.proxy.active_streams(), 0);
    assert_eq!(h.proxy.context().pool().idle(), 0);
}

#[tokio::test]
async fn test_connection_close_resets_every_active_stream() {
    let h = Harness::new(&config(), ScriptedConnector::always(Behavior::Hang));
    let senders = [MockResponseSender::new(), MockResponseSender::new()];
    let handles: Vec<_> = senders
        .iter()
        .map(|s| {
            h.proxy
                .new_stream(Some(s.clone()))
                .on_receive(request("/"), None, None)
        })
        .collect();

    until(|| h.connector.connects() == 2).await;
    assert_eq!(h.proxy.active_streams(), 2);
    h.proxy.on_connection_close();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(senders.iter().all(|s| s.frames().is_empty()));
    assert_eq!(h.connector.upstream_resets(), 2);
    assert_eq!(h.access_log.count(), 2);
    assert_eq!(h.proxy.active_streams(), 0);
}

#[tokio::test]
async fn test_finished_stream_record_is_reused() {
    let h = Harness::new(&config(), ScriptedConnector::always(Behavior::ok()));
    let pool = h.proxy.context().pool();

    h.get("/").await;
    assert_eq!(pool.idle(), 1);
    assert_eq!(pool.created(), 1);

    h.get("/").await;
    assert_eq!(pool.reused(), 1);
    assert_eq!(pool.created(), 1);
    assert_eq!(h.access_log.count(), 2);
}

#[tokio::test]
async fn test_hijacked_stream_record_is_not_reused() {
    let cfg = TestConfig {
        routes: r#"
[[routes]]
name = "api"
path_prefix = "/api"
cluster = "backend"
"#,
        ..Default::default()
    }
    .build();
    let h = Harness::new(&cfg, ScriptedConnector::always(Behavior::ok()));

    let sender = h.get("/other").await;

    assert_eq!(sender.status(), Some(404));
    assert_eq!(h.proxy.context().pool().idle(), 0);
}

#[tokio::test]
async fn test_oneway_request_passes_no_listener() {
    let h = Harness::new(&config(), ScriptedConnector::always(Behavior::Hang));
    let stream = h.proxy.new_stream(None);
    assert!(stream.is_oneway());

    // Nothing will ever answer, so the stream must not wait for a notification.
    tokio::time::timeout(Duration::from_secs(5), stream.on_receive(request("/"), None, None))
        .await
        .expect("oneway stream waited for a response")
        .unwrap();

    assert_eq!(h.connector.listeners(), vec![false]);
    assert_eq!(h.connector.upstream_resets(), 0);
    assert_eq!(h.access_log.count(), 1);
    assert_eq!(h.proxy.active_streams(), 0);
}

#[tokio::test]
async fn test_oneway_request_is_never_retried() {
    let h = Harness::new(&config(), ScriptedConnector::always(Behavior::Fail));

    let stream = h.proxy.new_stream(None);
    stream.on_receive(request("/"), None, None).await.unwrap();

    assert_eq!(h.connector.connects(), 1);
    assert_eq!(h.access_log.count(), 1);
    assert_eq!(h.proxy.active_streams(), 0);
}

struct Tracking {
    destroyed: Arc<AtomicUsize>,
}

impl StreamReceiverFilter for Tracking {
    fn on_receive(&mut self, _: &mut ReceiveContext<'_>) -> FilterStatus {
        FilterStatus::Continue
    }

    fn on_destroy(&mut self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

impl StreamSenderFilter for Tracking {
    fn on_send(&mut self, ctx: &mut SendContext<'_>) -> FilterStatus {
        if let Some(headers) = ctx.headers_mut() {
            headers.set("x-filtered", "yes");
        }
        FilterStatus::Continue
    }

    fn on_destroy(&mut self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

fn tracking_harness(behavior: Behavior) -> (Harness, Arc<AtomicUsize>, Arc<CountingAccessLog>) {
    let destroyed = Arc::new(AtomicUsize::new(0));
    let stream_log = Arc::new(CountingAccessLog::default());
    let factory = {
        let destroyed = destroyed.clone();
        let stream_log = stream_log.clone();
        FnFactory(move |cb: &mut dyn FilterChainFactoryCallbacks| {
            let receiver = Tracking {
                destroyed: destroyed.clone(),
            };
            let sender = Tracking {
                destroyed: destroyed.clone(),
            };
            cb.add_receiver_filter(Box::new(receiver), FilterPhase::BeforeRoute);
            cb.add_sender_filter(Box::new(sender));
            cb.add_access_log(stream_log.clone());
        })
    };
    let h = Harness::with(&config(), ScriptedConnector::always(behavior), |b| {
        b.filter_factory(Arc::new(factory))
    });
    (h, destroyed, stream_log)
}

#[tokio::test]
async fn test_filters_run_and_are_destroyed_once() {
    let (h, destroyed, stream_log) = tracking_harness(Behavior::ok());

    let sender = h.get("/").await;

    assert_eq!(sender.headers().unwrap().get("x-filtered"), Some("yes"));
    assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    assert_eq!(stream_log.count(), 1);
    assert_eq!(h.access_log.count(), 1);
}

#[tokio::test]
async fn test_filters_destroyed_once_on_reset() {
    let (h, destroyed, stream_log) = tracking_harness(Behavior::Hang);
    let sender = MockResponseSender::new();
    let handle = h
        .proxy
        .new_stream(Some(sender.clone()))
        .on_receive(request("/"), None, None);

    until(|| h.connector.connects() == 1).await;
    sender.reset_from_peer(StreamResetReason::RemoteReset);
    h.proxy.on_connection_close();
    handle.await.unwrap();

    assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    assert_eq!(stream_log.count(), 1);
}

#[tokio::test]
async fn test_reset_after_completion_is_ignored() {
    let (h, destroyed, stream_log) = tracking_harness(Behavior::ok());
    let sender = MockResponseSender::new();

    h.proxy
        .new_stream(Some(sender.clone()))
        .on_receive(request("/"), None, None)
        .await
        .unwrap();
    sender.reset_from_peer(StreamResetReason::RemoteReset);
    h.proxy.on_connection_close();
    tokio::task::yield_now().await;

    assert_eq!(sender.status(), Some(200));
    assert!(sender.resets().is_empty());
    assert_eq!(stream_log.count(), 1);
    assert_eq!(h.access_log.records(), vec![(Some(200), "-".to_string())]);
    assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    assert_eq!(h.connector.upstream_resets(), 0);
    assert_eq!(h.proxy.active_streams(), 0);

    // The late reset does not leak into the next stream on the same record.
    let next = h.get("/").await;
    assert_eq!(next.status(), Some(200));
    assert_eq!(h.proxy.context().pool().reused(), 1);
    assert_eq!(h.access_log.count(), 2);
}

#[tokio::test]
async fn test_dropped_stream_is_cleaned_up() {
    let h = Harness::new(&config(), ScriptedConnector::always(Behavior::ok()));
    let sender = MockResponseSender::new();

    drop(h.proxy.new_stream(Some(sender.clone())));

    assert_eq!(sender.resets(), vec![StreamResetReason::LocalReset]);
    assert_eq!(h.access_log.count(), 1);
    assert_eq!(h.proxy.active_streams(), 0);
    assert_eq!(h.proxy.context().pool().idle(), 0);
}
