//! State shared between a stream's pipeline task and its callbacks.
//!
//! The pipeline task owns everything else about a stream. Upstream
//! listeners, the downstream reset listener and timers reach the stream only
//! through a [`StreamCell`]; every write they make is checked against the
//! stream id under a lock that [`StreamCell::begin`] also takes, so a
//! callback that outlives its stream never touches the record's next use.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::FutureExt;
use tokio::sync::Notify;

use crate::protocol::HeaderMap;
use crate::stream::reason::StreamResetReason;
use crate::stream::upstream::AttemptCell;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-shot and sticky flags of a stream.
#[derive(Debug, Default)]
pub(crate) struct StreamFlags {
    downstream_reset: AtomicBool,
    upstream_reset: AtomicBool,
    cleaned: AtomicBool,
    log_done: AtomicBool,
    reuse_buffer: AtomicBool,
    upstream_process_done: AtomicBool,
    response_started: AtomicBool,
}

fn claim(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

impl StreamFlags {
    fn reset(&self) {
        for flag in [
            &self.downstream_reset,
            &self.upstream_reset,
            &self.cleaned,
            &self.log_done,
            &self.upstream_process_done,
            &self.response_started,
        ] {
            flag.store(false, Ordering::Release);
        }
        self.reuse_buffer.store(true, Ordering::Release);
    }

    pub fn downstream_reset(&self) -> bool {
        self.downstream_reset.load(Ordering::Acquire)
    }

    pub fn upstream_reset(&self) -> bool {
        self.upstream_reset.load(Ordering::Acquire)
    }

    pub fn clear_upstream_reset(&self) {
        self.upstream_reset.store(false, Ordering::Release);
    }

    pub fn cleaned(&self) -> bool {
        self.cleaned.load(Ordering::Acquire)
    }

    /// `true` for the single caller that wins terminal cleanup.
    pub fn claim_cleanup(&self) -> bool {
        claim(&self.cleaned)
    }

    /// `true` for the single caller that writes the access log.
    pub fn claim_log(&self) -> bool {
        claim(&self.log_done)
    }

    pub fn reuse_buffer(&self) -> bool {
        self.reuse_buffer.load(Ordering::Acquire)
    }

    pub fn clear_reuse(&self) {
        self.reuse_buffer.store(false, Ordering::Release);
    }

    pub fn upstream_process_done(&self) -> bool {
        self.upstream_process_done.load(Ordering::Acquire)
    }

    pub fn set_upstream_process_done(&self) {
        self.upstream_process_done.store(true, Ordering::Release);
    }

    pub fn response_started(&self) -> bool {
        self.response_started.load(Ordering::Acquire)
    }

    pub fn set_response_started(&self) {
        self.response_started.store(true, Ordering::Release);
    }
}

/// Upstream response parked until the pipeline task picks it up.
#[derive(Debug)]
pub(crate) struct UpstreamResponse {
    pub headers: HeaderMap,
    pub data: Option<Bytes>,
    pub trailers: Option<HeaderMap>,
}

#[derive(Debug, Default)]
struct ResetReasons {
    downstream: Option<StreamResetReason>,
    upstream: Option<StreamResetReason>,
}

/// Pooled, shared part of a stream record.
#[derive(Debug, Default)]
pub(crate) struct StreamCell {
    id: AtomicU32,
    pub flags: StreamFlags,
    reasons: Mutex<ResetReasons>,
    notify: Notify,
    response: Mutex<Option<UpstreamResponse>>,
    attempt: Mutex<Option<Arc<AttemptCell>>>,
}

impl StreamCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    /// Start a new use of this record under `id`.
    pub fn begin(&self, id: u32) {
        let mut reasons = lock(&self.reasons);
        let mut response = lock(&self.response);
        let mut attempt = lock(&self.attempt);

        self.id.store(id, Ordering::Release);
        self.flags.reset();
        *reasons = ResetReasons::default();
        *response = None;
        *attempt = None;
        self.clean_notify();
    }

    /// Record a downstream reset for stream `id`; `false` if stale or repeated.
    pub fn mark_downstream_reset(&self, id: u32, reason: StreamResetReason) -> bool {
        let mut reasons = lock(&self.reasons);
        if self.id() != id || !claim(&self.flags.downstream_reset) {
            return false;
        }
        reasons.downstream = Some(reason);
        drop(reasons);
        self.send_notify();
        true
    }

    /// Record an upstream reset for stream `id`; `false` if stale or repeated.
    pub fn mark_upstream_reset(&self, id: u32, reason: StreamResetReason) -> bool {
        let mut reasons = lock(&self.reasons);
        if self.id() != id || !claim(&self.flags.upstream_reset) {
            return false;
        }
        reasons.upstream = Some(reason);
        drop(reasons);
        self.send_notify();
        true
    }

    pub fn downstream_reset_reason(&self) -> Option<StreamResetReason> {
        lock(&self.reasons).downstream
    }

    pub fn upstream_reset_reason(&self) -> Option<StreamResetReason> {
        lock(&self.reasons).upstream
    }

    /// Clear the reuse flag of stream `id` only.
    pub fn clear_reuse_for(&self, id: u32) {
        let _reasons = lock(&self.reasons);
        if self.id() == id {
            self.flags.clear_reuse();
        }
    }

    /// Park an upstream response for stream `id`; `false` if stale.
    pub fn store_response(&self, id: u32, response: UpstreamResponse) -> bool {
        let mut slot = lock(&self.response);
        if self.id() != id || self.flags.cleaned() {
            return false;
        }
        *slot = Some(response);
        drop(slot);
        self.send_notify();
        true
    }

    pub fn take_response(&self) -> Option<UpstreamResponse> {
        lock(&self.response).take()
    }

    pub fn clear_response(&self) {
        *lock(&self.response) = None;
    }

    pub fn set_attempt(&self, attempt: Option<Arc<AttemptCell>>) {
        *lock(&self.attempt) = attempt;
    }

    /// In-flight attempt of stream `id`.
    pub fn attempt_for(&self, id: u32) -> Option<Arc<AttemptCell>> {
        let attempt = lock(&self.attempt);
        if self.id() != id {
            return None;
        }
        attempt.clone()
    }

    pub fn send_notify(&self) {
        self.notify.notify_one();
    }

    /// Drop a pending notification, if any.
    pub fn clean_notify(&self) {
        let _ = self.notify.notified().now_or_never();
    }

    pub async fn wait_notify(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> UpstreamResponse {
        UpstreamResponse {
            headers: HeaderMap::new(),
            data: None,
            trailers: None,
        }
    }

    #[test]
    fn test_reset_marks_are_one_shot() {
        let cell = StreamCell::new();
        cell.begin(7);

        assert!(cell.mark_upstream_reset(7, StreamResetReason::RemoteReset));
        assert!(!cell.mark_upstream_reset(7, StreamResetReason::LocalReset));
        assert_eq!(
            cell.upstream_reset_reason(),
            Some(StreamResetReason::RemoteReset)
        );

        assert!(!cell.mark_downstream_reset(6, StreamResetReason::RemoteReset));
        assert!(!cell.flags.downstream_reset());
    }

    #[test]
    fn test_begin_fences_stale_writers() {
        let cell = StreamCell::new();
        cell.begin(1);
        cell.flags.clear_reuse();
        assert!(cell.store_response(1, response()));

        cell.begin(2);
        assert!(cell.flags.reuse_buffer());
        assert!(cell.take_response().is_none());
        assert!(!cell.store_response(1, response()));
        assert!(!cell.mark_upstream_reset(1, StreamResetReason::RemoteReset));

        cell.clear_reuse_for(1);
        assert!(cell.flags.reuse_buffer());
    }

    #[test]
    fn test_cleanup_claimed_once() {
        let cell = StreamCell::new();
        cell.begin(3);
        assert!(cell.flags.claim_cleanup());
        assert!(!cell.flags.claim_cleanup());
        assert!(!cell.store_response(3, response()));
    }

    #[tokio::test]
    async fn test_notify_slot_holds_one_permit() {
        let cell = StreamCell::new();
        cell.begin(1);
        cell.send_notify();
        cell.send_notify();
        cell.wait_notify().await;

        cell.send_notify();
        cell.clean_notify();
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(20), cell.wait_notify()).await;
        assert!(waited.is_err());
    }
}
