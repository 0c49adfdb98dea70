//! One-shot stream timers.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::observability::metrics;

/// Runs a callback once after a delay unless stopped first.
///
/// Dropping the timer stops it.
#[derive(Debug)]
pub(crate) struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    pub fn new<F>(delay: Duration, name: &'static str, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
                tracing::error!(
                    timer = name,
                    panic = %panic_message(panic.as_ref()),
                    "Timer callback panicked"
                );
                metrics::record_internal_panic(name);
            }
        });
        Self { handle }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let _timer = Timer::new(Duration::from_millis(50), "test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = Timer::new(Duration::from_millis(50), "test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(timer);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_callback_is_contained() {
        let _timer = Timer::new(Duration::from_millis(10), "test", || panic!("boom"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
    }

    #[test]
    fn test_panic_message() {
        let panic = catch_unwind(|| panic!("bad {}", 1)).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "bad 1");
    }
}
