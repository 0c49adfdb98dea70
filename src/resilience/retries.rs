//! Retry policy and per-stream retry state.
//!
//! A stream gets a [`RetryState`] once a route rule is selected. Every
//! upstream failure (reset or response status) is offered to it; the answer
//! is a [`RetryCheck`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RetryCondition, RetryConfig};
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::stream::StreamResetReason;
use crate::upstream::ClusterInfo;

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCheck {
    ShouldRetry,
    /// Retryable, but attempts or the cluster budget are exhausted.
    RetryOverflow,
    NoRetry,
}

/// Retry policy of a route.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub retry_on: Vec<RetryCondition>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            retry_on: Vec::new(),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn retries_on(&self, condition: RetryCondition) -> bool {
        self.retry_on.contains(&condition)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts,
            retry_on: config.retry_on.clone(),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Cluster-wide cap on concurrently outstanding retries.
#[derive(Debug)]
pub struct RetryBudget {
    max: usize,
    active: AtomicUsize,
}

impl RetryBudget {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            active: AtomicUsize::new(0),
        }
    }

    /// Take one slot; `false` when the budget is exhausted.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.max {
                return false;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Retry bookkeeping of one stream.
#[derive(Debug)]
pub struct RetryState {
    policy: Arc<RetryPolicy>,
    cluster: Arc<ClusterInfo>,
    attempts: u32,
    holding_budget: bool,
}

impl RetryState {
    pub fn new(policy: Arc<RetryPolicy>, cluster: Arc<ClusterInfo>) -> Self {
        Self {
            policy,
            cluster,
            attempts: 1,
            holding_budget: false,
        }
    }

    /// Attempts made so far, the in-flight one included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Decide whether a failed attempt is retried.
    ///
    /// `status` is the upstream response status, `reason` the reset reason;
    /// exactly one of them is expected.
    pub fn retry(
        &mut self,
        status: Option<u16>,
        reason: Option<StreamResetReason>,
    ) -> RetryCheck {
        self.reset();

        if !self.policy.enabled {
            return RetryCheck::NoRetry;
        }
        let Some(condition) = classify(status, reason) else {
            return RetryCheck::NoRetry;
        };
        if !self.policy.retries_on(condition) {
            return RetryCheck::NoRetry;
        }

        if self.attempts >= self.policy.max_attempts || !self.cluster.retry_budget().try_acquire()
        {
            self.cluster.stats().upstream_request_retry_overflow.inc();
            metrics::record_retry_overflow(self.cluster.name());
            return RetryCheck::RetryOverflow;
        }

        self.holding_budget = true;
        self.attempts += 1;
        self.cluster.stats().upstream_request_retry.inc();
        metrics::record_retry(self.cluster.name());
        RetryCheck::ShouldRetry
    }

    /// Delay before redriving the current retry.
    pub fn backoff(&self) -> Duration {
        calculate_backoff(
            self.attempts.saturating_sub(1),
            self.policy.base_delay,
            self.policy.max_delay,
        )
    }

    /// Release the cluster budget slot held by an outstanding retry.
    pub fn reset(&mut self) {
        if self.holding_budget {
            self.holding_budget = false;
            self.cluster.retry_budget().release();
        }
    }
}

impl Drop for RetryState {
    fn drop(&mut self) {
        self.reset();
    }
}

fn classify(status: Option<u16>, reason: Option<StreamResetReason>) -> Option<RetryCondition> {
    if let Some(reason) = reason {
        return match reason {
            StreamResetReason::ConnectionFailed | StreamResetReason::Overflow => {
                Some(RetryCondition::ConnectFailure)
            }
            StreamResetReason::ConnectionTermination
            | StreamResetReason::LocalReset
            | StreamResetReason::RemoteReset => Some(RetryCondition::Reset),
            StreamResetReason::UpstreamPerTryTimeout => Some(RetryCondition::PerTryTimeout),
            StreamResetReason::UpstreamGlobalTimeout => None,
        };
    }
    match status {
        Some(code) if code >= 500 => Some(RetryCondition::ServerError),
        _ => None,
    }
}
