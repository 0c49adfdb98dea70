//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Route rule selected:
//!     → timeouts.rs (route budgets, then per-request header overrides)
//!     → stream arms the global and per-try timers
//! Upstream attempt failed:
//!     → retries.rs (classify failure, check attempts and cluster budget)
//!     → backoff.rs (optional delay before the next attempt)
//! ```
//!
//! # Design Decisions
//! - The global timeout is never retried
//! - A cluster-wide budget caps concurrently outstanding retries
//! - Backoff defaults to zero; retries redrive immediately

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use retries::{RetryBudget, RetryCheck, RetryPolicy, RetryState};
pub use timeouts::{parse_proxy_timeout, Timeout};
