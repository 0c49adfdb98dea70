//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Stream controller produces:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → span.rs (one span per stream, finished at terminal cleanup)
//!     → access_log.rs (one record per finished stream)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Metric updates never block the stream
//! - Access log writers may fail; a failing writer never affects the stream

pub mod access_log;
pub mod logging;
pub mod metrics;
pub mod span;

pub use access_log::{AccessLog, JsonAccessLog};
pub use logging::init_logging;
pub use span::{LogTracer, Span, Tracer};
