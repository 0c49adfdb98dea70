//! Lifecycle management for the binary.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → every subscriber (reload loop, metrics) stops
//! ```
//!
//! # Design Decisions
//! - Shutdown is a broadcast: any number of tasks may wait on it
//! - A second trigger is a no-op

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
