//! Per-request stream controller.
//!
//! # Data Flow
//! ```text
//! Proxy::new_stream
//!     → pool.rs (record with a fresh stream id)
//!     → DownStream::on_receive (request frames)
//!     → phase pipeline, one task per stream:
//!         receiver filters → route match → upstream attempt
//!         → WaitNotify (upstream response, reset or timer)
//!         → sender filters → conversion → ResponseSender
//!     → terminal cleanup (span, access log, record back to the pool)
//! ```
//!
//! # Design Decisions
//! - The pipeline task owns the stream; callbacks only reach the shared cell
//! - Every callback carries the stream id and is dropped when it no longer matches
//! - Reset, cleanup and log transitions are compare-and-swap, first writer wins
//! - Failures become hijack responses or stream resets, never transport errors

pub(crate) mod cell;
mod downstream;
pub mod error;
pub mod filter;
pub mod info;
pub mod phase;
pub mod pool;
pub mod reason;
pub mod sender;
pub(crate) mod timer;
pub(crate) mod upstream;

pub use downstream::DownStream;
pub use error::{SendError, StreamError};
pub use filter::{
    DirectReply, FilterChainFactoryCallbacks, FilterPhase, FilterStatus, ReceiveContext,
    SendContext, StreamFilterChainFactory, StreamReceiverFilter, StreamSenderFilter,
};
pub use info::RequestInfo;
pub use phase::{Phase, Signal};
pub use pool::StreamPool;
pub use reason::{ResponseFlag, ResponseFlags, StreamResetReason};
pub use sender::{ResponseSender, StreamEventListener};
