//! Stream controller errors.

use thiserror::Error;

use super::phase::Phase;

/// Failure reported by a transport while writing a frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("stream already closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Internal failure of the stream controller itself.
///
/// These never reach the transport; the stream is terminated and the error
/// is logged by the task supervisor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("phase pipeline re-entered {passes} times without finishing (last phase {phase:?})")]
    PhaseCycleExhausted { passes: usize, phase: Phase },

    #[error("no cluster snapshot selected for this stream")]
    NoClusterSnapshot,

    #[error("no healthy upstream in cluster {cluster}")]
    NoHealthyUpstream { cluster: String },
}
