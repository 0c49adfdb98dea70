//! Phase enumeration and per-step control signals.

/// Ordered stages of the per-request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Init,
    DownFilter,
    MatchRoute,
    DownFilterAfterRoute,
    DownRecvHeader,
    DownRecvData,
    DownRecvTrailer,
    Oneway,
    Retry,
    WaitNotify,
    UpFilter,
    UpRecvHeader,
    UpRecvData,
    UpRecvTrailer,
    End,
}

impl Phase {
    /// Number of phases, `End` included.
    pub const COUNT: usize = 15;

    /// Default successor; `End` is terminal.
    pub fn next(self) -> Phase {
        match self {
            Phase::Init => Phase::DownFilter,
            Phase::DownFilter => Phase::MatchRoute,
            Phase::MatchRoute => Phase::DownFilterAfterRoute,
            Phase::DownFilterAfterRoute => Phase::DownRecvHeader,
            Phase::DownRecvHeader => Phase::DownRecvData,
            Phase::DownRecvData => Phase::DownRecvTrailer,
            Phase::DownRecvTrailer => Phase::Oneway,
            Phase::Oneway => Phase::Retry,
            Phase::Retry => Phase::WaitNotify,
            Phase::WaitNotify => Phase::UpFilter,
            Phase::UpFilter => Phase::UpRecvHeader,
            Phase::UpRecvHeader => Phase::UpRecvData,
            Phase::UpRecvData => Phase::UpRecvTrailer,
            Phase::UpRecvTrailer => Phase::End,
            Phase::End => Phase::End,
        }
    }
}

/// Control signal produced by the state check that follows a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Advance to the step's next phase.
    Continue,
    /// Run route matching again.
    Rematch,
    /// Redrive the request against a new upstream attempt.
    Retry,
    /// Emit a synthesized response without upstream dispatch.
    Respond,
    /// Stop processing.
    Exit,
}

/// Outcome of running one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Step {
    pub next: Phase,
    pub signal: Signal,
}

impl Step {
    pub fn advance(next: Phase) -> Self {
        Self {
            next,
            signal: Signal::Continue,
        }
    }

    pub fn checked(next: Phase, signal: Signal) -> Self {
        Self { next, signal }
    }

    pub fn exit() -> Self {
        Self {
            next: Phase::End,
            signal: Signal::Exit,
        }
    }
}
