//! Stream reset reasons and response flags.

use std::fmt;

/// Why a downstream or upstream stream was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamResetReason {
    /// The upstream connection could not be established.
    ConnectionFailed,
    /// The underlying connection was closed.
    ConnectionTermination,
    /// Reset by this proxy.
    LocalReset,
    /// Reset by the peer.
    RemoteReset,
    /// The connection pool had no capacity left.
    Overflow,
    /// The whole-stream timer fired.
    UpstreamGlobalTimeout,
    /// The per-attempt timer fired.
    UpstreamPerTryTimeout,
}

impl StreamResetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamResetReason::ConnectionFailed => "connection_failed",
            StreamResetReason::ConnectionTermination => "connection_termination",
            StreamResetReason::LocalReset => "local_reset",
            StreamResetReason::RemoteReset => "remote_reset",
            StreamResetReason::Overflow => "overflow",
            StreamResetReason::UpstreamGlobalTimeout => "upstream_global_timeout",
            StreamResetReason::UpstreamPerTryTimeout => "upstream_per_try_timeout",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            StreamResetReason::UpstreamGlobalTimeout | StreamResetReason::UpstreamPerTryTimeout
        )
    }

    /// Response flag recorded when this reset ends the stream with a hijack.
    pub fn response_flag(&self) -> ResponseFlag {
        match self {
            StreamResetReason::ConnectionFailed => ResponseFlag::UpstreamConnectionFailure,
            StreamResetReason::ConnectionTermination => {
                ResponseFlag::UpstreamConnectionTermination
            }
            StreamResetReason::LocalReset => ResponseFlag::UpstreamLocalReset,
            StreamResetReason::Overflow => ResponseFlag::UpstreamOverflow,
            StreamResetReason::RemoteReset => ResponseFlag::UpstreamRemoteReset,
            StreamResetReason::UpstreamGlobalTimeout | StreamResetReason::UpstreamPerTryTimeout => {
                ResponseFlag::NoHealthyUpstream
            }
        }
    }
}

impl fmt::Display for StreamResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single condition recorded on a finished stream.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseFlag {
    NoHealthyUpstream = 1 << 0,
    UpstreamRequestTimeout = 1 << 1,
    UpstreamLocalReset = 1 << 2,
    UpstreamRemoteReset = 1 << 3,
    UpstreamConnectionFailure = 1 << 4,
    UpstreamConnectionTermination = 1 << 5,
    UpstreamOverflow = 1 << 6,
    NoRouteFound = 1 << 7,
}

impl ResponseFlag {
    const ALL: [ResponseFlag; 8] = [
        ResponseFlag::NoHealthyUpstream,
        ResponseFlag::UpstreamRequestTimeout,
        ResponseFlag::UpstreamLocalReset,
        ResponseFlag::UpstreamRemoteReset,
        ResponseFlag::UpstreamConnectionFailure,
        ResponseFlag::UpstreamConnectionTermination,
        ResponseFlag::UpstreamOverflow,
        ResponseFlag::NoRouteFound,
    ];

    /// Short code used in access logs.
    pub fn code(&self) -> &'static str {
        match self {
            ResponseFlag::NoHealthyUpstream => "UH",
            ResponseFlag::UpstreamRequestTimeout => "UT",
            ResponseFlag::UpstreamLocalReset => "LR",
            ResponseFlag::UpstreamRemoteReset => "UR",
            ResponseFlag::UpstreamConnectionFailure => "UF",
            ResponseFlag::UpstreamConnectionTermination => "UC",
            ResponseFlag::UpstreamOverflow => "UO",
            ResponseFlag::NoRouteFound => "NR",
        }
    }
}

/// Set of [`ResponseFlag`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseFlags(u32);

impl ResponseFlags {
    pub fn insert(&mut self, flag: ResponseFlag) {
        self.0 |= flag as u32;
    }

    pub fn contains(&self, flag: ResponseFlag) -> bool {
        self.0 & flag as u32 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ResponseFlag> + '_ {
        ResponseFlag::ALL.into_iter().filter(|f| self.contains(*f))
    }
}

impl fmt::Display for ResponseFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        let codes: Vec<&str> = self.iter().map(|flag| flag.code()).collect();
        f.write_str(&codes.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_reason_flags() {
        assert_eq!(
            StreamResetReason::ConnectionFailed.response_flag(),
            ResponseFlag::UpstreamConnectionFailure
        );
        assert_eq!(
            StreamResetReason::Overflow.response_flag(),
            ResponseFlag::UpstreamOverflow
        );
        assert!(StreamResetReason::UpstreamPerTryTimeout.is_timeout());
        assert!(!StreamResetReason::RemoteReset.is_timeout());
    }

    #[test]
    fn test_flag_set() {
        let mut flags = ResponseFlags::default();
        assert_eq!(flags.to_string(), "-");

        flags.insert(ResponseFlag::UpstreamOverflow);
        flags.insert(ResponseFlag::UpstreamConnectionFailure);
        flags.insert(ResponseFlag::UpstreamOverflow);

        assert!(flags.contains(ResponseFlag::UpstreamOverflow));
        assert!(!flags.contains(ResponseFlag::NoRouteFound));
        assert_eq!(flags.to_string(), "UF,UO");
    }
}
