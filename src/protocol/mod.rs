//! Protocol identifiers and the header/data/trailer frame model.
//!
//! # Data Flow
//! ```text
//! downstream codec (external)
//!     → HeaderMap + Bytes + HeaderMap (request frames)
//!     → convert.rs (downstream protocol → upstream protocol)
//!     → upstream codec (external)
//!
//! upstream response frames
//!     → convert.rs (upstream protocol → downstream protocol)
//!     → downstream codec
//! ```
//!
//! Codecs are not implemented here; the stream controller only sees the
//! decoded frames and a [`Protocol`] name for each side.

pub mod codes;
pub mod convert;
pub mod headers;

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

pub use codes::DecodeError;
pub use convert::{ConvertError, ConverterRegistry, ProtocolConverter};
pub use headers::HeaderMap;

/// Name of a wire protocol spoken on one side of the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Protocol(Cow<'static, str>);

impl Protocol {
    /// Upstream protocol placeholder meaning "same as downstream".
    pub const AUTO: Protocol = Protocol(Cow::Borrowed("Auto"));
    pub const HTTP1: Protocol = Protocol(Cow::Borrowed("Http1"));
    pub const HTTP2: Protocol = Protocol(Cow::Borrowed("Http2"));
    pub const BOLT: Protocol = Protocol(Cow::Borrowed("bolt"));

    /// Create a protocol identifier from an arbitrary name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_auto(&self) -> bool {
        self.0.eq_ignore_ascii_case("auto")
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::HTTP1
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Protocol {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_identity() {
        assert_eq!(Protocol::new("Http1"), Protocol::HTTP1);
        assert!(Protocol::new("auto").is_auto());
        assert!(!Protocol::BOLT.is_auto());
        assert_eq!(Protocol::HTTP2.to_string(), "Http2");
    }

    #[test]
    fn test_protocol_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            protocol: Protocol,
        }

        let w: Wrapper = toml::from_str(r#"protocol = "bolt""#).unwrap();
        assert_eq!(w.protocol, Protocol::BOLT);
    }
}
