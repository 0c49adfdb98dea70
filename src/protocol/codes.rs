//! Proxy status codes used for hijack responses.
//!
//! The values are protocol-neutral; codecs map them onto their own status
//! representation when a hijack response is encoded.

use thiserror::Error;

pub const CODEC_EXCEPTION: u16 = 0;
pub const UNKNOWN: u16 = 2;
pub const DESERIALIZE_EXCEPTION: u16 = 3;
pub const SUCCESS: u16 = 200;
pub const PERMISSION_DENIED: u16 = 403;
pub const ROUTER_UNAVAILABLE: u16 = 404;
pub const INTERNAL_ERROR: u16 = 500;
pub const NO_HEALTHY_UPSTREAM: u16 = 502;
pub const UPSTREAM_OVERFLOW: u16 = 503;
pub const TIMEOUT_EXCEPTION: u16 = 504;
pub const LIMIT_EXCEEDED: u16 = 509;

/// Failure reported by a downstream codec while decoding a request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("codec exception: {0}")]
    Codec(String),

    #[error("deserialize exception: {0}")]
    Deserialize(String),

    #[error("decode failure: {0}")]
    Other(String),
}

impl DecodeError {
    /// Status code of the hijack response sent for this decode failure.
    pub fn hijack_code(&self) -> u16 {
        match self {
            DecodeError::Codec(_) => CODEC_EXCEPTION,
            DecodeError::Deserialize(_) => DESERIALIZE_EXCEPTION,
            DecodeError::Other(_) => UNKNOWN,
        }
    }
}
