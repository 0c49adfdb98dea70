//! Cross-protocol frame conversion.
//!
//! Converters are registered per `(from, to)` pair. A missing converter or a
//! failing one is reported as a [`ConvertError`]; callers forward the
//! original frame in that case.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::{HeaderMap, Protocol};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("no converter registered from {from} to {to}")]
    Unsupported { from: Protocol, to: Protocol },

    #[error("conversion rejected: {0}")]
    Rejected(String),
}

/// Translates frames from one protocol into another.
pub trait ProtocolConverter: Send + Sync {
    fn convert_headers(&self, headers: &HeaderMap) -> Result<HeaderMap, ConvertError>;

    fn convert_data(&self, data: &Bytes) -> Result<Bytes, ConvertError> {
        Ok(data.clone())
    }

    fn convert_trailers(&self, trailers: &HeaderMap) -> Result<HeaderMap, ConvertError> {
        Ok(trailers.clone())
    }
}

/// Converters keyed by `(from, to)` protocol pair.
#[derive(Default, Clone)]
pub struct ConverterRegistry {
    converters: HashMap<(Protocol, Protocol), Arc<dyn ProtocolConverter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        from: Protocol,
        to: Protocol,
        converter: Arc<dyn ProtocolConverter>,
    ) {
        self.converters.insert((from, to), converter);
    }

    fn lookup(
        &self,
        from: &Protocol,
        to: &Protocol,
    ) -> Result<&Arc<dyn ProtocolConverter>, ConvertError> {
        self.converters
            .get(&(from.clone(), to.clone()))
            .ok_or_else(|| ConvertError::Unsupported {
                from: from.clone(),
                to: to.clone(),
            })
    }

    pub fn convert_headers(
        &self,
        from: &Protocol,
        to: &Protocol,
        headers: &HeaderMap,
    ) -> Result<HeaderMap, ConvertError> {
        self.lookup(from, to)?.convert_headers(headers)
    }

    pub fn convert_data(
        &self,
        from: &Protocol,
        to: &Protocol,
        data: &Bytes,
    ) -> Result<Bytes, ConvertError> {
        self.lookup(from, to)?.convert_data(data)
    }

    pub fn convert_trailers(
        &self,
        from: &Protocol,
        to: &Protocol,
        trailers: &HeaderMap,
    ) -> Result<HeaderMap, ConvertError> {
        self.lookup(from, to)?.convert_trailers(trailers)
    }
}

impl std::fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("pairs", &self.converters.keys().collect::<Vec<_>>())
            .finish()
    }
}
