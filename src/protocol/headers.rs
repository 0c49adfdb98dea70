//! Protocol-neutral header map.

use serde::Serialize;
use std::collections::BTreeMap;

/// Pseudo header carrying the response status across protocols.
pub const STATUS: &str = ":status";
/// Pseudo header carrying the request path.
pub const PATH: &str = ":path";
pub const HOST: &str = "host";
/// Overrides the whole-stream timeout, in milliseconds.
pub const GLOBAL_TIMEOUT: &str = "x-proxy-global-timeout";
/// Overrides the per-attempt timeout, in milliseconds.
pub const TRY_TIMEOUT: &str = "x-proxy-try-timeout";

/// Header frame (request headers, response headers or trailers).
///
/// Keys are stored lowercase; lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct HeaderMap {
    entries: BTreeMap<String, String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Insert or replace a header value.
    pub fn set(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&key.to_ascii_lowercase())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse the `:status` pseudo header, if present and numeric.
    pub fn status(&self) -> Option<u16> {
        self.get(STATUS).and_then(|s| s.trim().parse().ok())
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (k, v) in iter {
            map.set(k, v);
        }
        map
    }
}
