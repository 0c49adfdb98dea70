//! Route matching logic.
//!
//! # Responsibilities
//! - Match host header (exact, case-insensitive, port ignored)
//! - Match `:path` prefix (case-sensitive)
//! - Match arbitrary header values (exact)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

use crate::protocol::headers::{HOST, PATH};
use crate::protocol::HeaderMap;

/// Trait for matching request headers against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    fn matches(&self, headers: &HeaderMap) -> bool;
}

/// Matches the host header.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase for case-insensitive matching.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: host.into().to_lowercase(),
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, headers: &HeaderMap) -> bool {
        let Some(host) = headers.get(HOST) else {
            return false;
        };
        let name = match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
            _ => host,
        };
        name.eq_ignore_ascii_case(&self.expected_host)
    }
}

/// Matches the `:path` prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, headers: &HeaderMap) -> bool {
        headers
            .get(PATH)
            .map(|p| p.starts_with(&self.prefix))
            .unwrap_or(false)
    }
}

/// Matches one header value exactly.
#[derive(Debug, Clone)]
pub struct HeaderMatcher {
    name: String,
    value: String,
}

impl HeaderMatcher {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl Matcher for HeaderMatcher {
    fn matches(&self, headers: &HeaderMap) -> bool {
        headers.get(&self.name) == Some(self.value.as_str())
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug, Default)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, headers: &HeaderMap) -> bool {
        self.matchers.iter().all(|m| m.matches(headers))
    }
}
