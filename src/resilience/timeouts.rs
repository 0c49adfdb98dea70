//! Stream timeout budgets.
//!
//! Budgets come from the route rule; a request may shorten or extend them
//! with the `x-proxy-global-timeout` and `x-proxy-try-timeout` headers
//! (milliseconds).

use std::time::Duration;

use crate::config::TimeoutConfig;
use crate::protocol::headers::{GLOBAL_TIMEOUT, TRY_TIMEOUT};
use crate::protocol::HeaderMap;

/// Global and per-attempt budget of one stream. Zero disables a timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeout {
    pub global: Duration,
    pub per_try: Duration,
}

impl Timeout {
    pub fn new(global: Duration, per_try: Duration) -> Self {
        Self { global, per_try }
    }
}

impl From<&TimeoutConfig> for Timeout {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            global: Duration::from_millis(config.global_ms),
            per_try: Duration::from_millis(config.per_try_ms),
        }
    }
}

/// Apply per-request header overrides on top of the route budget.
///
/// Values that are not plain millisecond integers are ignored.
pub fn parse_proxy_timeout(route: Timeout, headers: Option<&HeaderMap>) -> Timeout {
    let mut timeout = route;
    let Some(headers) = headers else {
        return timeout;
    };

    if let Some(ms) = header_millis(headers, GLOBAL_TIMEOUT) {
        timeout.global = ms;
    }
    if let Some(ms) = header_millis(headers, TRY_TIMEOUT) {
        timeout.per_try = ms;
    }
    timeout
}

fn header_millis(headers: &HeaderMap, name: &str) -> Option<Duration> {
    let raw = headers.get(name)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::debug!(header = name, value = raw, "Ignoring malformed timeout header");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_budget() -> Timeout {
        Timeout::new(Duration::from_secs(60), Duration::ZERO)
    }

    #[test]
    fn test_no_headers_keeps_route_budget() {
        assert_eq!(parse_proxy_timeout(route_budget(), None), route_budget());
    }

    #[test]
    fn test_header_overrides() {
        let headers: HeaderMap = [(GLOBAL_TIMEOUT, "1500"), (TRY_TIMEOUT, "200")]
            .into_iter()
            .collect();
        let timeout = parse_proxy_timeout(route_budget(), Some(&headers));
        assert_eq!(timeout.global, Duration::from_millis(1500));
        assert_eq!(timeout.per_try, Duration::from_millis(200));
    }

    #[test]
    fn test_malformed_header_ignored() {
        let headers: HeaderMap = [(GLOBAL_TIMEOUT, "soon")].into_iter().collect();
        assert_eq!(
            parse_proxy_timeout(route_budget(), Some(&headers)),
            route_budget()
        );
    }
}
