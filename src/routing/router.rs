//! Route lookup.
//!
//! # Responsibilities
//! - Define the router seams the stream controller consumes
//! - Compile configured routes into an immutable `StaticRouter`
//! - Pick weighted clusters and finalize headers per rule
//! - Publish the current router through a swappable handle

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::config::{ProxyConfig, RouteConfig};
use crate::load_balancer::MetadataMatchCriteria;
use crate::protocol::{HeaderMap, Protocol};
use crate::resilience::{RetryPolicy, Timeout};
use crate::routing::matcher::{AndMatcher, HeaderMatcher, HostMatcher, Matcher, PathPrefixMatcher};
use crate::stream::RequestInfo;

pub trait Router: Send + Sync {
    fn match_route(&self, headers: &HeaderMap) -> Option<Arc<dyn Route>>;
}

pub trait Route: Send + Sync {
    fn name(&self) -> &str;

    /// Forwarding rule; `None` for direct-response routes.
    fn route_rule(&self) -> Option<&dyn RouteRule>;

    fn direct_response_rule(&self) -> Option<&DirectResponse> {
        None
    }
}

pub trait RouteRule: Send + Sync {
    /// Target cluster. Weighted rules may answer differently per call.
    fn cluster_name(&self) -> String;

    /// Overrides the listener's upstream protocol.
    fn upstream_protocol(&self) -> Option<&Protocol> {
        None
    }

    fn timeout(&self) -> Timeout;

    fn retry_policy(&self) -> Arc<RetryPolicy>;

    fn metadata_match_criteria(&self) -> Option<&MetadataMatchCriteria> {
        None
    }

    fn finalize_request_headers(&self, _headers: &mut HeaderMap, _info: &RequestInfo) {}

    fn finalize_response_headers(&self, _headers: &mut HeaderMap, _info: &RequestInfo) {}
}

/// Fixed answer of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectResponse {
    pub status: u16,
    pub body: Option<String>,
}

/// Forwarding rule compiled from a [`RouteConfig`].
#[derive(Debug)]
pub struct StaticRouteRule {
    clusters: Vec<(String, u32)>,
    total_weight: u32,
    upstream_protocol: Option<Protocol>,
    timeout: Timeout,
    retry_policy: Arc<RetryPolicy>,
    metadata: Option<MetadataMatchCriteria>,
    request_headers_to_add: BTreeMap<String, String>,
    response_headers_to_add: BTreeMap<String, String>,
}

impl StaticRouteRule {
    fn from_config(route: &RouteConfig, defaults: &ProxyConfig) -> Option<Self> {
        let clusters: Vec<(String, u32)> = match &route.cluster {
            Some(name) => vec![(name.clone(), 1)],
            None => route
                .clusters
                .iter()
                .filter(|c| c.weight > 0)
                .map(|c| (c.name.clone(), c.weight))
                .collect(),
        };
        if clusters.is_empty() {
            return None;
        }

        let mut timeout = Timeout::from(&defaults.timeouts);
        if let Some(overrides) = &route.timeouts {
            if let Some(ms) = overrides.global_ms {
                timeout.global = std::time::Duration::from_millis(ms);
            }
            if let Some(ms) = overrides.per_try_ms {
                timeout.per_try = std::time::Duration::from_millis(ms);
            }
        }

        let retries = route.retries.as_ref().unwrap_or(&defaults.retries);

        Some(Self {
            total_weight: clusters.iter().map(|(_, w)| w).sum(),
            clusters,
            upstream_protocol: route.upstream_protocol.clone(),
            timeout,
            retry_policy: Arc::new(RetryPolicy::from(retries)),
            metadata: MetadataMatchCriteria::new(route.metadata_match.clone()),
            request_headers_to_add: route.request_headers_to_add.clone(),
            response_headers_to_add: route.response_headers_to_add.clone(),
        })
    }
}

impl RouteRule for StaticRouteRule {
    fn cluster_name(&self) -> String {
        if self.clusters.len() == 1 {
            return self.clusters[0].0.clone();
        }
        let mut pick = fastrand::u32(0..self.total_weight);
        for (name, weight) in &self.clusters {
            if pick < *weight {
                return name.clone();
            }
            pick -= weight;
        }
        // Unreachable while weights sum to total_weight.
        self.clusters[self.clusters.len() - 1].0.clone()
    }

    fn upstream_protocol(&self) -> Option<&Protocol> {
        self.upstream_protocol.as_ref()
    }

    fn timeout(&self) -> Timeout {
        self.timeout
    }

    fn retry_policy(&self) -> Arc<RetryPolicy> {
        self.retry_policy.clone()
    }

    fn metadata_match_criteria(&self) -> Option<&MetadataMatchCriteria> {
        self.metadata.as_ref()
    }

    fn finalize_request_headers(&self, headers: &mut HeaderMap, _info: &RequestInfo) {
        for (name, value) in &self.request_headers_to_add {
            headers.set(name, value.clone());
        }
    }

    fn finalize_response_headers(&self, headers: &mut HeaderMap, _info: &RequestInfo) {
        for (name, value) in &self.response_headers_to_add {
            headers.set(name, value.clone());
        }
    }
}

/// Route compiled from a [`RouteConfig`].
#[derive(Debug)]
pub struct StaticRoute {
    name: String,
    priority: u32,
    matcher: AndMatcher,
    rule: Option<StaticRouteRule>,
    direct: Option<DirectResponse>,
}

impl StaticRoute {
    pub fn from_config(route: &RouteConfig, defaults: &ProxyConfig) -> Self {
        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if let Some(host) = &route.host {
            matchers.push(Box::new(HostMatcher::new(host.clone())));
        }
        if let Some(prefix) = &route.path_prefix {
            matchers.push(Box::new(PathPrefixMatcher::new(prefix.clone())));
        }
        for (name, value) in &route.headers {
            matchers.push(Box::new(HeaderMatcher::new(name.clone(), value.clone())));
        }

        let direct = route.direct_response.as_ref().map(|d| DirectResponse {
            status: d.status,
            body: d.body.clone(),
        });
        let rule = if direct.is_some() {
            None
        } else {
            StaticRouteRule::from_config(route, defaults)
        };

        Self {
            name: route.name.clone(),
            priority: route.priority,
            matcher: AndMatcher::new(matchers),
            rule,
            direct,
        }
    }
}

impl Route for StaticRoute {
    fn name(&self) -> &str {
        &self.name
    }

    fn route_rule(&self) -> Option<&dyn RouteRule> {
        self.rule.as_ref().map(|r| r as &dyn RouteRule)
    }

    fn direct_response_rule(&self) -> Option<&DirectResponse> {
        self.direct.as_ref()
    }
}

/// Immutable route table.
#[derive(Debug, Default)]
pub struct StaticRouter {
    routes: Vec<Arc<StaticRoute>>,
}

impl StaticRouter {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let mut routes: Vec<Arc<StaticRoute>> = config
            .routes
            .iter()
            .map(|r| Arc::new(StaticRoute::from_config(r, config)))
            .collect();
        // Stable sort keeps config order among equal priorities.
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Router for StaticRouter {
    fn match_route(&self, headers: &HeaderMap) -> Option<Arc<dyn Route>> {
        self.routes
            .iter()
            .find(|r| r.matcher.matches(headers))
            .map(|r| r.clone() as Arc<dyn Route>)
    }
}

/// Shared slot holding the listener's current router.
#[derive(Clone, Default)]
pub struct RouterHandle {
    current: Arc<ArcSwapOption<Box<dyn Router>>>,
}

impl RouterHandle {
    pub fn new(router: impl Router + 'static) -> Self {
        let handle = Self::default();
        handle.store(router);
        handle
    }

    /// Handle with no router installed.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn store(&self, router: impl Router + 'static) {
        let boxed: Box<dyn Router> = Box::new(router);
        self.current.store(Some(Arc::new(boxed)));
    }

    pub fn clear(&self) {
        self.current.store(None);
    }

    pub fn load(&self) -> Option<Arc<Box<dyn Router>>> {
        self.current.load_full()
    }
}

impl std::fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterHandle")
            .field("installed", &self.current.load().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn config() -> ProxyConfig {
        parse_config(
            r#"
            [timeouts]
            global_ms = 1000

            [[routes]]
            name = "api"
            path_prefix = "/api"
            cluster = "api"
            priority = 10
            timeouts = { per_try_ms = 100 }
            request_headers_to_add = { "x-route" = "api" }

            [[routes]]
            name = "split"
            path_prefix = "/split"
            clusters = [{ name = "api", weight = 1 }, { name = "web", weight = 3 }]

            [[routes]]
            name = "down"
            headers = { "x-maintenance" = "on" }
            direct_response = { status = 503, body = "maintenance" }
            priority = 100

            [[routes]]
            name = "fallback"
            cluster = "web"

            [[clusters]]
            name = "api"
            hosts = [{ address = "10.0.0.1:80" }]

            [[clusters]]
            name = "web"
            hosts = [{ address = "10.0.0.2:80" }]
            "#,
        )
        .unwrap()
    }

    fn request(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_priority_and_fallback() {
        let router = StaticRouter::from_config(&config());

        let route = router.match_route(&request(&[(":path", "/api/users")])).unwrap();
        assert_eq!(route.name(), "api");

        let route = router
            .match_route(&request(&[(":path", "/api"), ("x-maintenance", "on")]))
            .unwrap();
        assert_eq!(route.name(), "down");
        assert!(route.route_rule().is_none());
        assert_eq!(
            route.direct_response_rule(),
            Some(&DirectResponse {
                status: 503,
                body: Some("maintenance".into())
            })
        );

        let route = router.match_route(&request(&[(":path", "/other")])).unwrap();
        assert_eq!(route.name(), "fallback");
    }

    #[test]
    fn test_rule_merges_defaults() {
        let router = StaticRouter::from_config(&config());
        let route = router.match_route(&request(&[(":path", "/api")])).unwrap();
        let rule = route.route_rule().unwrap();

        assert_eq!(rule.cluster_name(), "api");
        assert_eq!(
            rule.timeout(),
            Timeout::new(
                std::time::Duration::from_millis(1000),
                std::time::Duration::from_millis(100)
            )
        );

        let mut headers = HeaderMap::new();
        rule.finalize_request_headers(&mut headers, &RequestInfo::new());
        assert_eq!(headers.get("x-route"), Some("api"));
    }

    #[test]
    fn test_weighted_clusters() {
        let router = StaticRouter::from_config(&config());
        let route = router.match_route(&request(&[(":path", "/split")])).unwrap();
        let rule = route.route_rule().unwrap();

        let picks: Vec<String> = (0..200).map(|_| rule.cluster_name()).collect();
        assert!(picks.iter().all(|c| c == "api" || c == "web"));
        assert!(picks.iter().any(|c| c == "web"));
    }

    #[test]
    fn test_no_match() {
        let mut cfg = config();
        cfg.routes.retain(|r| r.name != "fallback");
        let router = StaticRouter::from_config(&cfg);
        assert!(router.match_route(&request(&[(":path", "/nowhere")])).is_none());
    }

    #[test]
    fn test_handle_swap() {
        let handle = RouterHandle::empty();
        assert!(handle.load().is_none());

        handle.store(StaticRouter::from_config(&config()));
        let router = handle.load().unwrap();
        assert!(router.match_route(&request(&[(":path", "/api")])).is_some());

        handle.clear();
        assert!(handle.load().is_none());
    }
}
