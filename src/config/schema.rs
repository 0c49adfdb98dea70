//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::protocol::Protocol;

/// Root configuration for the stream proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener-level stream controller settings.
    pub proxy: ProxySettings,

    /// Route definitions mapping request headers to clusters.
    pub routes: Vec<RouteConfig>,

    /// Upstream cluster definitions.
    pub clusters: Vec<ClusterConfig>,

    /// Default timeouts, overridable per route and per request.
    pub timeouts: TimeoutConfig,

    /// Default retry policy, overridable per route.
    pub retries: RetryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Stream controller settings for one listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Listener name, used as a metrics label.
    pub name: String,

    /// Protocol spoken by downstream clients.
    pub downstream_protocol: Protocol,

    /// Protocol spoken to upstream hosts. `Auto` follows the downstream protocol.
    pub upstream_protocol: Protocol,

    /// Maximum number of pipeline passes per stream.
    pub max_phase_passes: usize,

    /// Maximum number of idle stream records kept for reuse.
    pub stream_pool_capacity: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            name: "ingress".to_string(),
            downstream_protocol: Protocol::HTTP1,
            upstream_protocol: Protocol::AUTO,
            max_phase_passes: 5,
            stream_pool_capacity: 1024,
        }
    }
}

/// Route configuration mapping requests to clusters.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Route identifier for logging/metrics.
    pub name: String,

    /// Host header to match (exact match, case-insensitive).
    pub host: Option<String>,

    /// `:path` prefix to match.
    pub path_prefix: Option<String>,

    /// Additional headers that must be present with the given values.
    pub headers: BTreeMap<String, String>,

    /// Target cluster.
    pub cluster: Option<String>,

    /// Weighted target clusters, used when `cluster` is not set.
    pub clusters: Vec<WeightedClusterConfig>,

    /// Overrides the listener's upstream protocol.
    pub upstream_protocol: Option<Protocol>,

    /// Answer directly instead of forwarding upstream.
    pub direct_response: Option<DirectResponseConfig>,

    /// Route-level timeout overrides.
    pub timeouts: Option<RouteTimeoutConfig>,

    /// Route-level retry policy override.
    pub retries: Option<RetryConfig>,

    /// Headers added to the request before dispatch.
    pub request_headers_to_add: BTreeMap<String, String>,

    /// Headers added to the response before emission.
    pub response_headers_to_add: BTreeMap<String, String>,

    /// Host metadata that selected upstream hosts must carry.
    pub metadata_match: BTreeMap<String, String>,

    /// Route priority (higher = checked first).
    pub priority: u32,
}

/// One entry of a weighted cluster set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WeightedClusterConfig {
    pub name: String,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Fixed response returned by a route.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirectResponseConfig {
    pub status: u16,

    #[serde(default)]
    pub body: Option<String>,
}

/// Route-level timeout overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RouteTimeoutConfig {
    pub global_ms: Option<u64>,
    pub per_try_ms: Option<u64>,
}

/// Upstream cluster configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Unique cluster identifier.
    pub name: String,

    /// Host selection strategy.
    #[serde(default)]
    pub lb_policy: LbPolicy,

    /// Member hosts.
    #[serde(default)]
    pub hosts: Vec<HostConfig>,

    /// Maximum retries outstanding across all streams of this cluster.
    #[serde(default = "default_max_concurrent_retries")]
    pub max_concurrent_retries: usize,

    /// Passive health thresholds.
    #[serde(default)]
    pub health: PassiveHealthConfig,
}

/// Load balancing strategy for a cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
    LeastConnections,
}

/// Upstream host configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Host address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Maximum concurrent streams to this host.
    #[serde(default = "default_max_host_conns")]
    pub max_connections: usize,

    /// Labels matched against a route's metadata criteria.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

fn default_max_host_conns() -> usize {
    100
}

fn default_max_concurrent_retries() -> usize {
    1024
}

/// Passive health thresholds, driven by upstream response outcomes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PassiveHealthConfig {
    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl Default for PassiveHealthConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole-stream budget in milliseconds (0 disables it).
    pub global_ms: u64,

    /// Single upstream attempt budget in milliseconds (0 disables it).
    pub per_try_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            global_ms: 60_000,
            per_try_ms: 0,
        }
    }
}

/// Failure classes a retry policy may retry on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryCondition {
    /// Connection establishment failed or the pool had no capacity.
    ConnectFailure,
    /// The upstream stream or connection was reset.
    Reset,
    /// The per-attempt timer fired.
    PerTryTimeout,
    /// The upstream answered with a 5xx status.
    ServerError,
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries.
    pub enabled: bool,

    /// Maximum number of upstream attempts per stream, the first one included.
    pub max_attempts: u32,

    /// Failure classes that are retried.
    pub retry_on: Vec<RetryCondition>,

    /// Base delay for exponential backoff in milliseconds (0 = retry immediately).
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            retry_on: vec![
                RetryCondition::ConnectFailure,
                RetryCondition::Reset,
                RetryCondition::PerTryTimeout,
            ],
            base_delay_ms: 0,
            max_delay_ms: 2000,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Create a tracing span per stream.
    pub tracing_enabled: bool,

    /// Write one JSON access log line per finished stream.
    pub access_log: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
            tracing_enabled: false,
            access_log: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(config.proxy.max_phase_passes, 5);
        assert!(config.proxy.upstream_protocol.is_auto());
        assert_eq!(config.timeouts.global_ms, 60_000);
        assert_eq!(config.timeouts.per_try_ms, 0);
        assert!(config.retries.enabled);
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_full_route_and_cluster() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [proxy]
            downstream_protocol = "Http1"
            upstream_protocol = "bolt"

            [retries]
            max_attempts = 2
            retry_on = ["reset", "server-error"]

            [[routes]]
            name = "echo"
            path_prefix = "/echo"
            cluster = "backend"
            request_headers_to_add = { "x-route" = "echo" }
            timeouts = { per_try_ms = 250 }

            [[routes]]
            name = "maintenance"
            host = "down.example.com"
            direct_response = { status = 503, body = "maintenance" }

            [[clusters]]
            name = "backend"
            lb_policy = "least-connections"
            hosts = [{ address = "10.0.0.1:8080", metadata = { zone = "a" } }]
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy.upstream_protocol, Protocol::BOLT);
        assert_eq!(
            config.retries.retry_on,
            vec![RetryCondition::Reset, RetryCondition::ServerError]
        );
        assert_eq!(config.routes.len(), 2);
        assert_eq!(
            config.routes[0].timeouts.as_ref().and_then(|t| t.per_try_ms),
            Some(250)
        );
        assert_eq!(config.routes[1].direct_response.as_ref().map(|d| d.status), Some(503));
        assert_eq!(config.clusters[0].lb_policy, LbPolicy::LeastConnections);
        assert_eq!(config.clusters[0].hosts[0].max_connections, 100);
        assert_eq!(config.clusters[0].hosts[0].metadata.get("zone").map(String::as_str), Some("a"));
    }
}
