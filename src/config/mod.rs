//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → routers, clusters and stream settings built from it
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → RouterHandle swaps in the new routes
//! ```
//!
//! All fields have defaults so minimal configs stay valid.

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ClusterConfig, DirectResponseConfig, HostConfig, LbPolicy, LogFormat, ObservabilityConfig,
    PassiveHealthConfig, ProxyConfig, ProxySettings, RetryCondition, RetryConfig, RouteConfig,
    RouteTimeoutConfig, TimeoutConfig, WeightedClusterConfig,
};
pub use validation::ValidationError;
pub use watcher::ConfigWatcher;
