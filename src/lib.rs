//! Per-request stream controller of an L7 service-mesh proxy.

// Core subsystems
pub mod config;
pub mod protocol;
pub mod proxy;
pub mod routing;
pub mod stream;

// Traffic management
pub mod load_balancer;
pub mod upstream;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use lifecycle::Shutdown;
pub use proxy::{Proxy, ProxyContext};
pub use stream::DownStream;
