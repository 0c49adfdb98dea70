//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Request headers (host, :path, others)
//!     → RouterHandle (current route table, swapped on reload)
//!     → router.rs (first matching route by priority)
//!     → matcher.rs (evaluate match conditions)
//!     → Route: forwarding rule or direct response
//!
//! Route Compilation (at startup and on reload):
//!     ProxyConfig
//!     → Sort by priority
//!     → Compile matchers, merge timeout/retry defaults
//!     → Freeze as immutable StaticRouter
//! ```
//!
//! # Design Decisions
//! - Route tables are immutable; reload swaps the whole table
//! - No regex in hot path (prefix matching only)
//! - First match wins (ordered by priority)

pub mod matcher;
pub mod router;

pub use router::{
    DirectResponse, Route, RouteRule, Router, RouterHandle, StaticRoute, StaticRouteRule,
    StaticRouter,
};
