//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing clusters)
//! - Validate value ranges (attempts > 0, pass cap > 0, weights > 0)
//!
//! Returns all validation errors, not just the first.

use std::collections::HashSet;
use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("duplicate route name '{0}'")]
    DuplicateRoute(String),

    #[error("duplicate cluster name '{0}'")]
    DuplicateCluster(String),

    #[error("route '{route}' references unknown cluster '{cluster}'")]
    UnknownCluster { route: String, cluster: String },

    #[error("route '{0}' has neither a cluster nor a direct response")]
    RouteWithoutTarget(String),

    #[error("route '{0}' has a weighted cluster with zero weight")]
    ZeroWeight(String),

    #[error("cluster '{cluster}' has a host with an empty address")]
    EmptyHostAddress { cluster: String },

    #[error("proxy.max_phase_passes must be greater than zero")]
    ZeroPhasePasses,

    #[error("retries.max_attempts must be greater than zero")]
    ZeroMaxAttempts,

    #[error("proxy.max_phase_passes ({passes}) must exceed the largest max_attempts ({attempts})")]
    PhasePassesBelowAttempts { passes: usize, attempts: u32 },
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.proxy.max_phase_passes == 0 {
        errors.push(ValidationError::ZeroPhasePasses);
    }
    let route_attempts = config
        .routes
        .iter()
        .filter_map(|r| r.retries.as_ref())
        .map(|r| r.max_attempts);
    let attempts: Vec<u32> = std::iter::once(config.retries.max_attempts)
        .chain(route_attempts)
        .collect();
    if attempts.contains(&0) {
        errors.push(ValidationError::ZeroMaxAttempts);
    }
    // Every attempt may take a pass, and emitting the final response takes one more.
    let most = attempts.iter().copied().max().unwrap_or(1);
    if config.proxy.max_phase_passes > 0 && config.proxy.max_phase_passes <= most as usize {
        errors.push(ValidationError::PhasePassesBelowAttempts {
            passes: config.proxy.max_phase_passes,
            attempts: most,
        });
    }

    let mut clusters = HashSet::new();
    for cluster in &config.clusters {
        if !clusters.insert(cluster.name.as_str()) {
            errors.push(ValidationError::DuplicateCluster(cluster.name.clone()));
        }
        if cluster.hosts.iter().any(|h| h.address.trim().is_empty()) {
            errors.push(ValidationError::EmptyHostAddress {
                cluster: cluster.name.clone(),
            });
        }
    }

    let mut routes = HashSet::new();
    for route in &config.routes {
        if !routes.insert(route.name.as_str()) {
            errors.push(ValidationError::DuplicateRoute(route.name.clone()));
        }

        if route.direct_response.is_some() {
            continue;
        }

        let targets: Vec<&str> = match &route.cluster {
            Some(name) => vec![name.as_str()],
            None => route.clusters.iter().map(|c| c.name.as_str()).collect(),
        };
        if targets.is_empty() {
            errors.push(ValidationError::RouteWithoutTarget(route.name.clone()));
        }
        for target in targets {
            if !clusters.contains(target) {
                errors.push(ValidationError::UnknownCluster {
                    route: route.name.clone(),
                    cluster: target.to_string(),
                });
            }
        }
        if route.cluster.is_none() && route.clusters.iter().any(|c| c.weight == 0) {
            errors.push(ValidationError::ZeroWeight(route.name.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
