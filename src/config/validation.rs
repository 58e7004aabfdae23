//! Configuration validation.
//!
//! Serde handles syntax; this module checks semantics and returns every
//! problem found, not just the first.

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("cache.max_cache_size must be greater than zero")]
    ZeroCacheSize,

    #[error("cache.max_object_size must be greater than zero")]
    ZeroObjectSize,

    #[error("cache.max_object_size ({object}) exceeds cache.max_cache_size ({cache})")]
    ObjectExceedsCache { object: usize, cache: usize },

    #[error("listener.bind_host {0:?} is not an IP address")]
    InvalidBindHost(String),

    #[error("observability.metrics_address {0:?} is not a socket address")]
    InvalidMetricsAddress(String),
}

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let cache = &config.cache;
    if cache.max_cache_size == 0 {
        errors.push(ValidationError::ZeroCacheSize);
    }
    if cache.max_object_size == 0 {
        errors.push(ValidationError::ZeroObjectSize);
    }
    if cache.max_object_size > cache.max_cache_size {
        errors.push(ValidationError::ObjectExceedsCache {
            object: cache.max_object_size,
            cache: cache.max_cache_size,
        });
    }

    if config.listener.bind_host.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::InvalidBindHost(
            config.listener.bind_host.clone(),
        ));
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
