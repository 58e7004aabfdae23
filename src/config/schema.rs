//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.
//! Every field has a default, so an empty file (or no file) is valid.

use serde::{Deserialize, Serialize};

use crate::cache::{MAX_CACHE_SIZE, MAX_OBJECT_SIZE};

/// Root configuration for the caching proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind host; the port comes from the CLI).
    pub listener: ListenerConfig,

    /// Response cache limits.
    pub cache: CacheConfig,

    /// Startup and shutdown behaviour.
    pub lifecycle: LifecycleConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Interface to bind (e.g., "0.0.0.0" or "127.0.0.1").
    pub bind_host: String,

    /// Listening port. Overridden by the command line.
    pub port: u16,

    /// Resolve peer addresses to host names when confirming connections.
    pub reverse_dns: bool,

    /// Upper bound on one reverse lookup, in milliseconds.
    pub reverse_dns_timeout_ms: u64,
}

impl ListenerConfig {
    /// `host:port` string suitable for parsing into a socket address.
    pub fn bind_address(&self) -> String {
        if self.bind_host.contains(':') {
            format!("[{}]:{}", self.bind_host, self.port)
        } else {
            format!("{}:{}", self.bind_host, self.port)
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 8080,
            reverse_dns: true,
            reverse_dns_timeout_ms: 500,
        }
    }
}

/// Response cache limits.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Total byte budget across all cached responses.
    pub max_cache_size: usize,

    /// Largest single response that will be cached.
    pub max_object_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: MAX_CACHE_SIZE,
            max_object_size: MAX_OBJECT_SIZE,
        }
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long shutdown waits for in-flight connections before releasing
    /// the cache.
    pub drain_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
