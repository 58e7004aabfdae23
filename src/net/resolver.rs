//! Reverse name resolution for client peers.
//!
//! # Responsibilities
//! - Turn a peer IP into a host name for connection diagnostics
//! - Bound every lookup so a slow resolver never stalls a connection for long
//!
//! # Design Decisions
//! - One resolver, built from the system configuration, shared by all
//!   connections
//! - Any failure (no system config, lookup error, timeout) yields `None`;
//!   callers fall back to the numeric address

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::TokioResolver;

use crate::config::ListenerConfig;

/// Shared reverse resolver for peer addresses.
pub struct PeerResolver {
    inner: Option<TokioResolver>,
    timeout: Duration,
}

impl PeerResolver {
    /// Build from `/etc/resolv.conf` (or the platform equivalent) and the
    /// hosts file.
    pub fn from_system(timeout: Duration) -> Self {
        match TokioResolver::builder_tokio() {
            Ok(builder) => Self {
                inner: Some(builder.build()),
                timeout,
            },
            Err(e) => {
                tracing::warn!(error = %e, "System resolver unavailable, peer names stay numeric");
                Self::disabled()
            }
        }
    }

    /// A resolver that never resolves.
    pub fn disabled() -> Self {
        Self {
            inner: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn from_config(config: &ListenerConfig) -> Self {
        if config.reverse_dns {
            Self::from_system(Duration::from_millis(config.reverse_dns_timeout_ms))
        } else {
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Host name for `ip`, without the trailing root dot.
    pub async fn reverse(&self, ip: IpAddr) -> Option<String> {
        let resolver = self.inner.as_ref()?;
        match tokio::time::timeout(self.timeout, resolver.reverse_lookup(ip)).await {
            Ok(Ok(lookup)) => lookup.iter().next().map(|name| {
                let name = name.to_string();
                name.strip_suffix('.').unwrap_or(&name).to_string()
            }),
            Ok(Err(e)) => {
                tracing::debug!(ip = %ip, error = %e, "Reverse lookup failed");
                None
            }
            Err(_) => {
                tracing::debug!(ip = %ip, timeout_ms = self.timeout.as_millis() as u64, "Reverse lookup timed out");
                None
            }
        }
    }
}

impl fmt::Debug for PeerResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerResolver")
            .field("enabled", &self.is_enabled())
            .field("timeout", &self.timeout)
            .finish()
    }
}
