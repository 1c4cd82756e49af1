//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the forward proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection limits).
    pub listener: ListenerConfig,

    /// Outbound transport shared by every forwarded request.
    pub transport: TransportConfig,

    /// Audit stream settings.
    pub audit: AuditConfig,

    /// CONNECT interception (certificate authority) settings.
    pub interception: InterceptionConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:2080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// How long in-flight connections may keep running after shutdown is requested.
    pub drain_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2080".to_string(),
            max_connections: 10_000,
            drain_timeout_secs: 5,
        }
    }
}

impl ListenerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Outbound transport configuration.
///
/// Immutable once the proxy starts; every request shares the client built from it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Upstream proxy URL. When set, all outbound requests go through it.
    pub upstream_proxy: Option<String>,

    /// TCP connect timeout in seconds.
    pub dial_timeout_secs: u64,

    /// TLS handshake timeout (towards the origin or upstream proxy) in seconds.
    pub tls_handshake_timeout_secs: u64,

    /// TCP keep-alive interval in seconds.
    pub keep_alive_secs: u64,

    /// Expect-continue timeout in seconds.
    ///
    /// Accepted for compatibility but not applied: `Expect` is stripped from
    /// forwarded requests, so the outbound client never waits for `100 Continue`.
    /// A non-default value is reported at startup.
    pub expect_continue_timeout_secs: u64,
}

/// Default for `expect_continue_timeout_secs`.
pub const DEFAULT_EXPECT_CONTINUE_TIMEOUT_SECS: u64 = 1;

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            upstream_proxy: None,
            dial_timeout_secs: 10,
            tls_handshake_timeout_secs: 10,
            keep_alive_secs: 30,
            expect_continue_timeout_secs: DEFAULT_EXPECT_CONTINUE_TIMEOUT_SECS,
        }
    }
}

impl TransportConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Audit stream configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Write a record for every completed exchange.
    pub enabled: bool,

    /// File to append records to. Records go to stdout when unset.
    pub path: Option<PathBuf>,

    /// Upper bound on the response body bytes copied into one record.
    pub max_body_bytes: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// CONNECT interception configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InterceptionConfig {
    /// Directory holding `ca.crt` and `ca.key`. Created on first run.
    pub cert_dir: PathBuf,

    /// Validity of generated per-host certificates in days.
    pub cert_validity_days: u32,
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from("cert"),
            cert_validity_days: 90,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
