//! Configuration for the proxy engine and the certificate store.
//!
//! All options carry defaults, so `ProxyOptions::default()` yields a working
//! direct-forwarding proxy. The structs are serde-deserializable so a host
//! application can load them from whatever configuration format it uses.
//!
//! Error codes in `mute_error_codes` / `warn_error_codes` are the symbolic
//! strings produced by [`crate::proxy::ProxyError::code`]; they decide
//! whether a failure is silently discarded, logged at warn, or logged at
//! error level.

use crate::proxy::error::{ProxyError, Severity};
use crate::proxy::Upstream;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Error codes that correspond to benign peer-initiated closes on byte
/// relays. Never logged.
fn default_mute_error_codes() -> HashSet<String> {
    [
        "EPIPE",
        "ERR_STREAM_PREMATURE_CLOSE",
        "ERR_STREAM_DESTROYED",
        "ECONNRESET",
        "EINVAL",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Error codes logged at warn level instead of error.
fn default_warn_error_codes() -> HashSet<String> {
    ["ENOTCONN", "ERR_STREAM_WRITE_AFTER_END", "EPROTO"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Stagger between hedged connect attempts (milliseconds).
const fn default_connect_retry_interval_ms() -> u64 {
    1000
}

/// Per-attempt outbound connect timeout (milliseconds).
const fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// Default leaf certificate validity (days).
const fn default_cert_ttl_days() -> i64 {
    365
}

/// Default capacity bound of the leaf certificate cache.
const fn default_cert_cache_max_entries() -> u64 {
    100
}

/// Options accepted by the proxy engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyOptions {
    /// Upstream used when route matching yields no decision for a host.
    #[serde(default)]
    pub default_upstream: Option<Upstream>,

    /// Error codes never logged.
    #[serde(default = "default_mute_error_codes")]
    pub mute_error_codes: HashSet<String>,

    /// Error codes logged at warn, not error.
    #[serde(default = "default_warn_error_codes")]
    pub warn_error_codes: HashSet<String>,

    /// Extra hedged connect attempts beyond the first.
    #[serde(default)]
    pub connect_retry_attempts: u32,

    /// Stagger between hedged attempts, in milliseconds.
    #[serde(default = "default_connect_retry_interval_ms")]
    pub connect_retry_interval_ms: u64,

    /// Per-attempt outbound connect timeout, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            default_upstream: None,
            mute_error_codes: default_mute_error_codes(),
            warn_error_codes: default_warn_error_codes(),
            connect_retry_attempts: 0,
            connect_retry_interval_ms: default_connect_retry_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ProxyOptions {
    /// Stagger between hedged attempts.
    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    /// Per-attempt outbound connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Classify an error into mute/warn/error by its symbolic code.
    pub fn severity_of(&self, error: &ProxyError) -> Severity {
        match error.code() {
            Some(code) if self.mute_error_codes.contains(code) => Severity::Mute,
            Some(code) if self.warn_error_codes.contains(code) => Severity::Warn,
            _ => Severity::Error,
        }
    }
}

/// Options for the certificate store used by the SSL-bump proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertStoreOptions {
    /// PEM-encoded CA certificate used to sign minted leaves. Clients must
    /// pre-trust this CA.
    pub ca_cert_pem: String,

    /// PEM-encoded CA private key.
    pub ca_key_pem: String,

    /// PEM-encoded static leaf keypair. A fresh keypair is generated when
    /// absent.
    #[serde(default)]
    pub leaf_key_pem: Option<String>,

    /// Validity of minted leaf certificates, in days.
    #[serde(default = "default_cert_ttl_days")]
    pub cert_ttl_days: i64,

    /// Capacity bound of the leaf certificate cache.
    #[serde(default = "default_cert_cache_max_entries")]
    pub cert_cache_max_entries: u64,
}
