//! Upstream proxy descriptor and authorization helpers.
//!
//! An [`Upstream`] names the next hop along a proxy chain: its
//! `host:port`, optional Basic credentials, whether the hop itself is
//! reached over TLS, and any extra headers to forward on outbound CONNECT
//! requests (useful for partitioning and affinity across chained proxies).

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Description of an upstream proxy, the next hop toward origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    /// `hostname:port` of the upstream proxy. When the port is omitted it
    /// defaults to 443 for TLS upstreams and 80 otherwise.
    pub host: String,

    /// Username for Proxy-Authorization toward the upstream.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for Proxy-Authorization toward the upstream.
    #[serde(default)]
    pub password: Option<String>,

    /// Reach the upstream proxy itself over TLS.
    #[serde(default)]
    pub use_https: bool,

    /// Extra headers forwarded on outbound CONNECT requests.
    #[serde(default)]
    pub connect_headers: HashMap<String, String>,
}

impl Upstream {
    /// Create a descriptor for a plaintext upstream with no credentials.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: None,
            password: None,
            use_https: false,
            connect_headers: HashMap::new(),
        }
    }

    /// Attach Basic credentials.
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Reach the upstream over TLS.
    pub fn with_https(mut self) -> Self {
        self.use_https = true;
        self
    }

    /// Add a header to forward on outbound CONNECT requests.
    pub fn with_connect_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.connect_headers.insert(name.into(), value.into());
        self
    }

    /// The `Proxy-Authorization` value (`Basic base64(user:pass)`), when
    /// credentials exist.
    pub fn basic_auth_header(&self) -> Option<String> {
        let username = self.username.as_deref()?;
        let password = self.password.as_deref().unwrap_or("");
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        Some(format!("Basic {}", token))
    }

    /// Split `host` into hostname and port, applying the scheme default
    /// when the port is omitted.
    pub fn host_port(&self) -> (String, u16) {
        let default_port = if self.use_https { 443 } else { 80 };
        match self.host.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (self.host.clone(), default_port),
            },
            None => (self.host.clone(), default_port),
        }
    }

    /// Proxy URL of this upstream, for logs and diagnostics. Credentials
    /// are elided.
    pub fn url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}", scheme, self.host)
    }
}
