//! Overridable behavior of the proxy engine.
//!
//! The engine carries an implementation of [`ProxyHooks`]; every method has
//! a default, so a hook type only overrides what it needs. Variants of the
//! engine (routing, bumping) install their own hook defaults.

use super::error::ProxyError;
use super::tls;
use super::upstream::Upstream;
use hyper::{HeaderMap, Method, Uri};
use rustls_pki_types::CertificateDer;

/// The parsed head of an inbound request, as handed to hooks.
///
/// Bodies never pass through hooks; rewriting happens at the TLS bridge
/// level for bumped traffic.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// Request target (absolute-form for HTTP, authority-form for CONNECT).
    pub uri: Uri,
    /// Request headers.
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Capture the head of a hyper request.
    pub fn of<B>(req: &hyper::Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
        }
    }

    /// A header value as UTF-8, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Outcome of route matching for a target host.
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// Route through the given upstream proxy.
    Upstream(Upstream),
    /// Route directly to origin, ignoring the default upstream.
    Direct,
    /// No decision; the engine falls back to its `default_upstream`.
    Default,
}

/// User-overridable behavior of the engine.
///
/// All methods are synchronous: they run inline on the request path, before
/// any outbound I/O is started.
pub trait ProxyHooks: Send + Sync {
    /// Select an upstream for `host` (`hostname:port`).
    ///
    /// The default leaves the decision to the engine's `default_upstream`.
    fn match_route(&self, _host: &str, _req: &RequestHead) -> RouteDecision {
        RouteDecision::Default
    }

    /// Authenticate an inbound request. Invoked once at the top of both the
    /// HTTP and CONNECT paths; an error aborts the request with the error's
    /// HTTP status (502 unless the error says otherwise).
    fn authenticate(&self, _req: &RequestHead) -> Result<(), ProxyError> {
        Ok(())
    }

    /// Root certificates trusted when negotiating outbound TLS sessions.
    ///
    /// The default is the system root store. The bump proxy's default
    /// additionally injects its own CA certificate so chained bumped peers
    /// trust each other.
    fn ca_certificates(&self) -> Vec<CertificateDer<'static>> {
        tls::system_roots()
    }
}

/// Hook implementation with every default behavior.
#[derive(Debug, Default)]
pub struct DefaultHooks;

impl ProxyHooks for DefaultHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hooks_pass_everything() {
        let hooks = DefaultHooks;
        let head = RequestHead {
            method: Method::CONNECT,
            uri: "example.com:443".parse().unwrap(),
            headers: HeaderMap::new(),
        };
        assert!(hooks.authenticate(&head).is_ok());
        assert!(matches!(
            hooks.match_route("example.com:443", &head),
            RouteDecision::Default
        ));
    }

    #[test]
    fn test_request_head_header_lookup() {
        let req = hyper::Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .header("X-Partition-Id", "p-42")
            .body(())
            .unwrap();
        let head = RequestHead::of(&req);
        assert_eq!(head.header("x-partition-id"), Some("p-42"));
        assert_eq!(head.header("x-missing"), None);
    }
}
