//! Host-pattern routing on top of the proxy engine.
//!
//! A [`RouteTable`] is an ordered sequence of host-pattern → upstream
//! entries; the first pattern matching the target authority
//! (`hostname:port`, case-insensitive) wins. A route with no upstream means
//! "go directly to origin", which is distinct from no route matching at all
//! (the engine then falls back to its `default_upstream`).
//!
//! Patterns are regular expressions evaluated with containment semantics;
//! anchor with `^…$` to match the full authority.

use super::error::ProxyError;
use super::events::ProxyEvents;
use super::hooks::{ProxyHooks, RequestHead, RouteDecision};
use super::server::{ProxyEngine, TunnelKind};
use super::upstream::Upstream;
use crate::config::ProxyOptions;
use regex::{Regex, RegexBuilder};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};

/// Label given to routes inserted without one.
const DEFAULT_ROUTE_LABEL: &str = "default";

/// A single host-pattern → upstream entry.
#[derive(Debug, Clone)]
pub struct Route {
    /// Grouping label; not unique, used for bulk removal.
    pub label: String,
    /// Compiled case-insensitive pattern, tested against `hostname:port`.
    pub pattern: Regex,
    /// Upstream to route through; `None` routes directly to origin.
    pub upstream: Option<Upstream>,
}

impl Route {
    /// Compile a route. Invalid patterns are rejected here, so every route
    /// held by a table is known to compile.
    pub fn new(
        label: impl Into<String>,
        pattern: &str,
        upstream: Option<Upstream>,
    ) -> Result<Self, ProxyError> {
        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ProxyError::InvalidRoute {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
        let label = label.into();
        let label = if label.is_empty() {
            DEFAULT_ROUTE_LABEL.to_string()
        } else {
            label
        };
        Ok(Self {
            label,
            pattern: compiled,
            upstream,
        })
    }
}

/// Ordered, first-match-wins route table.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Vec<Route>>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a route at the front of the table.
    pub fn insert_route(&self, route: Route) {
        self.insert_route_at(route, 0);
    }

    /// Insert a route at `index` (clamped to the table length).
    pub fn insert_route_at(&self, route: Route, index: usize) {
        let mut routes = self.routes.write().expect("route table poisoned");
        let index = index.min(routes.len());
        routes.insert(index, route);
    }

    /// Remove every route.
    pub fn clear_routes(&self) {
        self.routes.write().expect("route table poisoned").clear();
    }

    /// Remove every route carrying `label`.
    pub fn remove_routes(&self, label: &str) {
        self.routes
            .write()
            .expect("route table poisoned")
            .retain(|r| r.label != label);
    }

    /// Number of routes currently held.
    pub fn len(&self) -> usize {
        self.routes.read().expect("route table poisoned").len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First-match lookup. `Some(upstream)` when a route matched (where
    /// `upstream == None` means "directly"); `None` when nothing matched.
    pub fn match_route(&self, host: &str) -> Option<Option<Upstream>> {
        self.routes
            .read()
            .expect("route table poisoned")
            .iter()
            .find(|r| r.pattern.is_match(host))
            .map(|r| r.upstream.clone())
    }
}

/// Hook adapter exposing a [`RouteTable`] as the engine's `match_route`.
struct RoutingHooks {
    table: Arc<RouteTable>,
}

impl ProxyHooks for RoutingHooks {
    fn match_route(&self, host: &str, _req: &RequestHead) -> RouteDecision {
        match self.table.match_route(host) {
            Some(Some(upstream)) => RouteDecision::Upstream(upstream),
            Some(None) => RouteDecision::Direct,
            None => RouteDecision::Default,
        }
    }
}

/// A proxy engine with a route table installed as its routing hook.
pub struct RoutingProxy {
    engine: Arc<ProxyEngine>,
    table: Arc<RouteTable>,
}

impl RoutingProxy {
    /// Create a routing proxy with an empty route table.
    pub fn new(options: ProxyOptions) -> Self {
        let table = Arc::new(RouteTable::new());
        let hooks = Arc::new(RoutingHooks {
            table: table.clone(),
        });
        let engine = ProxyEngine::new(
            "RoutingProxy",
            options,
            hooks,
            TunnelKind::Passthrough,
            ProxyEvents::new(),
        );
        Self { engine, table }
    }

    /// The underlying route table, shared with the running engine.
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.table
    }

    /// Insert a route at the front of the table.
    pub fn insert_route(&self, route: Route) {
        self.table.insert_route(route);
    }

    /// Remove every route.
    pub fn clear_routes(&self) {
        self.table.clear_routes();
    }

    /// Remove every route carrying `label`.
    pub fn remove_routes(&self, label: &str) {
        self.table.remove_routes(label);
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<ProxyEngine> {
        &self.engine
    }

    /// Bind `127.0.0.1:port` and begin serving.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, ProxyError> {
        self.engine
            .start(port, IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
    }

    /// Bind `host:port` and begin serving.
    pub async fn start_on(&self, port: u16, host: IpAddr) -> Result<SocketAddr, ProxyError> {
        self.engine.start(port, host).await
    }

    /// Stop serving; `force` resets in-flight tunnels.
    pub async fn shutdown(&self, force: bool) {
        self.engine.shutdown(force).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(host: &str) -> Upstream {
        Upstream::new(host)
    }

    #[test]
    fn test_invalid_pattern_rejected_at_insertion() {
        let result = Route::new("bad", "(unclosed", None);
        assert!(matches!(result, Err(ProxyError::InvalidRoute { .. })));
    }

    #[test]
    fn test_first_match_wins() {
        let table = RouteTable::new();
        table.insert_route_at(
            Route::new("a", r"^foo\.local:\d+$", Some(upstream("first.proxy:3128"))).unwrap(),
            usize::MAX,
        );
        table.insert_route_at(
            Route::new("b", r"foo", Some(upstream("second.proxy:3128"))).unwrap(),
            usize::MAX,
        );

        let matched = table.match_route("foo.local:8443").unwrap().unwrap();
        assert_eq!(matched.host, "first.proxy:3128");
    }

    #[test]
    fn test_insert_at_front_takes_priority() {
        let table = RouteTable::new();
        table.insert_route(Route::new("old", "local", Some(upstream("old.proxy:1"))).unwrap());
        table.insert_route(Route::new("new", "local", Some(upstream("new.proxy:1"))).unwrap());

        let matched = table.match_route("foo.local:443").unwrap().unwrap();
        assert_eq!(matched.host, "new.proxy:1");
    }

    #[test]
    fn test_case_insensitive_matching() {
        let table = RouteTable::new();
        table.insert_route(
            Route::new("r", r"^foo\.local:\d+$", Some(upstream("p:3128"))).unwrap(),
        );
        assert!(table.match_route("FOO.LOCAL:443").is_some());
        assert!(table.match_route("Foo.Local:443").is_some());
    }

    #[test]
    fn test_containment_unless_anchored() {
        let table = RouteTable::new();
        table.insert_route(Route::new("r", "example", Some(upstream("p:3128"))).unwrap());
        // Unanchored pattern matches anywhere in the authority.
        assert!(table.match_route("sub.example.com:443").is_some());
    }

    #[test]
    fn test_null_upstream_is_direct_not_default() {
        let table = RouteTable::new();
        table.insert_route(Route::new("direct", r"^internal\.", None).unwrap());

        // Matched with null upstream: Some(None), i.e. "directly".
        assert!(matches!(table.match_route("internal.local:443"), Some(None)));
        // No match at all: None, i.e. "fall back to default_upstream".
        assert!(table.match_route("external.local:443").is_none());
    }

    #[test]
    fn test_remove_routes_by_label() {
        let table = RouteTable::new();
        table.insert_route(Route::new("keep", "a", None).unwrap());
        table.insert_route(Route::new("drop", "b", None).unwrap());
        table.insert_route(Route::new("drop", "c", None).unwrap());
        assert_eq!(table.len(), 3);

        table.remove_routes("drop");
        assert_eq!(table.len(), 1);
        assert!(table.match_route("a").is_some());
        assert!(table.match_route("b").is_none());
    }

    #[test]
    fn test_clear_then_reinsert() {
        let table = RouteTable::new();
        table.insert_route(Route::new("r", "a", None).unwrap());
        table.clear_routes();
        assert!(table.is_empty());

        table.insert_route(Route::new("r", "a", None).unwrap());
        assert_eq!(table.len(), 1);
        assert!(table.match_route("a").is_some());
    }

    #[test]
    fn test_empty_label_defaults() {
        let route = Route::new("", "a", None).unwrap();
        assert_eq!(route.label, "default");
    }

    #[test]
    fn test_routing_hooks_decisions() {
        let table = Arc::new(RouteTable::new());
        table.insert_route(Route::new("up", r"^up\.", Some(upstream("p:3128"))).unwrap());
        table.insert_route(Route::new("direct", r"^direct\.", None).unwrap());
        let hooks = RoutingHooks { table };

        let head = RequestHead {
            method: hyper::Method::CONNECT,
            uri: "up.local:443".parse().unwrap(),
            headers: hyper::HeaderMap::new(),
        };
        assert!(matches!(
            hooks.match_route("up.local:443", &head),
            RouteDecision::Upstream(_)
        ));
        assert!(matches!(
            hooks.match_route("direct.local:443", &head),
            RouteDecision::Direct
        ));
        assert!(matches!(
            hooks.match_route("other.local:443", &head),
            RouteDecision::Default
        ));
    }
}
