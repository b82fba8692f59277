//! The base proxy engine.
//!
//! [`ProxyEngine`] accepts inbound connections, dispatches HTTP vs CONNECT,
//! performs route lookup through its hooks, establishes the outbound
//! connection with hedged retry, tracks open connections, relays bytes and
//! classifies errors. [`ProxyServer`] is the plain variant; the routing and
//! bumping variants embed the same engine with their own hook defaults.
//!
//! Each inbound connection is served by hyper's HTTP/1.1 server with
//! upgrade support; CONNECT tunnels run on the upgraded IO in their own
//! task. Every per-connection task is registered so that a forced shutdown
//! can reset in-flight transfers.

use super::agent;
use super::bump::BumpTunnel;
use super::conn::{Connection, ConnectionTracker, ProxyStats};
use super::connect;
use super::error::{ProxyError, Severity};
use super::events::{ErrorEvent, ProxyEvents};
use super::hooks::{DefaultHooks, ProxyHooks, RequestHead, RouteDecision};
use super::upstream::Upstream;
use crate::config::ProxyOptions;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::PROXY_AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// How CONNECT tunnels are realized by an engine instance.
pub(crate) enum TunnelKind {
    /// Opaque byte relay between client and outbound sockets.
    Passthrough,
    /// Re-terminate and re-originate TLS around the tunnel.
    Bump(Arc<BumpTunnel>),
}

/// Handle to the running accept loop.
struct Running {
    shutdown_tx: watch::Sender<bool>,
    accept: JoinHandle<()>,
}

/// Registry of live per-connection tasks, so a forced shutdown can destroy
/// every tracked client socket at once.
#[derive(Default)]
pub(crate) struct TaskRegistry {
    next: AtomicU64,
    tasks: Mutex<HashMap<u64, AbortHandle>>,
}

impl TaskRegistry {
    fn spawn<F>(self: &Arc<Self>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            let _cleanup = TaskGuard { registry, id };
            fut.await;
        });
        let mut tasks = self.tasks.lock().expect("task registry poisoned");
        tasks.insert(id, handle.abort_handle());
        // The task may have finished (and its guard fired) before the
        // insert above; drop the stale handle in that case.
        if handle.is_finished() {
            tasks.remove(&id);
        }
    }

    fn abort_all(&self) {
        let handles: Vec<AbortHandle> = self
            .tasks
            .lock()
            .expect("task registry poisoned")
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in handles {
            handle.abort();
        }
    }

    fn len(&self) -> usize {
        self.tasks.lock().expect("task registry poisoned").len()
    }
}

struct TaskGuard {
    registry: Arc<TaskRegistry>,
    id: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.registry
            .tasks
            .lock()
            .expect("task registry poisoned")
            .remove(&self.id);
    }
}

/// The proxy engine shared by every variant.
pub struct ProxyEngine {
    class: &'static str,
    options: ProxyOptions,
    hooks: Arc<dyn ProxyHooks>,
    tunnel: TunnelKind,
    tracker: Arc<ConnectionTracker>,
    stats: Arc<ProxyStats>,
    events: ProxyEvents,
    tasks: Arc<TaskRegistry>,
    state: tokio::sync::Mutex<Option<Running>>,
    local_addr: RwLock<Option<SocketAddr>>,
    http_client: Client<HttpConnector, Incoming>,
}

impl ProxyEngine {
    pub(crate) fn new(
        class: &'static str,
        options: ProxyOptions,
        hooks: Arc<dyn ProxyHooks>,
        tunnel: TunnelKind,
        events: ProxyEvents,
    ) -> Arc<Self> {
        Self::with_stats(
            class,
            options,
            hooks,
            tunnel,
            events,
            Arc::new(ProxyStats::default()),
        )
    }

    pub(crate) fn with_stats(
        class: &'static str,
        options: ProxyOptions,
        hooks: Arc<dyn ProxyHooks>,
        tunnel: TunnelKind,
        events: ProxyEvents,
        stats: Arc<ProxyStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            class,
            options,
            hooks,
            tunnel,
            tracker: Arc::new(ConnectionTracker::default()),
            stats,
            events,
            tasks: Arc::new(TaskRegistry::default()),
            state: tokio::sync::Mutex::new(None),
            local_addr: RwLock::new(None),
            http_client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }

    /// Bind and begin serving. Returns the bound address (useful with
    /// port 0).
    pub async fn start(self: &Arc<Self>, port: u16, host: IpAddr) -> Result<SocketAddr, ProxyError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ProxyError::BadRequest("server already running".into()));
        }

        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.write().expect("local addr poisoned") = Some(addr);
        self.stats.reset();
        info!(class = self.class, %addr, "proxy listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = self.clone();
        let accept = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _peer)) => {
                            debug!(class = engine.class, "accepted inbound connection");
                            engine.spawn_connection(stream);
                        }
                        Err(e) => warn!("failed to accept connection: {}", e),
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!(class = engine.class, "proxy stopped accepting");
                            break;
                        }
                    }
                }
            }
        });

        *state = Some(Running {
            shutdown_tx,
            accept,
        });
        Ok(addr)
    }

    /// Stop accepting. With `force`, every in-flight connection task is
    /// aborted, which destroys the tracked client sockets and clears the
    /// tracking map; without it, in-flight transfers drain on their own.
    pub async fn shutdown(&self, force: bool) {
        let running = self.state.lock().await.take();
        if let Some(Running {
            shutdown_tx,
            accept,
        }) = running
        {
            let _ = shutdown_tx.send(true);
            let _ = accept.await;
        }
        if force {
            self.tasks.abort_all();
        }
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().expect("local addr poisoned")
    }

    /// Transfer counters for this engine instance.
    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// The live connection tracking map.
    pub fn connections(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// The engine's typed event channels.
    pub fn events(&self) -> &ProxyEvents {
        &self.events
    }

    /// The engine's options.
    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Number of live per-connection tasks.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream) {
        let engine = self.clone();
        self.tasks.spawn(async move {
            let io = TokioIo::new(stream);
            let service_engine = engine.clone();
            let service = service_fn(move |req: Request<Incoming>| {
                let engine = service_engine.clone();
                async move { Ok::<_, Infallible>(engine.handle_request(req).await) }
            });
            if let Err(e) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                engine.report_error(&ProxyError::Http(e), None, None);
            }
        });
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let result = if method == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.handle_http(req).await
        };
        match result {
            Ok(response) => response,
            Err(e) => {
                self.report_error(&e, Some(&method), Some(&uri));
                error_response(&e)
            }
        }
    }

    /// CONNECT path: authenticate, route, establish outbound with hedged
    /// retry, reply `200` with the connection id, then run the tunnel on
    /// the upgraded IO.
    async fn handle_connect(
        self: &Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
        let head = RequestHead::of(&req);
        self.hooks.authenticate(&head)?;

        let target = req
            .uri()
            .authority()
            .ok_or_else(|| {
                ProxyError::InvalidConnect("missing authority in CONNECT request".into())
            })?
            .to_string();
        let upstream = self.resolve_upstream(&target, &head);
        let partition_id = head.header("x-partition-id").map(str::to_string);
        let roots = self.hooks.ca_certificates();

        let outbound = connect::connect_with_retry(
            &target,
            upstream.clone(),
            partition_id.clone(),
            &self.options,
            &self.events,
            roots.clone(),
        )
        .await?;
        let connection_id = outbound.connection_id.clone();
        let tracked = self.tracker.insert(Connection {
            connection_id: connection_id.clone(),
            partition_id,
            upstream,
            host: target.clone(),
        });

        match &self.tunnel {
            TunnelKind::Passthrough => {
                let engine = self.clone();
                let mut remote = outbound.stream;
                let on_upgrade = hyper::upgrade::on(req);
                self.tasks.spawn(async move {
                    let _tracked = tracked;
                    match on_upgrade.await {
                        Ok(upgraded) => {
                            let mut client = TokioIo::new(upgraded);
                            match tokio::io::copy_bidirectional(&mut client, &mut remote).await {
                                Ok((to_remote, from_remote)) => {
                                    engine.stats.record(from_remote, to_remote);
                                    debug!(host = %target, "tunnel closed");
                                }
                                // Relay-phase errors are classified and
                                // logged only; there is no response left
                                // to send.
                                Err(e) => engine.report_error(
                                    &ProxyError::Io(e),
                                    Some(&Method::CONNECT),
                                    None,
                                ),
                            }
                        }
                        Err(e) => engine.report_error(
                            &ProxyError::Http(e),
                            Some(&Method::CONNECT),
                            None,
                        ),
                    }
                });
            }
            TunnelKind::Bump(bump) => {
                let hostname = connect::host_only(&target);
                // Negotiate outward TLS before replying 200, so failures
                // still reach the client as an HTTP error on the plain
                // socket.
                let tls_remote = bump
                    .negotiate_outward(outbound.stream, &hostname, roots)
                    .await?;
                let engine = self.clone();
                let bump = bump.clone();
                let bridge_head = head.clone();
                let on_upgrade = hyper::upgrade::on(req);
                self.tasks.spawn(async move {
                    let _tracked = tracked;
                    match on_upgrade.await {
                        Ok(upgraded) => {
                            if let Err(e) = bump
                                .bridge(TokioIo::new(upgraded), tls_remote, bridge_head, hostname)
                                .await
                            {
                                engine.report_error(&e, Some(&Method::CONNECT), None);
                            }
                        }
                        Err(e) => engine.report_error(
                            &ProxyError::Http(e),
                            Some(&Method::CONNECT),
                            None,
                        ),
                    }
                });
            }
        }

        Response::builder()
            .status(StatusCode::OK)
            .header("X-Connection-Id", connection_id)
            .body(empty_body())
            .map_err(|e| ProxyError::BadRequest(format!("unencodable CONNECT reply: {}", e)))
    }

    /// HTTP path: authenticate, route by target authority, forward with
    /// the body streamed through, and relay the response back.
    async fn handle_http(
        self: &Arc<Self>,
        mut req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
        let head = RequestHead::of(&req);
        self.hooks.authenticate(&head)?;

        let host = req.uri().host().ok_or_else(|| {
            ProxyError::BadRequest("absolute-form request target required".into())
        })?;
        let authority = match req.uri().port_u16() {
            Some(port) => format!("{}:{}", host, port),
            None => format!("{}:80", host),
        };
        let upstream = self.resolve_upstream(&authority, &head);

        // Inbound proxy hop headers are consumed here, not forwarded.
        req.headers_mut().remove(PROXY_AUTHORIZATION);
        req.headers_mut().remove("proxy-connection");

        let response = match upstream {
            Some(upstream) => {
                agent::http_over_proxy(&upstream, req, self.hooks.ca_certificates()).await?
            }
            None => self
                .http_client
                .request(req)
                .await
                .map_err(|e| ProxyError::Forward(e.to_string()))?,
        };
        Ok(response.map(|body| body.boxed()))
    }

    fn resolve_upstream(&self, host: &str, head: &RequestHead) -> Option<Upstream> {
        match self.hooks.match_route(host, head) {
            RouteDecision::Upstream(upstream) => Some(upstream),
            RouteDecision::Direct => None,
            RouteDecision::Default => self.options.default_upstream.clone(),
        }
    }

    /// Classify an error, log it at the classified level and publish it on
    /// the error channel. Muted codes are discarded entirely.
    pub(crate) fn report_error(
        &self,
        error: &ProxyError,
        method: Option<&Method>,
        url: Option<&Uri>,
    ) {
        match self.options.severity_of(error) {
            Severity::Mute => return,
            Severity::Warn => {
                warn!(class = self.class, method = ?method, url = ?url, "{}", error)
            }
            Severity::Error => {
                error!(class = self.class, method = ?method, url = ?url, "{}", error)
            }
        }
        self.events.publish_error(ErrorEvent {
            code: error.code().map(str::to_string),
            message: error.to_string(),
            proxy_class: self.class,
            method: method.map(|m| m.to_string()),
            url: url.map(|u| u.to_string()),
        });
    }
}

/// Create an empty response body.
fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Create a response body with content.
fn full_body(content: String) -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

/// Map an error to the HTTP response the client sees.
fn error_response(error: &ProxyError) -> Response<BoxBody<Bytes, hyper::Error>> {
    let status =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::BAD_GATEWAY);
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(error.to_string()))
        .unwrap()
}

/// The plain proxy variant: CONNECT tunnels are opaque byte relays.
pub struct ProxyServer {
    engine: Arc<ProxyEngine>,
}

impl ProxyServer {
    /// Create a plain proxy with default hooks.
    pub fn new(options: ProxyOptions) -> Self {
        Self::with_hooks(options, Arc::new(DefaultHooks))
    }

    /// Create a plain proxy with custom hooks.
    pub fn with_hooks(options: ProxyOptions, hooks: Arc<dyn ProxyHooks>) -> Self {
        Self {
            engine: ProxyEngine::new(
                "ProxyServer",
                options,
                hooks,
                TunnelKind::Passthrough,
                ProxyEvents::new(),
            ),
        }
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
