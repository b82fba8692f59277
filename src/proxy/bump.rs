//! The SSL-bump proxy variant.
//!
//! On CONNECT, instead of relaying opaque bytes, the engine re-terminates
//! the client's TLS session with a leaf certificate minted for the target
//! hostname and re-originates a second TLS session toward origin (or
//! through the routed upstream). The two decrypted endpoints are then
//! handed to the `handle_tls` bridge — a passthrough relay by default,
//! replaceable for inspection, rewriting or response fabrication.
//!
//! For any live bumped session exactly two TLS contexts exist: one
//! server-side toward the client, one client-side toward origin.

use super::connect::OutboundStream;
use super::conn::ProxyStats;
use super::error::ProxyError;
use super::events::ProxyEvents;
use super::hooks::{DefaultHooks, ProxyHooks, RequestHead, RouteDecision};
use super::server::{ProxyEngine, TunnelKind};
use super::tls;
use crate::certs::CertificateStore;
use crate::config::{CertStoreOptions, ProxyOptions};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rustls_pki_types::CertificateDer;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Server-side TLS session toward the bumped client.
pub type TlsClient = tokio_rustls::server::TlsStream<TokioIo<Upgraded>>;

/// Client-side TLS session toward origin (possibly through an upstream).
pub type TlsRemote = tokio_rustls::client::TlsStream<OutboundStream>;

/// The `handle_tls` hook: owns both decrypted endpoints of a bumped
/// tunnel. The default is pure passthrough; replacements implement
/// inspection or rewriting.
pub type TlsBridgeFn = Arc<
    dyn Fn(
            TlsClient,
            TlsRemote,
            RequestHead,
        ) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send>>
        + Send
        + Sync,
>;

/// Bump-mode tunnel state shared by the engine's CONNECT handler.
pub(crate) struct BumpTunnel {
    store: Arc<CertificateStore>,
    handle_tls: TlsBridgeFn,
}

impl BumpTunnel {
    fn new(store: Arc<CertificateStore>, stats: Arc<ProxyStats>) -> Self {
        Self {
            store,
            handle_tls: passthrough_bridge(stats),
        }
    }

    fn with_bridge(store: Arc<CertificateStore>, handle_tls: TlsBridgeFn) -> Self {
        Self { store, handle_tls }
    }

    /// Negotiate the client-side TLS session toward origin over the
    /// established outbound socket. Runs before the CONNECT reply so
    /// failures surface as an HTTP error on the plain inbound socket.
    pub(crate) async fn negotiate_outward(
        &self,
        stream: OutboundStream,
        hostname: &str,
        roots: Vec<CertificateDer<'static>>,
    ) -> Result<TlsRemote, ProxyError> {
        tls::negotiate_client(stream, hostname, roots, true).await
    }

    /// Terminate the client's TLS with a minted certificate, then run the
    /// `handle_tls` bridge over the two decrypted endpoints.
    pub(crate) async fn bridge(
        &self,
        client_io: TokioIo<Upgraded>,
        tls_remote: TlsRemote,
        head: RequestHead,
        hostname: String,
    ) -> Result<(), ProxyError> {
        let tls_client = self.store.bump_client_socket(&hostname, client_io).await?;
        debug!(host = %hostname, "bumped tunnel established");
        (self.handle_tls)(tls_client, tls_remote, head).await
    }
}

/// Default bridge: full-duplex byte relay with graceful half-close; EOF on
/// one decrypted endpoint half-closes the other's write end.
fn passthrough_bridge(stats: Arc<ProxyStats>) -> TlsBridgeFn {
    Arc::new(move |mut client, mut remote, _head| {
        let stats = stats.clone();
        Box::pin(async move {
            let (to_remote, from_remote) =
                tokio::io::copy_bidirectional(&mut client, &mut remote).await?;
            stats.record(from_remote, to_remote);
            Ok(())
        })
    })
}

/// Hook adapter injecting the bump CA into the outbound trust roots, so
/// chained SSL-bumped peers trust each other.
struct BumpHooks {
    inner: Arc<dyn ProxyHooks>,
    ca: CertificateDer<'static>,
}

impl ProxyHooks for BumpHooks {
    fn match_route(&self, host: &str, req: &RequestHead) -> RouteDecision {
        self.inner.match_route(host, req)
    }

    fn authenticate(&self, req: &RequestHead) -> Result<(), ProxyError> {
        self.inner.authenticate(req)
    }

    fn ca_certificates(&self) -> Vec<CertificateDer<'static>> {
        let mut roots = self.inner.ca_certificates();
        roots.push(self.ca.clone());
        roots
    }
}

/// A proxy engine that bumps CONNECT tunnels through its certificate
/// store.
pub struct SslBumpProxy {
    engine: Arc<ProxyEngine>,
    store: Arc<CertificateStore>,
}

impl SslBumpProxy {
    /// Create a bumping proxy from certificate store options.
    pub fn new(options: ProxyOptions, cert_options: CertStoreOptions) -> Result<Self, ProxyError> {
        Self::with_hooks(options, cert_options, Arc::new(DefaultHooks), None)
    }

    /// Create a bumping proxy with custom hooks and, optionally, a
    /// replacement `handle_tls` bridge.
    ///
    /// The hooks' `ca_certificates` are automatically extended with the
    /// store's CA certificate.
    pub fn with_hooks(
        options: ProxyOptions,
        cert_options: CertStoreOptions,
        hooks: Arc<dyn ProxyHooks>,
        handle_tls: Option<TlsBridgeFn>,
    ) -> Result<Self, ProxyError> {
        let events = ProxyEvents::new();
        let store = Arc::new(CertificateStore::new(
            cert_options,
            Some(events.certificate_sender()),
        )?);
        Ok(Self::assemble(options, store, events, hooks, handle_tls))
    }

    /// Create a bumping proxy around an existing certificate store.
    pub fn with_store(
        options: ProxyOptions,
        store: Arc<CertificateStore>,
        events: ProxyEvents,
    ) -> Self {
        Self::assemble(options, store, events, Arc::new(DefaultHooks), None)
    }

    fn assemble(
        options: ProxyOptions,
        store: Arc<CertificateStore>,
        events: ProxyEvents,
        hooks: Arc<dyn ProxyHooks>,
        handle_tls: Option<TlsBridgeFn>,
    ) -> Self {
        let hooks: Arc<dyn ProxyHooks> = Arc::new(BumpHooks {
            inner: hooks,
            ca: store.ca_cert_der(),
        });
        let stats = Arc::new(ProxyStats::default());
        let tunnel = match handle_tls {
            Some(bridge) => BumpTunnel::with_bridge(store.clone(), bridge),
            None => BumpTunnel::new(store.clone(), stats.clone()),
        };
        let engine = ProxyEngine::with_stats(
            "SslBumpProxy",
            options,
            hooks,
            TunnelKind::Bump(Arc::new(tunnel)),
            events,
            stats,
        );
        Self { engine, store }
    }

    /// The certificate store minting leaves for bumped sessions.
    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    /// PEM of the CA clients must trust.
    pub fn ca_cert_pem(&self) -> &str {
        self.store.ca_cert_pem()
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
