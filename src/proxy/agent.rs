//! Proxy-aware client agents.
//!
//! Two complementary connection factories, used internally by the engine
//! and exported for host applications:
//!
//! - [`http_over_proxy`] forwards a plain HTTP request through an upstream
//!   proxy using an absolute-form request target.
//! - [`https_over_proxy`] opens a TLS session to an origin through an
//!   upstream proxy by issuing a nested `CONNECT` first.

use super::connect::{self, OutboundStream};
use super::error::ProxyError;
use super::upstream::Upstream;
use super::tls;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONNECTION, PROXY_AUTHORIZATION};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls_pki_types::CertificateDer;
use tracing::debug;

/// Forward `req` through the upstream proxy at HTTP level.
///
/// The request target must be absolute-form (it is sent to the upstream
/// verbatim). Keep-alive is disabled and `Proxy-Authorization` is attached
/// when the upstream carries credentials.
pub async fn http_over_proxy<B>(
    upstream: &Upstream,
    mut req: Request<B>,
    roots: Vec<CertificateDer<'static>>,
) -> Result<Response<Incoming>, ProxyError>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.uri().host().is_none() {
        return Err(ProxyError::BadRequest(
            "absolute-form request target required toward an upstream proxy".into(),
        ));
    }

    let stream = connect::open_upstream_stream(upstream, roots).await?;
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("upstream http connection ended: {}", e);
        }
    });

    if let Some(auth) = upstream.basic_auth_header() {
        let value = HeaderValue::from_str(&auth)
            .map_err(|_| ProxyError::BadRequest("unencodable proxy credentials".into()))?;
        req.headers_mut().insert(PROXY_AUTHORIZATION, value);
    }
    req.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));

    sender.send_request(req).await.map_err(ProxyError::Http)
}

/// Open a TLS session to `target` (`hostname:port`) tunneled through the
/// upstream proxy.
///
/// The nested CONNECT failing with status ≥ 400 surfaces as
/// [`ProxyError::ProxyConnectionFailed`]. The resulting session pins ALPN
/// to HTTP/1.1 and verifies against `roots`.
pub async fn https_over_proxy(
    upstream: &Upstream,
    target: &str,
    roots: Vec<CertificateDer<'static>>,
) -> Result<tokio_rustls::client::TlsStream<OutboundStream>, ProxyError> {
    let (stream, _adopted) =
        connect::proxy_connect(upstream, target, None, roots.clone()).await?;
    let host = connect::host_only(target);
    tls::negotiate_client(stream, &host, roots, true).await
}
