//! TLS context builders for outbound sessions.
//!
//! The proxy acts as a TLS client in two places: toward origin when
//! re-originating a bumped tunnel, and toward an upstream proxy that is
//! itself reached over TLS. Both use contexts built here.
//!
//! ALPN is pinned to HTTP/1.1 on bumped paths. Allowing H2 negotiation
//! would break the byte bridges: the relay does not understand H2 framing.

use super::error::ProxyError;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{CertificateDer, ServerName};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Timeout for outbound TLS handshakes.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Load the system root certificates.
///
/// Per-certificate load failures are logged and skipped; an empty result is
/// possible on minimal systems and surfaces later as a handshake failure.
pub fn system_roots() -> Vec<CertificateDer<'static>> {
    let loaded = rustls_native_certs::load_native_certs();
    for err in loaded.errors {
        debug!("skipping unloadable native root: {}", err);
    }
    loaded.certs
}

/// Build a client config trusting exactly `roots`, with optional HTTP/1.1
/// ALPN pinning.
pub fn client_config(
    roots: Vec<CertificateDer<'static>>,
    alpn_http1: bool,
) -> Result<ClientConfig, ProxyError> {
    let mut store = RootCertStore::empty();
    for cert in roots {
        if let Err(e) = store.add(cert) {
            debug!("skipping unparseable root certificate: {}", e);
        }
    }
    if store.is_empty() {
        return Err(ProxyError::Tls("no trusted root certificates".into()));
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(store)
        .with_no_client_auth();
    if alpn_http1 {
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
    }
    Ok(config)
}

/// Convert a hostname into a TLS server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Tls(format!("invalid server name: {}", host)))
}

/// Negotiate a client-side TLS session over `stream`.
///
/// Verification failures surface as [`ProxyError::RemoteConnectionNotAuthorized`];
/// the handshake is bounded by a 60 second timeout.
pub async fn negotiate_client<IO>(
    stream: IO,
    host: &str,
    roots: Vec<CertificateDer<'static>>,
    alpn_http1: bool,
) -> Result<tokio_rustls::client::TlsStream<IO>, ProxyError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let config = client_config(roots, alpn_http1)?;
    let connector = TlsConnector::from(Arc::new(config));
    let name = server_name(host)?;

    let handshake = connector.connect(name, stream);
    match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, handshake).await {
        Ok(Ok(tls)) => Ok(tls),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
            // rustls reports certificate/verification failures as InvalidData.
            Err(ProxyError::RemoteConnectionNotAuthorized {
                host: host.to_string(),
            })
        }
        Ok(Err(e)) => Err(ProxyError::Io(e)),
        Err(_) => Err(ProxyError::ProxyConnectionTimeout { upstream: None }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_accepts_hostnames() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("api.github.com").is_ok());
        assert!(server_name("").is_err());
    }

    #[test]
    fn test_client_config_requires_roots() {
        let result = client_config(Vec::new(), false);
        assert!(matches!(result, Err(ProxyError::Tls(_))));
    }

    #[test]
    fn test_client_config_alpn_pinning() {
        let authority = crate::certs::CertificateAuthority::generate().unwrap();
        let roots = vec![authority.ca_cert_der()];

        let pinned = client_config(roots.clone(), true).unwrap();
        assert_eq!(pinned.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let unpinned = client_config(roots, false).unwrap();
        assert!(unpinned.alpn_protocols.is_empty());
    }
}
