//! Leaf certificate store with TTL and capacity bounds.
//!
//! Minted certificates are cached by hostname. Lookups try the exact
//! hostname first, then the parent domain (first label stripped) — the
//! wildcard SAN on every leaf makes a parent's certificate valid for its
//! direct children. On a full miss a new leaf is minted and stored under
//! the exact hostname.
//!
//! Entries expire one hour before their certificate's stated validity
//! would, so a served certificate is never about to lapse.

use super::authority::CertificateAuthority;
use super::error::CertError;
use crate::config::CertStoreOptions;
use crate::proxy::CertificateIssued;
use moka::sync::Cache;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::trace;

/// A cached leaf certificate.
#[derive(Debug, Clone)]
pub struct CachedCert {
    /// Hostname the leaf was minted for.
    pub hostname: String,
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// DER-encoded certificate.
    pub cert_der: CertificateDer<'static>,
}

/// Mints and caches CA-signed leaf certificates, and terminates client TLS
/// sessions with them.
pub struct CertificateStore {
    authority: CertificateAuthority,
    cache: Cache<String, CachedCert>,
    ttl_days: i64,
    leaf_key: PrivateKeyDer<'static>,
    issued: Option<broadcast::Sender<CertificateIssued>>,
}

impl CertificateStore {
    /// Build a store from options, optionally publishing
    /// `certificate_issued` events on `issued`.
    pub fn new(
        options: CertStoreOptions,
        issued: Option<broadcast::Sender<CertificateIssued>>,
    ) -> Result<Self, CertError> {
        let authority = CertificateAuthority::from_pem(
            &options.ca_cert_pem,
            &options.ca_key_pem,
            options.leaf_key_pem.as_deref(),
        )?;
        Ok(Self::with_authority(
            authority,
            options.cert_ttl_days,
            options.cert_cache_max_entries,
            issued,
        ))
    }

    /// Build a store around an existing authority.
    pub fn with_authority(
        authority: CertificateAuthority,
        cert_ttl_days: i64,
        cert_cache_max_entries: u64,
        issued: Option<broadcast::Sender<CertificateIssued>>,
    ) -> Self {
        // One hour of safety margin under the certificate's validity.
        let ttl_secs = (cert_ttl_days * 24 * 3600 - 3600).max(1) as u64;
        Self::with_cache_ttl(
            authority,
            cert_ttl_days,
            Duration::from_secs(ttl_secs),
            cert_cache_max_entries,
            issued,
        )
    }

    fn with_cache_ttl(
        authority: CertificateAuthority,
        cert_ttl_days: i64,
        cache_ttl: Duration,
        cert_cache_max_entries: u64,
        issued: Option<broadcast::Sender<CertificateIssued>>,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(cert_cache_max_entries)
            .time_to_live(cache_ttl)
            .build();
        let leaf_key = authority.leaf_key_der();
        Self {
            authority,
            cache,
            ttl_days: cert_ttl_days,
            leaf_key,
            issued,
        }
    }

    /// Fetch the certificate covering `hostname`, minting on a full miss.
    pub fn get_certificate(&self, hostname: &str) -> Result<CachedCert, CertError> {
        let key = hostname.to_ascii_lowercase();

        if let Some(hit) = self.cache.get(&key) {
            trace!(host = %key, "certificate cache hit");
            return Ok(hit);
        }
        if let Some(parent) = parent_domain(&key) {
            if let Some(hit) = self.cache.get(&parent) {
                trace!(host = %key, parent = %parent, "wildcard cache hit");
                return Ok(hit);
            }
        }

        let minted = self.authority.mint(&key, self.ttl_days)?;
        let cached = CachedCert {
            hostname: minted.hostname,
            cert_pem: minted.cert_pem,
            cert_der: minted.cert_der,
        };
        self.cache.insert(key, cached.clone());
        if let Some(issued) = &self.issued {
            let _ = issued.send(CertificateIssued {
                hostname: cached.hostname.clone(),
                pem: cached.cert_pem.clone(),
            });
        }
        Ok(cached)
    }

    /// Wrap `io` as a server-side TLS session presenting the certificate
    /// for `hostname` (leaf plus CA in the chain, ALPN pinned to
    /// HTTP/1.1).
    pub async fn bump_client_socket<IO>(
        &self,
        hostname: &str,
        io: IO,
    ) -> Result<tokio_rustls::server::TlsStream<IO>, CertError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let cert = self.get_certificate(hostname)?;
        let chain = vec![cert.cert_der.clone(), self.authority.ca_cert_der()];
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, self.leaf_key.clone_key())
            .map_err(|e| CertError::Tls(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        TlsAcceptor::from(Arc::new(config))
            .accept(io)
            .await
            .map_err(|e| CertError::Handshake(e.to_string()))
    }

    /// PEM of the CA certificate.
    pub fn ca_cert_pem(&self) -> &str {
        self.authority.ca_cert_pem()
    }

    /// DER of the CA certificate.
    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.authority.ca_cert_der()
    }

    /// Number of cached leaves (after flushing pending cache maintenance).
    pub fn cached_leaves(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

/// The hostname with its first label stripped, when the remainder is
/// still a multi-label name (`api.example.com` → `example.com`).
fn parent_domain(hostname: &str) -> Option<String> {
    let (_, parent) = hostname.split_once('.')?;
    if parent.contains('.') {
        Some(parent.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(max_entries: u64) -> CertificateStore {
        let authority = CertificateAuthority::generate().unwrap();
        CertificateStore::with_authority(authority, 30, max_entries, None)
    }

    #[test]
    fn test_parent_domain() {
        assert_eq!(
            parent_domain("api.example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(parent_domain("example.com"), None);
        assert_eq!(parent_domain("localhost"), None);
    }

    #[test]
    fn test_mint_once_then_cache() {
        let store = store_with(16);
        let first = store.get_certificate("example.com").unwrap();
        let second = store.get_certificate("example.com").unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(store.cached_leaves(), 1);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let store = store_with(16);
        let first = store.get_certificate("Example.COM").unwrap();
        let second = store.get_certificate("example.com").unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(store.cached_leaves(), 1);
    }

    #[test]
    fn test_parent_wildcard_coverage() {
        let store = store_with(16);
        let parent = store.get_certificate("example.com").unwrap();
        // The child resolves to the parent's cached cert via the wildcard
        // SAN; nothing new is minted.
        let child = store.get_certificate("api.example.com").unwrap();
        assert_eq!(parent.cert_pem, child.cert_pem);
        assert_eq!(store.cached_leaves(), 1);
    }

    #[test]
    fn test_exact_hit_preferred_over_parent() {
        let store = store_with(16);
        let child = store.get_certificate("api.example.com").unwrap();
        let parent = store.get_certificate("example.com").unwrap();
        assert_ne!(child.cert_pem, parent.cert_pem);

        let again = store.get_certificate("api.example.com").unwrap();
        assert_eq!(child.cert_pem, again.cert_pem);
        assert_eq!(store.cached_leaves(), 2);
    }

    #[test]
    fn test_capacity_bound() {
        let store = store_with(2);
        store.get_certificate("a.example.com").unwrap();
        store.get_certificate("b.example.com").unwrap();
        store.get_certificate("c.example.com").unwrap();
        assert!(store.cached_leaves() <= 2);
    }

    #[test]
    fn test_expired_entries_are_treated_as_absent() {
        let authority = CertificateAuthority::generate().unwrap();
        let store = CertificateStore::with_cache_ttl(
            authority,
            30,
            Duration::from_millis(50),
            16,
            None,
        );

        let first = store.get_certificate("example.com").unwrap();
        std::thread::sleep(Duration::from_millis(120));
        let second = store.get_certificate("example.com").unwrap();
        // Distinct serials prove a re-mint happened.
        assert_ne!(first.cert_pem, second.cert_pem);
    }

    #[tokio::test]
    async fn test_issued_events_published_per_mint() {
        let (tx, mut rx) = broadcast::channel(8);
        let authority = CertificateAuthority::generate().unwrap();
        let store = CertificateStore::with_authority(authority, 30, 16, Some(tx));

        store.get_certificate("example.com").unwrap();
        store.get_certificate("example.com").unwrap(); // cache hit, no event

        let event = rx.recv().await.unwrap();
        assert_eq!(event.hostname, "example.com");
        assert!(rx.try_recv().is_err());
    }
}
