//! End-to-end SSL bumping: a client that trusts the proxy's CA tunnels
//! through CONNECT, the proxy re-terminates TLS with a minted leaf and
//! re-originates TLS to a fixture HTTPS origin, and request/response
//! bodies round-trip intact.

use sslbump::certs::{CertificateAuthority, CertificateStore};
use sslbump::config::{CertStoreOptions, ProxyOptions};
use sslbump::proxy::{
    negotiate_client, DefaultHooks, ProxyHooks, SslBumpProxy,
};
use rustls_pki_types::CertificateDer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Fixture HTTPS origin with its own CA: replies
/// `You requested <METHOD> <PATH> over https`, appending the request body
/// on its own line when one was sent.
async fn spawn_https_origin() -> (SocketAddr, CertificateDer<'static>) {
    let origin_ca = CertificateAuthority::generate().unwrap();
    let ca_der = origin_ca.ca_cert_der();
    let store = CertificateStore::with_authority(origin_ca, 30, 4, None);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let mut tls = match store.bump_client_socket("localhost", socket).await {
                Ok(tls) => tls,
                Err(_) => continue,
            };
            tokio::spawn(async move {
                let mut collected = Vec::new();
                let mut buf = [0u8; 1024];
                let head_end = loop {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => collected.extend_from_slice(&buf[..n]),
                    }
                    if let Some(p) = collected.windows(4).position(|w| w == b"\r\n\r\n") {
                        break p + 4;
                    }
                };

                let head = String::from_utf8_lossy(&collected[..head_end]).into_owned();
                let mut parts = head.split_whitespace();
                let method = parts.next().unwrap_or("?").to_string();
                let path = parts.next().unwrap_or("?").to_string();
                let content_length: usize = head
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.trim()
                            .eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse().ok())?
                    })
                    .unwrap_or(0);

                let mut body = collected[head_end..].to_vec();
                while body.len() < content_length {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => body.extend_from_slice(&buf[..n]),
                    }
                }

                let mut reply_body = format!("You requested {} {} over https", method, path);
                if !body.is_empty() {
                    reply_body.push('\n');
                    reply_body.push_str(&String::from_utf8_lossy(&body));
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    reply_body.len(),
                    reply_body
                );
                let _ = tls.write_all(response.as_bytes()).await;
                let _ = tls.shutdown().await;
            });
        }
    });
    (addr, ca_der)
}

/// Hook set trusting the fixture origin's CA for outbound sessions.
struct TrustOriginCa {
    ca: CertificateDer<'static>,
}

impl ProxyHooks for TrustOriginCa {
    fn ca_certificates(&self) -> Vec<CertificateDer<'static>> {
        vec![self.ca.clone()]
    }
}

fn bump_proxy_options() -> (CertStoreOptions, CertificateDer<'static>) {
    let proxy_ca = CertificateAuthority::generate().unwrap();
    let ca_der = proxy_ca.ca_cert_der();
    let options = CertStoreOptions {
        ca_cert_pem: proxy_ca.ca_cert_pem().to_string(),
        ca_key_pem: proxy_ca.ca_key_pem().to_string(),
        leaf_key_pem: None,
        cert_ttl_days: 30,
        cert_cache_max_entries: 16,
    };
    (options, ca_der)
}

/// CONNECT through the proxy, then bump up to TLS trusting the proxy CA.
async fn open_bumped_session(
    proxy: SocketAddr,
    target: &str,
    proxy_ca: CertificateDer<'static>,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let connect = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    stream.write_all(connect.as_bytes()).await.unwrap();

    let mut collected = Vec::new();
    let mut buf = [0u8; 256];
    while !collected.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "proxy closed before CONNECT reply");
        collected.extend_from_slice(&buf[..n]);
    }
    let head = String::from_utf8_lossy(&collected).into_owned();
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected reply: {head}");

    negotiate_client(stream, "localhost", vec![proxy_ca], true)
        .await
        .unwrap()
}

async fn exchange(
    tls: &mut tokio_rustls::client::TlsStream<TcpStream>,
    request: &str,
) -> String {
    tls.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match tls.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn bumped_get_and_post_round_trip() {
    let (origin, origin_ca) = spawn_https_origin().await;
    let (cert_options, proxy_ca) = bump_proxy_options();

    let proxy = SslBumpProxy::with_hooks(
        ProxyOptions::default(),
        cert_options,
        Arc::new(TrustOriginCa { ca: origin_ca }),
        None,
    )
    .unwrap();
    let addr = proxy.start(0).await.unwrap();
    let mut issued = proxy.engine().events().subscribe_certificate_issued();

    // GET round-trips in cleartext on both decrypted legs.
    let mut session =
        open_bumped_session(addr, &format!("localhost:{}", origin.port()), proxy_ca.clone())
            .await;
    let response = exchange(
        &mut session,
        "GET /foo HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("You requested GET /foo over https"));

    // The proxy minted a leaf for the target hostname.
    let event = issued.recv().await.unwrap();
    assert_eq!(event.hostname, "localhost");
    assert!(event.pem.contains("BEGIN CERTIFICATE"));

    // POST carries its body across the bump.
    let mut session =
        open_bumped_session(addr, &format!("localhost:{}", origin.port()), proxy_ca).await;
    let response = exchange(
        &mut session,
        "POST /bar HTTP/1.1\r\nHost: localhost\r\nContent-Length: 12\r\nConnection: close\r\n\r\nHello world!",
    )
    .await;
    assert!(response.ends_with("You requested POST /bar over https\nHello world!"));

    proxy.shutdown(true).await;
}

#[tokio::test]
async fn untrusted_origin_is_rejected_before_the_bridge() {
    let (origin, _origin_ca) = spawn_https_origin().await;
    let (cert_options, _proxy_ca) = bump_proxy_options();

    // Default hooks: system roots plus the proxy CA — the fixture origin's
    // CA is not among them.
    let proxy = SslBumpProxy::with_hooks(
        ProxyOptions::default(),
        cert_options,
        Arc::new(DefaultHooks),
        None,
    )
    .unwrap();
    let addr = proxy.start(0).await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let target = format!("localhost:{}", origin.port());
    let connect = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    stream.write_all(connect.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
        }
    }
    let head = String::from_utf8_lossy(&response).into_owned();
    // The outward TLS session failed verification: the client gets the
    // error on the plain socket, before any handshake with it.
    assert!(head.starts_with("HTTP/1.1 502"), "unexpected reply: {head}");

    proxy.shutdown(true).await;
}

#[tokio::test]
async fn leaf_reused_across_sessions_to_same_host() {
    let (origin, origin_ca) = spawn_https_origin().await;
    let (cert_options, proxy_ca) = bump_proxy_options();

    let proxy = SslBumpProxy::with_hooks(
        ProxyOptions::default(),
        cert_options,
        Arc::new(TrustOriginCa { ca: origin_ca }),
        None,
    )
    .unwrap();
    let addr = proxy.start(0).await.unwrap();

    for _ in 0..2 {
        let mut session = open_bumped_session(
            addr,
            &format!("localhost:{}", origin.port()),
            proxy_ca.clone(),
        )
        .await;
        let response = exchange(
            &mut session,
            "GET /again HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.ends_with("You requested GET /again over https"));
    }

    // One leaf, two sessions.
    assert_eq!(proxy.store().cached_leaves(), 1);

    proxy.shutdown(true).await;
}
