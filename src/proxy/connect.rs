//! Outbound connection establishment.
//!
//! Three layers live here:
//!
//! - [`direct_connect`] opens a plain TCP connection to the target origin.
//! - [`proxy_connect`] opens a connection through an upstream proxy by
//!   issuing a nested `CONNECT`, forwarding credentials, configured
//!   connect headers and the partition id, and adopting the upstream's
//!   `X-Connection-Id` when it supplies one.
//! - [`connect_with_retry`] hedges: attempt `i` starts at `i · interval`,
//!   attempts run concurrently, the first socket to connect wins and the
//!   losers are destroyed. The last error is reported only when every
//!   attempt has failed.

use super::error::ProxyError;
use super::events::{OutboundConnect, ProxyEvents};
use super::upstream::Upstream;
use super::tls;
use crate::config::ProxyOptions;
use bytes::{Buf, Bytes, BytesMut};
use rustls_pki_types::CertificateDer;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::debug;
use uuid::Uuid;

/// Upper bound on the CONNECT reply head read from an upstream proxy.
const MAX_REPLY_HEAD: usize = 16 * 1024;

/// An established outbound socket: plain TCP to origin, or TCP/TLS to an
/// upstream proxy with the tunnel already negotiated.
///
/// Bytes the upstream sent after its CONNECT reply head are replayed before
/// reads hit the socket, so an eager peer loses nothing.
#[derive(Debug)]
pub struct OutboundStream {
    io: OutboundIo,
    buffered: Bytes,
}

#[derive(Debug)]
enum OutboundIo {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl OutboundStream {
    fn tcp(stream: TcpStream) -> Self {
        Self {
            io: OutboundIo::Tcp(stream),
            buffered: Bytes::new(),
        }
    }

    fn tls(stream: tokio_rustls::client::TlsStream<TcpStream>) -> Self {
        Self {
            io: OutboundIo::Tls(Box::new(stream)),
            buffered: Bytes::new(),
        }
    }

    fn prepend(&mut self, bytes: Bytes) {
        debug_assert!(self.buffered.is_empty());
        self.buffered = bytes;
    }
}

impl AsyncRead for OutboundStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.buffered.is_empty() {
            let n = self.buffered.len().min(buf.remaining());
            buf.put_slice(&self.buffered[..n]);
            self.buffered.advance(n);
            return Poll::Ready(Ok(()));
        }
        match &mut self.io {
            OutboundIo::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            OutboundIo::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OutboundStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.io {
            OutboundIo::Tcp(s) => Pin::new(s).poll_write(cx, data),
            OutboundIo::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.io {
            OutboundIo::Tcp(s) => Pin::new(s).poll_flush(cx),
            OutboundIo::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.io {
            OutboundIo::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            OutboundIo::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// An outbound connection with its resolved identity.
#[derive(Debug)]
pub(crate) struct OutboundConnection {
    /// The established socket.
    pub stream: OutboundStream,
    /// Adopted from the upstream reply, or freshly generated.
    pub connection_id: String,
    /// Upstream the connection goes through, if any.
    pub upstream: Option<Upstream>,
}

/// Parse `hostname:port` (IPv6 literals in brackets), applying
/// `default_port` when the port is omitted.
pub(crate) fn parse_host_port(
    authority: &str,
    default_port: u16,
) -> Result<(String, u16), ProxyError> {
    if let Some((host, port_str)) = authority.rsplit_once(':') {
        if host.starts_with('[') && host.ends_with(']') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidConnect(format!("invalid port: {}", port_str)))?;
            return Ok((host[1..host.len() - 1].to_string(), port));
        }
        if host.contains(':') {
            // Bare IPv6 literal without brackets and without a port.
            return Ok((authority.to_string(), default_port));
        }
        let port = port_str
            .parse::<u16>()
            .map_err(|_| ProxyError::InvalidConnect(format!("invalid port: {}", port_str)))?;
        Ok((host.to_string(), port))
    } else {
        Ok((authority.to_string(), default_port))
    }
}

/// The hostname part of an authority, without the port.
pub(crate) fn host_only(authority: &str) -> String {
    parse_host_port(authority, 0)
        .map(|(host, _)| host)
        .unwrap_or_else(|_| authority.to_string())
}

/// Open a plain TCP connection straight to the target (port defaults
/// to 443).
pub(crate) async fn direct_connect(target: &str) -> Result<OutboundStream, ProxyError> {
    let (host, port) = parse_host_port(target, 443)?;
    let stream = TcpStream::connect((host.as_str(), port)).await?;
    Ok(OutboundStream::tcp(stream))
}

/// Open the socket toward an upstream proxy: TCP, wrapped in client TLS
/// when the upstream itself is reached over HTTPS.
pub(crate) async fn open_upstream_stream(
    upstream: &Upstream,
    roots: Vec<CertificateDer<'static>>,
) -> Result<OutboundStream, ProxyError> {
    let (host, port) = upstream.host_port();
    let stream = TcpStream::connect((host.as_str(), port)).await?;
    if upstream.use_https {
        let tls = tls::negotiate_client(stream, &host, roots, false).await?;
        Ok(OutboundStream::tls(tls))
    } else {
        Ok(OutboundStream::tcp(stream))
    }
}

/// Issue a nested `CONNECT target` through the upstream proxy.
///
/// Returns the tunneled stream and the connection id adopted from the
/// upstream's `X-Connection-Id` reply header, when present.
pub(crate) async fn proxy_connect(
    upstream: &Upstream,
    target: &str,
    partition_id: Option<&str>,
    roots: Vec<CertificateDer<'static>>,
) -> Result<(OutboundStream, Option<String>), ProxyError> {
    let mut stream = open_upstream_stream(upstream, roots).await?;

    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(auth) = upstream.basic_auth_header() {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    if let Some(partition_id) = partition_id {
        request.push_str(&format!("X-Partition-Id: {}\r\n", partition_id));
    }
    for (name, value) in &upstream.connect_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let (head, leftover) = read_reply_head(&mut stream).await?;
    let (status, connection_id) = parse_connect_reply(&head)?;
    if status != 200 {
        return Err(ProxyError::ProxyConnectionFailed {
            upstream: upstream.host.clone(),
            status,
        });
    }
    stream.prepend(leftover);
    Ok((stream, connection_id))
}

/// Read the upstream's reply up to the blank line, returning the head text
/// and any bytes that arrived past it.
async fn read_reply_head<R>(stream: &mut R) -> Result<(String, Bytes), ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = buf.split_to(end);
            let head = String::from_utf8_lossy(&head).into_owned();
            return Ok((head, buf.freeze()));
        }
        if buf.len() > MAX_REPLY_HEAD {
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized CONNECT reply head from upstream",
            )));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed before completing CONNECT reply",
            )));
        }
    }
}

/// Offset just past the `\r\n\r\n` terminator, when present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse the status code and `X-Connection-Id` header out of a CONNECT
/// reply head.
fn parse_connect_reply(head: &str) -> Result<(u16, Option<String>), ProxyError> {
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let malformed = || {
        ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed CONNECT reply: {}", status_line),
        ))
    };
    if !status_line.starts_with("HTTP/") {
        return Err(malformed());
    }
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(malformed)?;

    let mut connection_id = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("x-connection-id") {
                connection_id = Some(value.trim().to_string());
            }
        }
    }
    Ok((status, connection_id))
}

/// Establish the outbound connection with hedged attempts.
///
/// `connect_retry_attempts + 1` attempts are scheduled; attempt `i` starts
/// at `i · connect_retry_interval` and each is bounded by
/// `connect_timeout`. The first attempt whose socket connects wins;
/// remaining attempts are aborted and any socket they produce afterwards is
/// dropped. Every attempt publishes an `outbound_connect` event when it
/// starts dialing.
pub(crate) async fn connect_with_retry(
    target: &str,
    upstream: Option<Upstream>,
    partition_id: Option<String>,
    options: &ProxyOptions,
    events: &ProxyEvents,
    roots: Vec<CertificateDer<'static>>,
) -> Result<OutboundConnection, ProxyError> {
    let attempts = options.connect_retry_attempts + 1;
    let interval = options.connect_retry_interval();
    let connect_timeout = options.connect_timeout();

    let mut set = JoinSet::new();
    for attempt in 1..=attempts {
        let target = target.to_string();
        let upstream = upstream.clone();
        let partition_id = partition_id.clone();
        let events = events.clone();
        let roots = roots.clone();
        set.spawn(async move {
            if attempt > 1 {
                tokio::time::sleep(interval * (attempt - 1)).await;
            }
            events.publish_outbound_connect(OutboundConnect {
                host: target.clone(),
                upstream: upstream.clone(),
                attempt,
            });
            let dial = async {
                match &upstream {
                    Some(up) => proxy_connect(up, &target, partition_id.as_deref(), roots).await,
                    None => direct_connect(&target).await.map(|s| (s, None)),
                }
            };
            match tokio::time::timeout(connect_timeout, dial).await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::ProxyConnectionTimeout {
                    upstream: upstream.as_ref().map(|u| u.host.clone()),
                }),
            }
        });
    }

    let mut last_error: Option<ProxyError> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok((stream, adopted_id))) => {
                // Winner: cancel the rest; dropping the set destroys any
                // later-arriving sockets.
                set.abort_all();
                let connection_id =
                    adopted_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
                debug!(host = %target, connection_id = %connection_id, "outbound connected");
                return Ok(OutboundConnection {
                    stream,
                    connection_id,
                    upstream,
                });
            }
            Ok(Err(e)) => last_error = Some(e),
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => last_error = Some(ProxyError::Io(std::io::Error::other(join_err))),
        }
    }
    Err(
        last_error.unwrap_or_else(|| ProxyError::ProxyConnectionTimeout {
            upstream: upstream.map(|u| u.host),
        }),
    )
}
