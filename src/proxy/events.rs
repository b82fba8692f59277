//! Typed observable events emitted by the engine.
//!
//! Instead of a stringly-typed emitter, the engine exposes one broadcast
//! channel per event kind. Subscribing is optional; publishing never blocks
//! and events are dropped when nobody listens.

use super::upstream::Upstream;
use tokio::sync::broadcast;

/// Capacity of each event channel. Slow subscribers observe `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// An outbound connect attempt was scheduled.
#[derive(Debug, Clone)]
pub struct OutboundConnect {
    /// Target `host:port` of the inbound CONNECT.
    pub host: String,
    /// Upstream the attempt goes through, if any.
    pub upstream: Option<Upstream>,
    /// 1-based attempt number within the hedged group.
    pub attempt: u32,
}

/// A leaf certificate was minted by the certificate store.
#[derive(Debug, Clone)]
pub struct CertificateIssued {
    /// Hostname the leaf was minted for.
    pub hostname: String,
    /// PEM-encoded certificate.
    pub pem: String,
}

/// A classified (non-muted) error was observed by the engine.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Symbolic error code, when the error maps onto one.
    pub code: Option<String>,
    /// Rendered error message.
    pub message: String,
    /// Which engine variant reported the error.
    pub proxy_class: &'static str,
    /// Method of the request being handled, when known.
    pub method: Option<String>,
    /// Request target, when known.
    pub url: Option<String>,
}

/// The engine's typed event channels.
#[derive(Debug, Clone)]
pub struct ProxyEvents {
    outbound_connect: broadcast::Sender<OutboundConnect>,
    certificate_issued: broadcast::Sender<CertificateIssued>,
    error: broadcast::Sender<ErrorEvent>,
}

impl ProxyEvents {
    /// Create a fresh set of channels.
    pub fn new() -> Self {
        Self {
            outbound_connect: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            certificate_issued: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            error: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to outbound connect attempts.
    pub fn subscribe_outbound_connect(&self) -> broadcast::Receiver<OutboundConnect> {
        self.outbound_connect.subscribe()
    }

    /// Subscribe to certificate issuance.
    pub fn subscribe_certificate_issued(&self) -> broadcast::Receiver<CertificateIssued> {
        self.certificate_issued.subscribe()
    }

    /// Subscribe to classified errors.
    pub fn subscribe_error(&self) -> broadcast::Receiver<ErrorEvent> {
        self.error.subscribe()
    }

    pub(crate) fn publish_outbound_connect(&self, event: OutboundConnect) {
        let _ = self.outbound_connect.send(event);
    }

    pub(crate) fn publish_error(&self, event: ErrorEvent) {
        let _ = self.error.send(event);
    }

    pub(crate) fn certificate_sender(&self) -> broadcast::Sender<CertificateIssued> {
        self.certificate_issued.clone()
    }
}

impl Default for ProxyEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let events = ProxyEvents::new();
        events.publish_outbound_connect(OutboundConnect {
            host: "example.com:443".into(),
            upstream: None,
            attempt: 1,
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let events = ProxyEvents::new();
        let mut rx = events.subscribe_outbound_connect();
        events.publish_outbound_connect(OutboundConnect {
            host: "example.com:443".into(),
            upstream: None,
            attempt: 1,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.host, "example.com:443");
        assert_eq!(event.attempt, 1);
    }

    #[tokio::test]
    async fn test_certificate_sender_feeds_subscribers() {
        let events = ProxyEvents::new();
        let mut rx = events.subscribe_certificate_issued();
        let tx = events.certificate_sender();
        tx.send(CertificateIssued {
            hostname: "example.com".into(),
            pem: "-----BEGIN CERTIFICATE-----".into(),
        })
        .unwrap();
        assert_eq!(rx.recv().await.unwrap().hostname, "example.com");
    }
}
