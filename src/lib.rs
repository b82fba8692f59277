//! sslbump: building-block forward HTTP/HTTPS proxy framework
//!
//! This crate provides the pieces needed to assemble a forward proxy:
//!
//! - **Plain HTTP forwarding** of absolute-form requests, directly to origin
//!   or through a chained upstream proxy.
//! - **HTTPS tunneling** via the CONNECT method, with hedged outbound
//!   connection attempts and connection tracking.
//! - **SSL bumping**: terminating a client's TLS session with a dynamically
//!   minted, CA-signed leaf certificate while opening a second TLS session
//!   to origin, so traffic in between is inspectable cleartext.
//!
//! # Architecture
//!
//! - `proxy`: the engine ([`proxy::ProxyServer`]), the routing variant
//!   ([`proxy::RoutingProxy`]) and the bumping variant
//!   ([`proxy::SslBumpProxy`]), plus the upstream descriptor, error
//!   taxonomy, typed events and proxy-aware client agents.
//! - `certs`: the certificate authority and the TTL/LRU-bounded leaf store.
//! - `config`: the options bundles with serde-backed defaults.
//!
//! Protocol parsing is delegated to hyper; the engine consumes parsed
//! request heads and raw upgraded sockets. Logging goes through `tracing`;
//! install whatever subscriber fits the host application.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod certs;
pub mod config;
pub mod proxy;
