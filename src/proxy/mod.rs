//! Forward proxy engine, routing and SSL bumping.
//!
//! The engine handles plain HTTP forwarding and CONNECT tunneling with
//! hedged outbound connects, connection tracking and typed events. Three
//! front-ends wrap it:
//!
//! - [`ProxyServer`]: opaque CONNECT tunnels, hook-driven routing.
//! - [`RoutingProxy`]: a first-match-wins host-pattern route table.
//! - [`SslBumpProxy`]: re-terminates client TLS with minted certificates
//!   and re-originates TLS toward origin, exposing the decrypted pair to a
//!   replaceable bridge.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use sslbump::config::ProxyOptions;
//! use sslbump::proxy::{Route, RoutingProxy, Upstream};
//!
//! let proxy = RoutingProxy::new(ProxyOptions::default());
//! proxy.insert_route(Route::new(
//!     "corp",
//!     r"^.*\.corp\.example:\d+$",
//!     Some(Upstream::new("gateway.corp.example:3128")),
//! )?);
//! let addr = proxy.start(0).await?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

pub mod agent;
mod bump;
mod conn;
mod connect;
pub mod error;
mod events;
mod hooks;
mod routes;
mod server;
mod tls;
mod upstream;

pub use bump::{SslBumpProxy, TlsBridgeFn, TlsClient, TlsRemote};
pub use conn::{Connection, ConnectionTracker, ProxyStats};
pub use connect::OutboundStream;
pub use error::{ProxyError, ProxyResult, Severity};
pub use events::{CertificateIssued, ErrorEvent, OutboundConnect, ProxyEvents};
pub use hooks::{DefaultHooks, ProxyHooks, RequestHead, RouteDecision};
pub use routes::{Route, RouteTable, RoutingProxy};
pub use server::{ProxyEngine, ProxyServer};
pub use tls::{client_config, negotiate_client, server_name, system_roots};
pub use upstream::Upstream;
