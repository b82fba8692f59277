//! Certificate authority and leaf store for SSL bumping.
//!
//! [`CertificateAuthority`] signs per-hostname leaf certificates with a
//! user-supplied (or freshly generated) CA; [`CertificateStore`] caches
//! the minted leaves with TTL and capacity bounds and terminates client
//! TLS sessions with them.

mod authority;
mod error;
mod store;

pub use authority::{CertificateAuthority, MintedCert};
pub use error::CertError;
pub use store::{CachedCert, CertificateStore};
