//! Error types for certificate operations.

use thiserror::Error;

/// Failures of the certificate authority and store.
#[derive(Debug, Error)]
pub enum CertError {
    /// CA certificate or key material failed to parse.
    #[error("failed to parse CA material: {0}")]
    CaParse(String),

    /// Keypair generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Building the certificate parameters failed.
    #[error("certificate generation failed: {0}")]
    CertGeneration(String),

    /// Signing the leaf with the CA key failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// PEM (de)serialization failed.
    #[error("invalid PEM: {0}")]
    Pem(String),

    /// Building the TLS server context failed.
    #[error("TLS context error: {0}")]
    Tls(String),

    /// The server-side TLS handshake with the bumped client failed.
    #[error("client TLS handshake failed: {0}")]
    Handshake(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = CertError::Signing("bad key".into());
        assert!(err.to_string().contains("bad key"));
    }
}
