//! Certificate authority for TLS interception.
//!
//! The authority holds the CA certificate and key used to sign leaves,
//! plus one static leaf keypair reused for every minted certificate (the
//! TLS server contexts always pair a minted chain with this one key).
//!
//! Minted leaves carry SANs for both the hostname and its wildcard
//! (`host`, `*.host`), so a cached certificate for a parent domain also
//! covers its direct children.

use super::error::CertError;
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rcgen::string::Ia5String;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// Organization written into CA and leaf subjects.
const ORGANIZATION: &str = "UBIO";

/// Validity of a generated (fixture) CA.
const GENERATED_CA_VALIDITY_DAYS: i64 = 365;

/// A CA certificate/key pair plus the shared leaf keypair.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_pem: String,
    ca_cert_der: CertificateDer<'static>,
    ca_key_pem: String,
    leaf_key: KeyPair,
    leaf_key_pem: String,
}

/// A leaf certificate minted for one hostname.
pub struct MintedCert {
    /// Hostname the certificate covers (together with its wildcard).
    pub hostname: String,
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// DER-encoded certificate.
    pub cert_der: CertificateDer<'static>,
}

impl CertificateAuthority {
    /// Load an authority from PEM material. A fresh leaf keypair is
    /// generated when none is supplied.
    pub fn from_pem(
        ca_cert_pem: &str,
        ca_key_pem: &str,
        leaf_key_pem: Option<&str>,
    ) -> Result<Self, CertError> {
        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| CertError::CaParse(format!("CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, ca_key)
            .map_err(|e| CertError::CaParse(format!("CA certificate: {}", e)))?;

        let ca_cert_der = rustls_pemfile::certs(&mut ca_cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CertError::Pem("no certificate in CA PEM".into()))?
            .map_err(|e| CertError::Pem(format!("CA certificate: {}", e)))?;

        let leaf_key = match leaf_key_pem {
            Some(pem) => KeyPair::from_pem(pem)
                .map_err(|e| CertError::CaParse(format!("leaf key: {}", e)))?,
            None => KeyPair::generate().map_err(|e| CertError::KeyGeneration(e.to_string()))?,
        };
        let leaf_key_pem = leaf_key.serialize_pem();

        Ok(Self {
            issuer,
            ca_cert_pem: ca_cert_pem.to_string(),
            ca_cert_der,
            ca_key_pem: ca_key_pem.to_string(),
            leaf_key,
            leaf_key_pem,
        })
    }

    /// Generate a fresh self-signed CA. Intended for fixtures and tests;
    /// production deployments supply their own CA material.
    pub fn generate() -> Result<Self, CertError> {
        let ca_key =
            KeyPair::generate().map_err(|e| CertError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String("sslbump Ephemeral CA".to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(GENERATED_CA_VALIDITY_DAYS);

        let cert = params
            .self_signed(&ca_key)
            .map_err(|e| CertError::CertGeneration(e.to_string()))?;
        let ca_cert_pem = cert.pem();
        let ca_key_pem = ca_key.serialize_pem();
        debug!("generated ephemeral CA");

        Self::from_pem(&ca_cert_pem, &ca_key_pem, None)
    }

    /// Mint a leaf certificate for `hostname`, signed by the CA.
    ///
    /// Serial is a random 64-bit value behind a fixed `01` lead byte,
    /// sidestepping leading-zero encoding ambiguity. Validity runs from
    /// 24 hours ago to `ttl_days` ahead.
    pub fn mint(&self, hostname: &str, ttl_days: i64) -> Result<MintedCert, CertError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(hostname.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;

        let exact = Ia5String::try_from(hostname.to_string())
            .map_err(|e| CertError::CertGeneration(format!("hostname: {}", e)))?;
        let wildcard = Ia5String::try_from(format!("*.{}", hostname))
            .map_err(|e| CertError::CertGeneration(format!("wildcard: {}", e)))?;
        params.subject_alt_names = vec![SanType::DnsName(exact), SanType::DnsName(wildcard)];

        let mut serial = vec![0x01u8];
        serial.extend_from_slice(&rand::thread_rng().gen::<[u8; 8]>());
        params.serial_number = Some(SerialNumber::from(serial));

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(24);
        params.not_after = now + Duration::days(ttl_days);

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::ContentCommitment,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
        ];

        let cert = params
            .signed_by(&self.leaf_key, &self.issuer)
            .map_err(|e| CertError::Signing(e.to_string()))?;

        debug!(host = hostname, "minted leaf certificate");
        Ok(MintedCert {
            hostname: hostname.to_string(),
            cert_pem: cert.pem(),
            cert_der: cert.der().clone(),
        })
    }

    /// PEM of the CA certificate.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// PEM of the CA private key.
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// DER of the CA certificate.
    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.ca_cert_der.clone()
    }

    /// PEM of the static leaf private key.
    pub fn leaf_key_pem(&self) -> &str {
        &self.leaf_key_pem
    }

    /// DER (PKCS#8) of the static leaf private key, for TLS server
    /// contexts.
    pub fn leaf_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.leaf_key.serialize_der()))
    }
}
