//! Self-signed certificate generation
//!
//! Produces a key pair and a certificate for a single domain with a caller
//! chosen validity window. Certificates generated here are meant for
//! applications that terminate TLS themselves on a private host.

use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, SanType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Invalid validity period: {0} days")]
    InvalidValidity(u32),
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in PEM format
    pub pem_cert: String,

    /// Private key in PEM format
    pub pem_key: String,

    /// End of the validity window
    pub not_after: DateTime<Utc>,
}

/// Generate a self-signed certificate for `domain`, valid for `validity_days`
/// starting now.
///
/// The domain is the only DNS SAN, except for `localhost` which also gets the
/// loopback addresses so direct-TLS applications bound to 127.0.0.1 verify.
pub fn generate_self_signed_cert(
    domain: &str,
    validity_days: u32,
) -> Result<SelfSignedCertificate, SelfSignedError> {
    if validity_days == 0 {
        return Err(SelfSignedError::InvalidValidity(validity_days));
    }

    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    dn.push(DnType::OrganizationName, "appdeploy");
    params.distinguished_name = dn;

    if domain == "localhost" {
        params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    let now = Utc::now();
    let not_after = now + chrono::Duration::days(i64::from(validity_days));

    params.not_before = time::OffsetDateTime::from_unix_timestamp(now.timestamp())
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.timestamp())
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    // Second precision, matching what ends up in the certificate
    let not_after = DateTime::from_timestamp(not_after.timestamp(), 0).unwrap_or(not_after);

    Ok(SelfSignedCertificate {
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
        not_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::{parse_not_after, verify_key_pair};

    #[test]
    fn test_generate_self_signed_cert() {
        let cert = generate_self_signed_cert("app.example.com", 30).unwrap();

        assert!(cert.pem_cert.contains("BEGIN CERTIFICATE"));
        assert!(cert.pem_key.contains("BEGIN PRIVATE KEY"));
        assert!(cert.not_after > Utc::now() + chrono::Duration::days(29));
    }

    #[test]
    fn test_validity_window_is_embedded() {
        let cert = generate_self_signed_cert("localhost", 7).unwrap();

        let embedded = parse_not_after(cert.pem_cert.as_bytes()).unwrap();
        assert_eq!(embedded, cert.not_after);
    }

    #[test]
    fn test_zero_validity_rejected() {
        let result = generate_self_signed_cert("example.com", 0);
        assert!(matches!(result, Err(SelfSignedError::InvalidValidity(0))));
    }

    #[test]
    fn test_cert_can_be_used_with_rustls() {
        let cert = generate_self_signed_cert("localhost", 1).unwrap();

        assert!(verify_key_pair(cert.pem_cert.as_bytes(), cert.pem_key.as_bytes()).is_ok());
    }
}
