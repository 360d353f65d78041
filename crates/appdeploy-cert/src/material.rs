//! PEM certificate material inspection

use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use x509_parser::pem::parse_x509_pem;

#[derive(Debug, Error)]
pub enum MaterialError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse certificate: {0}")]
    InvalidCertificate(String),

    #[error("Failed to parse private key: {0}")]
    InvalidKey(String),

    #[error("Certificate and key cannot be used together: {0}")]
    Mismatch(String),
}

/// Read the notAfter timestamp of the first certificate in a PEM file
pub fn read_not_after(cert_path: &Path) -> Result<DateTime<Utc>, MaterialError> {
    let pem = std::fs::read(cert_path)?;
    parse_not_after(&pem)
}

/// Extract the notAfter timestamp of the first certificate in PEM bytes
pub fn parse_not_after(pem_bytes: &[u8]) -> Result<DateTime<Utc>, MaterialError> {
    let (_, pem) =
        parse_x509_pem(pem_bytes).map_err(|e| MaterialError::InvalidCertificate(e.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| MaterialError::InvalidCertificate(e.to_string()))?;

    let timestamp = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0).ok_or_else(|| {
        MaterialError::InvalidCertificate(format!("notAfter out of range: {}", timestamp))
    })
}

/// Check that a PEM certificate chain and private key load into a TLS server
/// configuration.
pub fn verify_key_pair(cert_pem: &[u8], key_pem: &[u8]) -> Result<(), MaterialError> {
    let cert_chain = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| MaterialError::InvalidCertificate(e.to_string()))?;

    if cert_chain.is_empty() {
        return Err(MaterialError::InvalidCertificate(
            "No certificate found in file".to_string(),
        ));
    }

    let private_key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| MaterialError::InvalidKey(e.to_string()))?
        .ok_or_else(|| MaterialError::InvalidKey("No private key found in file".to_string()))?;

    rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| MaterialError::Mismatch(e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, private_key)
    .map_err(|e| MaterialError::Mismatch(e.to_string()))?;

    Ok(())
}
