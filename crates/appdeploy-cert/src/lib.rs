//! Certificate lifecycle for deployed applications
//!
//! Generates self-signed certificates, imports existing PEM material and keeps
//! a flat, human-inspectable registry of every certificate it owns. Expired
//! entries are swept lazily whenever the registry is read.

pub mod material;
pub mod registry;
pub mod self_signed;

pub use material::{read_not_after, verify_key_pair, MaterialError};
pub use registry::{CertificateEntry, CertificateRegistry, RegistryError};
pub use self_signed::{generate_self_signed_cert, SelfSignedCertificate, SelfSignedError};

/// Default validity window for generated certificates
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;
