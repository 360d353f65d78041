//! Input validation
//!
//! Everything here is a pure check except [`validate_port_available`], which
//! probes live sockets.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, TcpListener};

use crate::error::ValidationError;

pub const MIN_PORT: u32 = 1024;
pub const MAX_PORT: u32 = 65535;

/// Application, site and certificate names: `[A-Za-z0-9_-]+`
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub fn validate_port_range(port: u32) -> Result<u16, ValidationError> {
    if !(MIN_PORT..=MAX_PORT).contains(&port) {
        return Err(ValidationError::PortOutOfRange(port));
    }
    Ok(port as u16)
}

/// Parse and range-check a port given as text
pub fn parse_port(value: &str) -> Result<u16, ValidationError> {
    let port: u32 = value
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidPort(value.to_string()))?;
    validate_port_range(port)
}

/// Whether nothing currently listens on `port` at `bind_address` or on the
/// wildcard address of the same family
pub fn port_is_free(bind_address: IpAddr, port: u16) -> bool {
    let wildcard = match bind_address {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };

    [bind_address, wildcard]
        .iter()
        .all(|address| TcpListener::bind((*address, port)).is_ok())
}

pub fn validate_port_available(bind_address: IpAddr, port: u16) -> Result<(), ValidationError> {
    validate_port_range(port as u32)?;
    if !port_is_free(bind_address, port) {
        return Err(ValidationError::PortInUse { port, holder: None });
    }
    Ok(())
}

/// Normalize a subdirectory prefix: strip outer `/`, collapse repeated `/`
pub fn validate_subdirectory(raw: &str) -> Result<String, ValidationError> {
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '/')
    {
        return Err(ValidationError::InvalidSubdirectory(raw.to_string()));
    }

    let normalized = raw
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    if normalized.is_empty() {
        return Err(ValidationError::EmptySubdirectory);
    }
    Ok(normalized)
}

pub fn validate_bind_address(raw: &str) -> Result<IpAddr, ValidationError> {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| ValidationError::InvalidBindAddress(raw.to_string()))
}

/// Parse a `KEY=VALUE` pair for the unit environment
pub fn validate_environment(entry: &str) -> Result<(String, String), ValidationError> {
    let invalid = || ValidationError::InvalidEnvironment(entry.to_string());

    let (key, value) = entry.split_once('=').ok_or_else(invalid)?;
    let mut chars = key.chars();
    let valid_key = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_key || value.chars().any(|c| c.is_control()) {
        return Err(invalid());
    }
    Ok((key.to_string(), value.to_string()))
}

/// Address the proxy and the readiness probe use to reach an application
/// listening on `bind_address`
pub fn reachable_address(bind_address: IpAddr) -> IpAddr {
    match bind_address {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}
