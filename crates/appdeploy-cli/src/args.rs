//! clap value parsers backed by the deployment validators

use appdeploy_lib::validate;
use std::net::IpAddr;

pub fn parse_port(value: &str) -> Result<u16, String> {
    validate::parse_port(value).map_err(|e| e.to_string())
}

pub fn parse_name(value: &str) -> Result<String, String> {
    validate::validate_name(value)
        .map(|_| value.to_string())
        .map_err(|e| e.to_string())
}

pub fn parse_bind_address(value: &str) -> Result<IpAddr, String> {
    validate::validate_bind_address(value).map_err(|e| e.to_string())
}

/// `KEY=VALUE`
pub fn parse_env_pair(value: &str) -> Result<(String, String), String> {
    validate::validate_environment(value).map_err(|e| e.to_string())
}
