//! Deployment configuration
//!
//! Every path, command and default the deployment core uses lives in
//! [`DeployConfig`], which is passed explicitly to the components that need
//! it. The YAML form is sectioned; every field is optional and falls back to
//! the Debian/systemd/nginx defaults below.

use appdeploy_router::{RouteLayout, RouteSettings};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default)]
    pub paths: PathSettings,

    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub probe: ProbeSettings,
}

/// Filesystem locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSettings {
    /// Deployed applications, one directory per name
    #[serde(default = "default_apps_root")]
    pub apps_root: PathBuf,

    /// Snapshots taken before a deployment is replaced or removed
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    /// Lock files
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Certificate and key files
    #[serde(default = "default_cert_root")]
    pub cert_root: PathBuf,

    /// Certificate registry file
    #[serde(default = "default_cert_registry")]
    pub cert_registry: PathBuf,

    /// Where unit files are written
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,

    /// nginx configuration root (sites-available, sites-enabled)
    #[serde(default = "default_nginx_root")]
    pub nginx_root: PathBuf,
}

fn default_apps_root() -> PathBuf {
    PathBuf::from("/var/www/apps")
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("/var/backups/appdeploy")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/appdeploy")
}

fn default_cert_root() -> PathBuf {
    PathBuf::from("/etc/appdeploy/certs")
}

fn default_cert_registry() -> PathBuf {
    PathBuf::from("/etc/appdeploy/certificates.registry")
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

fn default_nginx_root() -> PathBuf {
    PathBuf::from("/etc/nginx")
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            apps_root: default_apps_root(),
            backup_root: default_backup_root(),
            state_dir: default_state_dir(),
            cert_root: default_cert_root(),
            cert_registry: default_cert_registry(),
            unit_dir: default_unit_dir(),
            nginx_root: default_nginx_root(),
        }
    }
}

impl PathSettings {
    /// Put every location under one root (tests, containers, dry runs)
    pub fn under(root: &Path) -> Self {
        Self {
            apps_root: root.join("apps"),
            backup_root: root.join("backups"),
            state_dir: root.join("state"),
            cert_root: root.join("certs"),
            cert_registry: root.join("state").join("certificates.registry"),
            unit_dir: root.join("units"),
            nginx_root: root.join("nginx"),
        }
    }
}

/// Reverse-proxy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_server_name")]
    pub server_name: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Site disabled when an application is hosted at the root
    #[serde(default = "default_default_site")]
    pub default_site: String,

    #[serde(default = "default_nginx_bin")]
    pub nginx_bin: PathBuf,

    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,
}

fn default_server_name() -> String {
    "_".to_string()
}

fn default_listen_port() -> u16 {
    80
}

fn default_default_site() -> String {
    "default".to_string()
}

fn default_nginx_bin() -> PathBuf {
    PathBuf::from("nginx")
}

fn default_reload_command() -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "reload".to_string(),
        "nginx".to_string(),
    ]
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            listen_port: default_listen_port(),
            default_site: default_default_site(),
            nginx_bin: default_nginx_bin(),
            reload_command: default_reload_command(),
        }
    }
}

/// How deployed applications are run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Host for managed assemblies
    #[serde(default = "default_dotnet_path")]
    pub dotnet_path: PathBuf,

    /// Value of ASPNETCORE_ENVIRONMENT
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_user")]
    pub group: String,

    /// Seconds between restarts after a failure
    #[serde(default = "default_restart_sec")]
    pub restart_sec: u64,

    /// Hand staged files to `user:group`
    #[serde(default = "default_true")]
    pub normalize_ownership: bool,

    /// Bind address used when a deployment does not name one
    #[serde(default = "default_bind_address")]
    pub default_bind_address: IpAddr,
}

fn default_dotnet_path() -> PathBuf {
    PathBuf::from("/usr/bin/dotnet")
}

fn default_environment() -> String {
    "Production".to_string()
}

fn default_user() -> String {
    "www-data".to_string()
}

fn default_restart_sec() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            dotnet_path: default_dotnet_path(),
            environment: default_environment(),
            user: default_user(),
            group: default_user(),
            restart_sec: default_restart_sec(),
            normalize_ownership: true,
            default_bind_address: default_bind_address(),
        }
    }
}

/// Process supervisor commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_systemctl")]
    pub systemctl: String,

    #[serde(default = "default_journalctl")]
    pub journalctl: String,
}

fn default_systemctl() -> String {
    "systemctl".to_string()
}

fn default_journalctl() -> String {
    "journalctl".to_string()
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            systemctl: default_systemctl(),
            journalctl: default_journalctl(),
        }
    }
}

/// Readiness probe after start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Upper bound on the single connection attempt
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl ProbeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl DeployConfig {
    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: DeployConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the effective configuration
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.listen_port == 0 {
            return Err(ConfigError::Invalid(
                "proxy.listen_port cannot be 0".to_string(),
            ));
        }

        if self.runtime.user.is_empty() || self.runtime.group.is_empty() {
            return Err(ConfigError::Invalid(
                "runtime.user and runtime.group cannot be empty".to_string(),
            ));
        }

        let apps_root = &self.paths.apps_root;
        if self.paths.backup_root.starts_with(apps_root) {
            return Err(ConfigError::Invalid(format!(
                "paths.backup_root {:?} cannot live inside paths.apps_root {:?}",
                self.paths.backup_root, apps_root
            )));
        }

        Ok(())
    }

    /// nginx file layout derived from the configured root
    pub fn route_layout(&self) -> RouteLayout {
        let mut layout = RouteLayout::under(&self.paths.nginx_root);
        layout.default_site = self.proxy.default_site.clone();
        layout
    }

    /// Route settings for an application reached at `upstream_host`
    pub fn route_settings(&self, upstream_host: String) -> RouteSettings {
        RouteSettings {
            server_name: self.proxy.server_name.clone(),
            listen_port: self.proxy.listen_port,
            upstream_host,
        }
    }

    /// Configuration template written by `appdeploy config init`
    pub fn template() -> String {
        r#"# appdeploy configuration
# Every key is optional; the values below are the defaults.

paths:
  apps_root: /var/www/apps
  backup_root: /var/backups/appdeploy
  state_dir: /var/lib/appdeploy
  cert_root: /etc/appdeploy/certs
  cert_registry: /etc/appdeploy/certificates.registry
  unit_dir: /etc/systemd/system
  nginx_root: /etc/nginx

proxy:
  server_name: "_"
  listen_port: 80
  default_site: default
  nginx_bin: nginx
  reload_command: [systemctl, reload, nginx]

runtime:
  dotnet_path: /usr/bin/dotnet
  environment: Production
  user: www-data
  group: www-data
  restart_sec: 10
  normalize_ownership: true
  default_bind_address: 127.0.0.1

supervisor:
  systemctl: systemctl
  journalctl: journalctl

probe:
  timeout_ms: 10000
"#
        .to_string()
    }
}
