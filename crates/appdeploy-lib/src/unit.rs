//! systemd unit generation
//!
//! Units are built as [`UnitDefinition`] values and rendered separately. The
//! `X-AppDeploy-*` keys (ignored by systemd) let status and removal recover
//! what a unit was deployed with.

use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use appdeploy_cert::CertificateEntry;
use appdeploy_router::UpstreamScheme;

use crate::bundle::Executable;
use crate::config::RuntimeSettings;
use crate::supervisor::{Supervisor, SupervisorError};

const HEADER: &str = "# Managed by appdeploy";
const APP_KEY: &str = "X-AppDeploy-App";
const SITE_KEY: &str = "X-AppDeploy-Site";
const CERTIFICATE_KEY: &str = "X-AppDeploy-Certificate";
const URLS_VARIABLE: &str = "ASPNETCORE_URLS";

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0:?} exists and is not managed by appdeploy")]
    NotManaged(PathBuf),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Unit file name for an application
pub fn unit_name(app_name: &str) -> String {
    format!("{}.service", app_name)
}

/// A systemd service for one application
#[derive(Debug, Clone, PartialEq)]
pub struct UnitDefinition {
    pub app_name: String,
    pub site_name: String,
    pub working_directory: PathBuf,
    pub exec_start: String,
    pub bind_address: IpAddr,
    pub port: u16,
    pub scheme: UpstreamScheme,
    pub certificate: Option<CertificateEntry>,
    pub user: String,
    pub group: String,
    pub environment_name: String,
    pub restart_sec: u64,
    /// Extra `KEY=VALUE` pairs, in order
    pub environment: Vec<(String, String)>,
}

/// Build the unit running `executable` from `app_dir`, listening on
/// `bind_address:port`. A certificate switches the application to https.
pub fn generate_unit(
    app_name: &str,
    executable: &Executable,
    app_dir: &Path,
    bind_address: IpAddr,
    port: u16,
    certificate: Option<&CertificateEntry>,
    runtime: &RuntimeSettings,
) -> UnitDefinition {
    UnitDefinition {
        app_name: app_name.to_string(),
        site_name: app_name.to_string(),
        working_directory: app_dir.to_path_buf(),
        exec_start: executable.command_line(app_dir, &runtime.dotnet_path),
        bind_address,
        port,
        scheme: if certificate.is_some() {
            UpstreamScheme::Https
        } else {
            UpstreamScheme::Http
        },
        certificate: certificate.cloned(),
        user: runtime.user.clone(),
        group: runtime.group.clone(),
        environment_name: runtime.environment.clone(),
        restart_sec: runtime.restart_sec,
        environment: Vec::new(),
    }
}

/// Quote an `Environment=` assignment, escaping what systemd would interpret
fn environment_line(key: &str, value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%");
    format!("Environment=\"{}={}\"\n", key, escaped)
}

impl UnitDefinition {
    pub fn with_site_name(mut self, site_name: impl Into<String>) -> Self {
        self.site_name = site_name.into();
        self
    }

    pub fn with_environment(mut self, environment: Vec<(String, String)>) -> Self {
        self.environment = environment;
        self
    }

    pub fn unit_name(&self) -> String {
        unit_name(&self.app_name)
    }

    /// URL the application listens on, e.g. `http://127.0.0.1:5001`
    pub fn url(&self) -> String {
        format!(
            "{}://{}",
            self.scheme.as_str(),
            SocketAddr::new(self.bind_address, self.port)
        )
    }

    pub fn render(&self) -> String {
        let mut environment = String::new();
        environment.push_str(&environment_line(
            "ASPNETCORE_ENVIRONMENT",
            &self.environment_name,
        ));
        environment.push_str(&environment_line(URLS_VARIABLE, &self.url()));
        environment.push_str(&environment_line(
            "DOTNET_PRINT_TELEMETRY_MESSAGE",
            "false",
        ));
        if let Some(certificate) = &self.certificate {
            environment.push_str(&environment_line(
                "ASPNETCORE_Kestrel__Certificates__Default__Path",
                &certificate.certificate_path.to_string_lossy(),
            ));
            environment.push_str(&environment_line(
                "ASPNETCORE_Kestrel__Certificates__Default__KeyPath",
                &certificate.key_path.to_string_lossy(),
            ));
        }
        for (key, value) in &self.environment {
            environment.push_str(&environment_line(key, value));
        }

        let mut tags = format!(
            "{}={}\n{}={}\n",
            APP_KEY, self.app_name, SITE_KEY, self.site_name
        );
        if let Some(certificate) = &self.certificate {
            tags.push_str(&format!("{}={}\n", CERTIFICATE_KEY, certificate.name));
        }

        format!(
            r#"{header}
[Unit]
Description=appdeploy application {app}
After=network.target

[Service]
Type=simple
WorkingDirectory={working_directory}
ExecStart={exec_start}
Restart=always
RestartSec={restart_sec}
KillSignal=SIGINT
SyslogIdentifier={app}
User={user}
Group={group}
{environment}{tags}
[Install]
WantedBy=multi-user.target
"#,
            header = HEADER,
            app = self.app_name,
            working_directory = self.working_directory.display(),
            exec_start = self.exec_start,
            restart_sec = self.restart_sec,
            user = self.user,
            group = self.group,
            environment = environment,
            tags = tags,
        )
    }
}

/// What an installed unit was deployed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledUnit {
    pub app_name: String,
    pub site_name: String,
    pub url: String,
    pub scheme: UpstreamScheme,
    pub bind_address: IpAddr,
    pub port: u16,
    pub certificate: Option<String>,
}

impl InstalledUnit {
    /// Recover deployment details from a rendered unit. Units not written by
    /// appdeploy yield `None`.
    pub fn parse(contents: &str) -> Option<Self> {
        if !contents.starts_with(HEADER) {
            return None;
        }

        let mut app_name = None;
        let mut site_name = None;
        let mut certificate = None;
        let mut url = None;

        for line in contents.lines().map(str::trim) {
            if let Some(value) = line.strip_prefix(&format!("{}=", APP_KEY)) {
                app_name = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix(&format!("{}=", SITE_KEY)) {
                site_name = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix(&format!("{}=", CERTIFICATE_KEY)) {
                certificate = Some(value.to_string());
            } else if let Some(value) =
                line.strip_prefix(&format!("Environment=\"{}=", URLS_VARIABLE))
            {
                url = value.strip_suffix('"').map(str::to_string);
            }
        }

        let app_name = app_name?;
        let url = url?;
        let (scheme, address) = url.split_once("://")?;
        let scheme = match scheme {
            "http" => UpstreamScheme::Http,
            "https" => UpstreamScheme::Https,
            _ => return None,
        };
        let address: SocketAddr = address.parse().ok()?;

        Some(Self {
            site_name: site_name.unwrap_or_else(|| app_name.clone()),
            app_name,
            url: url.clone(),
            scheme,
            bind_address: address.ip(),
            port: address.port(),
            certificate,
        })
    }
}

/// Unit files on disk
#[derive(Debug, Clone)]
pub struct UnitFiles {
    unit_dir: PathBuf,
}

impl UnitFiles {
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
        }
    }

    pub fn unit_path(&self, app_name: &str) -> PathBuf {
        self.unit_dir.join(unit_name(app_name))
    }

    /// Whether appdeploy has written a unit for the application
    pub fn exists(&self, app_name: &str) -> bool {
        fs::read_to_string(self.unit_path(app_name))
            .map(|contents| contents.starts_with(HEADER))
            .unwrap_or(false)
    }

    /// The unit file for this name, when one exists that appdeploy did not
    /// write. Unreadable files count as foreign.
    pub fn foreign_unit(&self, app_name: &str) -> Option<PathBuf> {
        let path = self.unit_path(app_name);
        match fs::read_to_string(&path) {
            Ok(contents) if contents.starts_with(HEADER) => None,
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            _ => Some(path),
        }
    }

    pub fn write(&self, unit: &UnitDefinition) -> Result<PathBuf, UnitError> {
        if let Some(path) = self.foreign_unit(&unit.app_name) {
            return Err(UnitError::NotManaged(path));
        }
        let path = self.unit_path(&unit.app_name);
        fs::create_dir_all(&self.unit_dir).map_err(|source| UnitError::Io {
            path: self.unit_dir.clone(),
            source,
        })?;
        fs::write(&path, unit.render()).map_err(|source| UnitError::Io {
            path: path.clone(),
            source,
        })?;
        debug!("Wrote unit file {}", path.display());
        Ok(path)
    }

    /// Write the unit, reload the supervisor and enable it on boot. The unit
    /// is not started.
    pub async fn install(
        &self,
        unit: &UnitDefinition,
        supervisor: &dyn Supervisor,
    ) -> Result<PathBuf, UnitError> {
        let path = self.write(unit)?;
        supervisor.daemon_reload().await?;
        supervisor.enable(&unit.unit_name()).await?;
        info!("Unit {} installed and enabled", unit.unit_name());
        Ok(path)
    }

    /// Delete a unit file. Returns whether it existed.
    pub fn remove(&self, app_name: &str) -> Result<bool, UnitError> {
        if let Some(path) = self.foreign_unit(app_name) {
            return Err(UnitError::NotManaged(path));
        }
        let path = self.unit_path(app_name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(UnitError::Io { path, source }),
        }
    }

    pub fn read(&self, app_name: &str) -> Result<Option<InstalledUnit>, UnitError> {
        let path = self.unit_path(app_name);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(InstalledUnit::parse(&contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(UnitError::Io { path, source }),
        }
    }

    /// Every unit written by appdeploy, sorted by application name
    pub fn list_installed(&self) -> Result<Vec<InstalledUnit>, UnitError> {
        let entries = match fs::read_dir(&self.unit_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(UnitError::Io {
                    path: self.unit_dir.clone(),
                    source,
                })
            }
        };

        let mut units: Vec<InstalledUnit> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|ext| ext == "service").unwrap_or(false))
            .filter_map(|path| fs::read_to_string(path).ok())
            .filter_map(|contents| InstalledUnit::parse(&contents))
            .collect();
        units.sort_by(|a, b| a.app_name.cmp(&b.app_name));
        Ok(units)
    }
}
