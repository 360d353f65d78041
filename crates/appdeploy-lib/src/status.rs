//! Read-only view of deployed applications
//!
//! Status is reconstructed on every call from the deployment directory, the
//! unit file, the supervisor and the enabled route. Nothing is cached.

use serde::Serialize;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use appdeploy_router::{HostingMode, RouteActivator};

use crate::error::DeployError;
use crate::supervisor::{Supervisor, UnitStatus};
use crate::unit::{unit_name, UnitFiles};
use crate::validate::validate_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Running,
    Stopped,
    /// Deployed files without a unit
    Unconfigured,
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppState::Running => write!(f, "running"),
            AppState::Stopped => write!(f, "stopped"),
            AppState::Unconfigured => write!(f, "unconfigured"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppStatus {
    pub name: String,
    pub state: AppState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_status: Option<UnitStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<IpAddr>,
    /// Address the application itself listens on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Public path of the enabled route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<HostingMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

pub struct StatusQuery {
    apps_root: PathBuf,
    units: UnitFiles,
    activator: Arc<RouteActivator>,
    supervisor: Arc<dyn Supervisor>,
}

impl StatusQuery {
    pub fn new(
        apps_root: impl Into<PathBuf>,
        units: UnitFiles,
        activator: Arc<RouteActivator>,
        supervisor: Arc<dyn Supervisor>,
    ) -> Self {
        Self {
            apps_root: apps_root.into(),
            units,
            activator,
            supervisor,
        }
    }

    /// Names of every deployment directory, sorted
    pub fn names(&self) -> Result<Vec<String>, DeployError> {
        let entries = match fs::read_dir(&self.apps_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(DeployError::Io {
                    path: self.apps_root.clone(),
                    source,
                })
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            // Skips in-progress staging directories (".name.staging")
            .filter(|name| validate_name(name).is_ok())
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn list(&self) -> Result<Vec<AppStatus>, DeployError> {
        let mut statuses = Vec::new();
        for name in self.names()? {
            statuses.push(self.status(&name).await?);
        }
        Ok(statuses)
    }

    pub async fn status(&self, name: &str) -> Result<AppStatus, DeployError> {
        validate_name(name)?;

        let installed = self.units.read(name)?;
        if installed.is_none() && !self.apps_root.join(name).is_dir() {
            return Err(DeployError::NotDeployed(name.to_string()));
        }

        let site_name = installed
            .as_ref()
            .map(|unit| unit.site_name.clone())
            .unwrap_or_else(|| name.to_string());
        let route = self.activator.read_active(&site_name)?;

        let Some(unit) = installed else {
            return Ok(AppStatus {
                name: name.to_string(),
                state: AppState::Unconfigured,
                unit_status: None,
                port: route.as_ref().map(|route| route.port),
                bind_address: None,
                url: None,
                route: route.as_ref().map(|route| route.path.clone()),
                mode: route.as_ref().map(|route| route.mode()),
                certificate: None,
            });
        };

        let unit_status = self.supervisor.status(&unit_name(name)).await?;
        let state = match unit_status {
            UnitStatus::Running => AppState::Running,
            UnitStatus::Stopped | UnitStatus::Failed => AppState::Stopped,
        };

        Ok(AppStatus {
            name: name.to_string(),
            state,
            unit_status: Some(unit_status),
            port: Some(unit.port),
            bind_address: Some(unit.bind_address),
            url: Some(unit.url),
            route: route.as_ref().map(|route| route.path.clone()),
            mode: route.as_ref().map(|route| route.mode()),
            certificate: unit.certificate,
        })
    }
}
