//! Deployment orchestration
//!
//! A deployment walks `Requested -> Validated -> BackedUp -> Staged ->
//! UnitCreated -> RouteActive -> Started -> Verified`. Validation happens
//! before anything on disk changes, a backup is taken before the previous
//! deployment is touched, and the unit is only started once its route is
//! active. Nothing is retried; the backup is the recovery path.

use serde::Serialize;
use std::fmt;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use appdeploy_cert::{CertificateEntry, CertificateRegistry};
use appdeploy_router::{generate_route, HostingMode, NginxProxy, ProxyControl, RouteActivator};

use crate::backup::{BackupManager, BackupReason};
use crate::bundle::{discover_executable, validate_source_bundle, Executable};
use crate::config::DeployConfig;
use crate::error::{DeployError, DeploymentFailure, ValidationError};
use crate::lock::AppLock;
use crate::probe::wait_until_listening;
use crate::staging;
use crate::status::StatusQuery;
use crate::supervisor::{Supervisor, SystemdSupervisor};
use crate::unit::{generate_unit, unit_name, InstalledUnit, UnitFiles};
use crate::validate::{
    reachable_address, validate_environment, validate_name, validate_port_available,
    validate_port_range, validate_subdirectory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeploymentState {
    Requested,
    Validated,
    BackedUp,
    Staged,
    UnitCreated,
    RouteActive,
    Started,
    Verified,
    Failed,
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentState::Requested => "requested",
            DeploymentState::Validated => "validated",
            DeploymentState::BackedUp => "backed up",
            DeploymentState::Staged => "staged",
            DeploymentState::UnitCreated => "unit created",
            DeploymentState::RouteActive => "route active",
            DeploymentState::Started => "started",
            DeploymentState::Verified => "verified",
            DeploymentState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// What to deploy and how to expose it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRequest {
    pub name: String,
    pub source: PathBuf,
    pub port: u16,
    /// A subdirectory prefix is normalized during validation
    pub mode: HostingMode,
    /// Falls back to the configured default bind address
    pub bind_address: Option<IpAddr>,
    pub use_tls_direct: bool,
    pub certificate: Option<String>,
    /// Consulted only when the executable cannot be discovered
    pub executable: Option<String>,
    pub site_name: Option<String>,
    pub environment: Vec<(String, String)>,
}

impl DeploymentRequest {
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            port,
            mode: HostingMode::Direct,
            bind_address: None,
            use_tls_direct: false,
            certificate: None,
            executable: None,
            site_name: None,
            environment: Vec::new(),
        }
    }

    pub fn with_subdirectory(mut self, prefix: impl Into<String>) -> Self {
        self.mode = HostingMode::Subdirectory(prefix.into());
        self
    }

    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = Some(bind_address);
        self
    }

    /// Terminate TLS in the application with a registered certificate
    pub fn with_tls(mut self, certificate: impl Into<String>) -> Self {
        self.use_tls_direct = true;
        self.certificate = Some(certificate.into());
        self
    }

    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    pub fn with_site_name(mut self, site_name: impl Into<String>) -> Self {
        self.site_name = Some(site_name.into());
        self
    }

    pub fn with_environment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }
}

/// A request that passed validation, with everything resolved
#[derive(Debug, Clone)]
pub struct ValidatedDeployment {
    pub name: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub port: u16,
    pub mode: HostingMode,
    pub bind_address: IpAddr,
    pub executable: Executable,
    pub certificate: Option<CertificateEntry>,
    pub site_name: String,
    pub environment: Vec<(String, String)>,
    /// Unit of the deployment being replaced, if any
    pub previous: Option<InstalledUnit>,
    pub warnings: Vec<String>,
}

/// Outcome of a completed deployment
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub name: String,
    pub states: Vec<DeploymentState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    /// Whether the application accepted connections after start
    pub verified: bool,
    pub url: String,
    pub route: String,
    pub warnings: Vec<String>,
}

impl DeploymentReport {
    pub fn final_state(&self) -> DeploymentState {
        self.states
            .last()
            .copied()
            .unwrap_or(DeploymentState::Requested)
    }
}

/// Outcome of a removal. Every step is attempted; failures are collected.
#[derive(Debug, Clone, Serialize)]
pub struct RemovalReport {
    pub name: String,
    pub backup: Option<PathBuf>,
    pub failures: Vec<String>,
}

impl RemovalReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// States reached so far by one deployment
struct Progress {
    name: String,
    states: Vec<DeploymentState>,
    backup: Option<PathBuf>,
    warnings: Vec<String>,
}

impl Progress {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            states: vec![DeploymentState::Requested],
            backup: None,
            warnings: Vec::new(),
        }
    }

    fn advance(&mut self, state: DeploymentState) {
        debug!("'{}' {}", self.name, state);
        self.states.push(state);
    }

    fn last(&self) -> DeploymentState {
        self.states
            .last()
            .copied()
            .unwrap_or(DeploymentState::Requested)
    }

    fn fail(&self, error: DeployError) -> DeploymentFailure {
        error!(
            "Deployment of '{}' failed after reaching {}: {}",
            self.name,
            self.last(),
            error
        );
        let mut states = self.states.clone();
        states.push(DeploymentState::Failed);
        DeploymentFailure {
            name: self.name.clone(),
            last_state: self.last(),
            states,
            backup: self.backup.clone(),
            error,
        }
    }
}

/// Host part of an upstream URL; IPv6 needs brackets
fn upstream_host(bind_address: IpAddr) -> String {
    match reachable_address(bind_address) {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}

/// Reject a source that contains, or is contained in, the destination
fn check_overlap(source: &Path, destination: &Path) -> Result<(), ValidationError> {
    let source = source
        .canonicalize()
        .unwrap_or_else(|_| source.to_path_buf());
    let destination = match destination.canonicalize() {
        Ok(path) => path,
        Err(_) => match (destination.parent(), destination.file_name()) {
            (Some(parent), Some(name)) => parent
                .canonicalize()
                .map(|parent| parent.join(name))
                .unwrap_or_else(|_| destination.to_path_buf()),
            _ => destination.to_path_buf(),
        },
    };

    if source.starts_with(&destination) || destination.starts_with(&source) {
        return Err(ValidationError::SourceIsDestination {
            bundle: source,
            destination,
        });
    }
    Ok(())
}

/// Deploys, redeploys, restarts and removes applications
pub struct Deployer {
    config: DeployConfig,
    supervisor: Arc<dyn Supervisor>,
    activator: Arc<RouteActivator>,
    units: UnitFiles,
    backups: BackupManager,
    registry: CertificateRegistry,
}

impl Deployer {
    pub fn new(
        config: DeployConfig,
        supervisor: Arc<dyn Supervisor>,
        proxy: Arc<dyn ProxyControl>,
    ) -> Self {
        let activator = Arc::new(RouteActivator::new(config.route_layout(), proxy));
        let units = UnitFiles::new(&config.paths.unit_dir);
        let backups = BackupManager::new(&config.paths.backup_root);
        let registry =
            CertificateRegistry::new(&config.paths.cert_registry, &config.paths.cert_root);

        Self {
            config,
            supervisor,
            activator,
            units,
            backups,
            registry,
        }
    }

    /// Deployer driving systemd and nginx as configured
    pub fn with_system_services(config: DeployConfig) -> Self {
        let supervisor = Arc::new(SystemdSupervisor::new(&config.supervisor));
        let proxy = Arc::new(NginxProxy::new(
            config.proxy.nginx_bin.clone(),
            config.proxy.reload_command.clone(),
        ));
        Self::new(config, supervisor, proxy)
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn registry(&self) -> &CertificateRegistry {
        &self.registry
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn status_query(&self) -> StatusQuery {
        StatusQuery::new(
            &self.config.paths.apps_root,
            self.units.clone(),
            self.activator.clone(),
            self.supervisor.clone(),
        )
    }

    fn app_dir(&self, name: &str) -> PathBuf {
        self.config.paths.apps_root.join(name)
    }

    /// Check a request without changing anything on disk
    pub fn validate(
        &self,
        request: &DeploymentRequest,
    ) -> Result<ValidatedDeployment, ValidationError> {
        validate_name(&request.name)?;
        let site_name = match &request.site_name {
            Some(site_name) => {
                validate_name(site_name)?;
                site_name.clone()
            }
            None => request.name.clone(),
        };
        if self.activator.layout().is_reserved(&site_name) {
            return Err(ValidationError::ReservedSiteName(site_name));
        }

        validate_port_range(request.port as u32)?;
        let bind_address = request
            .bind_address
            .unwrap_or(self.config.runtime.default_bind_address);

        let mode = match &request.mode {
            HostingMode::Direct => HostingMode::Direct,
            HostingMode::Subdirectory(raw) => {
                HostingMode::Subdirectory(validate_subdirectory(raw)?)
            }
        };

        for (key, value) in &request.environment {
            validate_environment(&format!("{}={}", key, value))?;
        }

        let installed = self.units.list_installed().unwrap_or_else(|e| {
            warn!("Failed to read installed units: {}", e);
            Vec::new()
        });
        if let Some(holder) = installed
            .iter()
            .find(|unit| unit.port == request.port && unit.app_name != request.name)
        {
            return Err(ValidationError::PortInUse {
                port: request.port,
                holder: Some(holder.app_name.clone()),
            });
        }
        if let Some(holder) = installed
            .iter()
            .find(|unit| unit.site_name == site_name && unit.app_name != request.name)
        {
            return Err(ValidationError::SiteInUse {
                site: site_name,
                holder: holder.app_name.clone(),
            });
        }
        let previous = installed
            .into_iter()
            .find(|unit| unit.app_name == request.name);

        if let Some(path) = self.units.foreign_unit(&request.name) {
            return Err(ValidationError::ForeignUnit(path));
        }
        match self.activator.foreign_definition(&site_name) {
            Ok(None) => {}
            Ok(Some(path)) => return Err(ValidationError::ForeignSite(path)),
            Err(e) => {
                return Err(ValidationError::SiteUnreadable {
                    site: site_name,
                    reason: e.to_string(),
                })
            }
        }

        // On redeploy the running instance holds its own port
        let held_by_previous = previous
            .as_ref()
            .map(|unit| unit.port == request.port)
            .unwrap_or(false);
        if !held_by_previous {
            validate_port_available(bind_address, request.port)?;
        }

        validate_source_bundle(&request.source)?;
        let destination = self.app_dir(&request.name);
        check_overlap(&request.source, &destination)?;

        let executable = discover_executable(
            &request.source,
            &request.name,
            request.executable.as_deref(),
        )?;
        let mut warnings = Vec::new();
        if let Some(explicit) = &request.executable {
            if explicit != executable.file_name() {
                let message = format!(
                    "Explicit executable '{}' ignored, discovered '{}'",
                    explicit,
                    executable.file_name()
                );
                warn!("{}", message);
                warnings.push(message);
            }
        }

        let certificate = match (request.use_tls_direct, &request.certificate) {
            (false, None) => None,
            (false, Some(_)) => return Err(ValidationError::CertificateWithoutTls),
            (true, None) => return Err(ValidationError::CertificateRequired),
            (true, Some(name)) => match self.registry.find_by_name(name) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!("Certificate lookup for '{}' failed: {}", name, e);
                    return Err(ValidationError::CertificateNotFound(name.clone()));
                }
            },
        };

        Ok(ValidatedDeployment {
            name: request.name.clone(),
            source: request.source.clone(),
            destination,
            port: request.port,
            mode,
            bind_address,
            executable,
            certificate,
            site_name,
            environment: request.environment.clone(),
            previous,
            warnings,
        })
    }

    /// Deploy or redeploy an application
    pub async fn deploy(
        &self,
        request: DeploymentRequest,
    ) -> Result<DeploymentReport, DeploymentFailure> {
        let mut progress = Progress::new(&request.name);
        info!(
            "Deploying '{}' from {} on port {}",
            request.name,
            request.source.display(),
            request.port
        );

        validate_name(&request.name).map_err(|e| progress.fail(e.into()))?;
        let _lock = AppLock::acquire(&self.config.paths.state_dir, &request.name)
            .map_err(|e| progress.fail(e))?;

        let plan = self
            .validate(&request)
            .map_err(|e| progress.fail(e.into()))?;
        progress.warnings.extend(plan.warnings.iter().cloned());
        progress.advance(DeploymentState::Validated);

        let backup = self
            .backups
            .snapshot_if_exists(&plan.destination, &plan.name, BackupReason::Redeploy)
            .map_err(|e| progress.fail(e.into()))?;
        progress.backup = backup;
        progress.advance(DeploymentState::BackedUp);

        staging::stage(
            &plan.source,
            &plan.destination,
            Some(&plan.executable),
            &self.config.runtime,
        )
        .map_err(|e| progress.fail(e.into()))?;
        progress.advance(DeploymentState::Staged);

        let definition = generate_unit(
            &plan.name,
            &plan.executable,
            &plan.destination,
            plan.bind_address,
            plan.port,
            plan.certificate.as_ref(),
            &self.config.runtime,
        )
        .with_site_name(plan.site_name.clone())
        .with_environment(plan.environment.clone());
        self.units
            .install(&definition, self.supervisor.as_ref())
            .await
            .map_err(|e| progress.fail(e.into()))?;
        progress.advance(DeploymentState::UnitCreated);

        let route = generate_route(
            &plan.name,
            plan.port,
            plan.mode.clone(),
            definition.scheme,
            &self
                .config
                .route_settings(upstream_host(plan.bind_address)),
        )
        .with_site_name(plan.site_name.clone());
        self.activator
            .activate(&route)
            .await
            .map_err(|e| progress.fail(e.into()))?;
        progress.advance(DeploymentState::RouteActive);

        if let Some(previous) = &plan.previous {
            if previous.site_name != plan.site_name {
                self.retire_site(&previous.site_name, &mut progress.warnings)
                    .await;
            }
        }

        // The previous instance keeps serving until everything before start
        // has succeeded
        let unit = unit_name(&plan.name);
        if plan.previous.is_some() {
            if let Err(e) = self.supervisor.stop(&unit).await {
                let message = format!("Failed to stop previous instance: {}", e);
                warn!("{}", message);
                progress.warnings.push(message);
            }
        }

        self.supervisor
            .start(&unit)
            .await
            .map_err(|e| progress.fail(DeployError::Start(e)))?;
        progress.advance(DeploymentState::Started);

        let verified = self.probe(plan.bind_address, plan.port).await;
        if verified {
            progress.advance(DeploymentState::Verified);
        } else {
            let message = format!(
                "'{}' did not accept connections on port {} within {:?}; deployment is unverified",
                plan.name,
                plan.port,
                self.config.probe.timeout()
            );
            warn!("{}", message);
            progress.warnings.push(message);
        }

        info!(
            "Deployed '{}' at {} ({})",
            plan.name,
            plan.mode.public_path(),
            definition.url()
        );

        Ok(DeploymentReport {
            name: plan.name,
            states: progress.states,
            backup: progress.backup,
            verified,
            url: definition.url(),
            route: plan.mode.public_path(),
            warnings: progress.warnings,
        })
    }

    /// Remove the route a renamed site left behind
    async fn retire_site(&self, site_name: &str, warnings: &mut Vec<String>) {
        let result = match self.activator.deactivate(site_name) {
            Ok(true) => self.activator.reload().await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let message = format!("Failed to retire previous site '{}': {}", site_name, e);
            warn!("{}", message);
            warnings.push(message);
        }
    }

    async fn probe(&self, bind_address: IpAddr, port: u16) -> bool {
        let address = SocketAddr::new(reachable_address(bind_address), port);
        wait_until_listening(address, self.config.probe.timeout()).await
    }

    /// Back up, then tear down unit, route and files
    pub async fn remove(&self, name: &str) -> Result<RemovalReport, DeployError> {
        validate_name(name)?;
        let _lock = AppLock::acquire(&self.config.paths.state_dir, name)?;

        let destination = self.app_dir(name);
        let installed = self.units.read(name)?;
        let site_name = installed
            .as_ref()
            .map(|unit| unit.site_name.clone())
            .unwrap_or_else(|| name.to_string());
        let unit_exists = self.units.exists(name);
        // Definitions appdeploy did not write are left in place
        let route_exists = self.activator.has_definition(&site_name)
            && matches!(self.activator.foreign_definition(&site_name), Ok(None));

        if !unit_exists && !destination.exists() && !route_exists {
            return Err(DeployError::NotDeployed(name.to_string()));
        }

        // Nothing is torn down without a backup
        let backup = self
            .backups
            .snapshot_if_exists(&destination, name, BackupReason::Removal)?;

        let mut failures = Vec::new();
        let unit = unit_name(name);

        if unit_exists {
            if let Err(e) = self.supervisor.stop(&unit).await {
                failures.push(format!("stop {}: {}", unit, e));
            }
            if let Err(e) = self.supervisor.disable(&unit).await {
                failures.push(format!("disable {}: {}", unit, e));
            }
        }

        if unit_exists {
            match self.units.remove(name) {
                Ok(true) => {
                    if let Err(e) = self.supervisor.daemon_reload().await {
                        failures.push(format!("daemon-reload: {}", e));
                    }
                }
                Ok(false) => {}
                Err(e) => failures.push(format!("unit file: {}", e)),
            }
        }

        if route_exists {
            match self.activator.deactivate(&site_name) {
                Ok(true) => {
                    if let Err(e) = self.activator.reload().await {
                        failures.push(format!("proxy reload: {}", e));
                    }
                }
                Ok(false) => {}
                Err(e) => failures.push(format!("route: {}", e)),
            }
        }

        if destination.exists() {
            if let Err(e) = fs::remove_dir_all(&destination) {
                failures.push(format!("{}: {}", destination.display(), e));
            }
        }

        if failures.is_empty() {
            info!("Removed '{}'", name);
        } else {
            warn!("Removed '{}' with {} failures", name, failures.len());
        }

        Ok(RemovalReport {
            name: name.to_string(),
            backup,
            failures,
        })
    }

    /// Stop, start and probe. Returns whether the application came back.
    pub async fn restart(&self, name: &str) -> Result<bool, DeployError> {
        validate_name(name)?;
        let _lock = AppLock::acquire(&self.config.paths.state_dir, name)?;

        let installed = self
            .units
            .read(name)?
            .ok_or_else(|| DeployError::NotDeployed(name.to_string()))?;
        let unit = unit_name(name);

        self.supervisor.stop(&unit).await?;
        self.supervisor
            .start(&unit)
            .await
            .map_err(DeployError::Start)?;

        let verified = self.probe(installed.bind_address, installed.port).await;
        if verified {
            info!("Restarted '{}'", name);
        } else {
            warn!(
                "'{}' restarted but did not accept connections on port {}",
                name, installed.port
            );
        }
        Ok(verified)
    }

    /// Recent supervisor log lines for an application
    pub async fn logs(&self, name: &str, lines: usize) -> Result<String, DeployError> {
        validate_name(name)?;
        if !self.units.exists(name) {
            return Err(DeployError::NotDeployed(name.to_string()));
        }
        Ok(self.supervisor.logs(&unit_name(name), lines).await?)
    }

    /// Applications whose unit terminates TLS with the named certificate
    pub fn certificate_users(&self, certificate: &str) -> Result<Vec<String>, DeployError> {
        Ok(self
            .units
            .list_installed()?
            .into_iter()
            .filter(|unit| unit.certificate.as_deref() == Some(certificate))
            .map(|unit| unit.app_name)
            .collect())
    }
}
