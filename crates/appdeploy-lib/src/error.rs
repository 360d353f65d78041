use std::path::PathBuf;
use thiserror::Error;

use crate::backup::BackupError;
use crate::orchestrator::DeploymentState;
use crate::staging::StagingError;
use crate::supervisor::SupervisorError;
use crate::unit::UnitError;
use appdeploy_router::RouteError;

/// Rejected deployment input. Raised before anything on disk changes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid name '{0}': only letters, digits, '-' and '_' are allowed")]
    InvalidName(String),

    #[error("Port {0} is outside the allowed range 1024-65535")]
    PortOutOfRange(u32),

    #[error("Invalid port '{0}'")]
    InvalidPort(String),

    #[error("Port {port} is already in use{}", holder_suffix(.holder))]
    PortInUse { port: u16, holder: Option<String> },

    #[error("Source {0:?} is not a directory")]
    NotADirectory(PathBuf),

    #[error("Source {0:?} contains no application (no assembly, native executable, web.config or appsettings.json)")]
    NoRuntimeArtifact(PathBuf),

    #[error("Cannot choose an executable among {}; name one explicitly", .candidates.join(", "))]
    AmbiguousExecutable { candidates: Vec<String> },

    #[error("Executable '{0}' not found in the bundle")]
    ExecutableNotFound(String),

    #[error("No executable found in the bundle; name one explicitly")]
    NoExecutable,

    #[error("Invalid subdirectory '{0}': only letters, digits, '-', '_' and '/' are allowed")]
    InvalidSubdirectory(String),

    #[error("Subdirectory is empty after normalization")]
    EmptySubdirectory,

    #[error("Invalid bind address '{0}'")]
    InvalidBindAddress(String),

    #[error("Invalid environment entry '{0}': expected KEY=VALUE")]
    InvalidEnvironment(String),

    #[error("Direct TLS requires a certificate")]
    CertificateRequired,

    #[error("Certificate '{0}' is not registered or has expired")]
    CertificateNotFound(String),

    #[error("A certificate was given but direct TLS is not enabled")]
    CertificateWithoutTls,

    #[error("Site name '{0}' is reserved for the proxy host configuration")]
    ReservedSiteName(String),

    #[error("Site '{site}' is already routed for '{holder}'")]
    SiteInUse { site: String, holder: String },

    #[error("{0:?} exists and is not managed by appdeploy")]
    ForeignSite(PathBuf),

    #[error("Cannot inspect existing definitions for site '{site}': {reason}")]
    SiteUnreadable { site: String, reason: String },

    #[error("{0:?} exists and is not managed by appdeploy")]
    ForeignUnit(PathBuf),

    #[error("Source {bundle:?} and destination {destination:?} overlap")]
    SourceIsDestination {
        bundle: PathBuf,
        destination: PathBuf,
    },
}

fn holder_suffix(holder: &Option<String>) -> String {
    holder
        .as_ref()
        .map(|name| format!(" by '{}'", name))
        .unwrap_or_default()
}

/// Why a deployment operation stopped
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error("Staging failed: {0}")]
    Staging(#[from] StagingError),

    #[error("Unit setup failed: {0}")]
    Unit(#[from] UnitError),

    #[error("Route activation failed: {0}")]
    Route(#[from] RouteError),

    #[error("Failed to start: {0}")]
    Start(#[source] SupervisorError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("Another operation on '{0}' is in progress")]
    Busy(String),

    #[error("'{0}' is not deployed")]
    NotDeployed(String),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A deployment that stopped before completion, with how far it got
#[derive(Debug, Error)]
#[error("Deployment of '{name}' failed after reaching {last_state}: {error}")]
pub struct DeploymentFailure {
    pub name: String,
    pub last_state: DeploymentState,
    /// Every state passed through, ending in `Failed`
    pub states: Vec<DeploymentState>,
    /// Snapshot of the previous deployment, when one was taken
    pub backup: Option<PathBuf>,
    #[source]
    pub error: DeployError,
}

impl DeploymentFailure {
    /// Whether the failure happened before anything on disk changed
    pub fn is_validation(&self) -> bool {
        matches!(self.error, DeployError::Validation(_) | DeployError::Busy(_))
    }
}
