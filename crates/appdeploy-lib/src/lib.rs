//! appdeploy library
//!
//! Deploys pre-built web applications onto a single host: the bundle is
//! validated and staged, a systemd unit runs it, an nginx route exposes it
//! and a backup of the previous deployment is kept before anything changes.
//!
//! # Example
//!
//! ```ignore
//! use appdeploy_lib::{DeployConfig, Deployer, DeploymentRequest};
//!
//! let deployer = Deployer::with_system_services(DeployConfig::default());
//! let report = deployer
//!     .deploy(DeploymentRequest::new("shop", "./publish", 5001).with_subdirectory("store"))
//!     .await?;
//! println!("{} is live at {}", report.name, report.route);
//! ```

pub mod backup;
pub mod bundle;
pub mod config;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod probe;
pub mod staging;
pub mod status;
pub mod supervisor;
pub mod unit;
pub mod validate;

pub use backup::{BackupError, BackupManager, BackupReason};
pub use bundle::{discover_executable, validate_source_bundle, Executable};
pub use config::{ConfigError, DeployConfig};
pub use error::{DeployError, DeploymentFailure, ValidationError};
pub use orchestrator::{
    Deployer, DeploymentReport, DeploymentRequest, DeploymentState, RemovalReport,
    ValidatedDeployment,
};
pub use status::{AppState, AppStatus, StatusQuery};
pub use supervisor::{Supervisor, SupervisorError, SystemdSupervisor, UnitStatus};
pub use unit::{generate_unit, InstalledUnit, UnitDefinition, UnitError, UnitFiles};

// Re-export the building blocks callers need alongside the deployer
pub use appdeploy_cert::{CertificateEntry, CertificateRegistry, RegistryError};
pub use appdeploy_router::{HostingMode, NginxProxy, ProxyControl, ProxyError, UpstreamScheme};
