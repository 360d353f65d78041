//! Configuration file discovery
//!
//! The first match wins: `--config`, then `$APPDEPLOY_CONFIG`, then
//! `/etc/appdeploy/config.yml`, then `~/.appdeploy/config.yml`. Without any
//! file the built-in defaults apply.

use anyhow::{Context, Result};
use appdeploy_lib::DeployConfig;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_ENV: &str = "APPDEPLOY_CONFIG";
pub const SYSTEM_CONFIG: &str = "/etc/appdeploy/config.yml";

/// Where the effective configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    Environment(PathBuf),
    System(PathBuf),
    User(PathBuf),
    Defaults,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::Explicit(path)
            | ConfigSource::Environment(path)
            | ConfigSource::System(path)
            | ConfigSource::User(path) => Some(path),
            ConfigSource::Defaults => None,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Explicit(path) => write!(f, "{} (--config)", path.display()),
            ConfigSource::Environment(path) => write!(f, "{} (${})", path.display(), CONFIG_ENV),
            ConfigSource::System(path) => write!(f, "{} (system)", path.display()),
            ConfigSource::User(path) => write!(f, "{} (user)", path.display()),
            ConfigSource::Defaults => write!(f, "built-in defaults"),
        }
    }
}

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    /// `~/.appdeploy/config.yml`
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".appdeploy").join("config.yml"))
    }

    /// Resolve the configuration source from the process environment
    pub fn locate(explicit: Option<&Path>) -> ConfigSource {
        Self::locate_with(
            explicit,
            std::env::var_os(CONFIG_ENV).map(PathBuf::from),
            Path::new(SYSTEM_CONFIG),
            Self::user_config_path(),
        )
    }

    /// Resolution with every input given. Explicit and environment paths are
    /// used even when missing so the error names them; the system and user
    /// files only count when present.
    pub fn locate_with(
        explicit: Option<&Path>,
        from_env: Option<PathBuf>,
        system: &Path,
        user: Option<PathBuf>,
    ) -> ConfigSource {
        if let Some(path) = explicit {
            return ConfigSource::Explicit(path.to_path_buf());
        }
        if let Some(path) = from_env.filter(|path| !path.as_os_str().is_empty()) {
            return ConfigSource::Environment(path);
        }
        if system.is_file() {
            return ConfigSource::System(system.to_path_buf());
        }
        match user {
            Some(path) if path.is_file() => ConfigSource::User(path),
            _ => ConfigSource::Defaults,
        }
    }

    /// Load the configuration from a resolved source
    pub fn load_from(source: &ConfigSource) -> Result<DeployConfig> {
        match source.path() {
            Some(path) => {
                debug!("Loading configuration from {}", source);
                DeployConfig::load(path)
                    .with_context(|| format!("Failed to load configuration from {}", source))
            }
            None => Ok(DeployConfig::default()),
        }
    }

    /// Write the commented default configuration to `path`
    pub fn write_template(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            anyhow::bail!(
                "{} already exists; pass --force to overwrite",
                path.display()
            );
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }
        fs::write(path, DeployConfig::template())
            .context(format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }
}
