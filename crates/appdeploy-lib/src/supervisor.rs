//! Process supervisor seam (systemd)

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::SupervisorSettings;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {output}")]
    Failed { command: String, output: String },
}

/// State of a supervised unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Running,
    Stopped,
    Failed,
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitStatus::Running => write!(f, "Running ✅"),
            UnitStatus::Stopped => write!(f, "Stopped"),
            UnitStatus::Failed => write!(f, "Failed ❌"),
        }
    }
}

/// Operations the deployment core needs from the process supervisor.
///
/// `unit` is the full unit name, e.g. `shop.service`.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn daemon_reload(&self) -> Result<(), SupervisorError>;

    /// Start on boot; does not start now
    async fn enable(&self, unit: &str) -> Result<(), SupervisorError>;

    async fn disable(&self, unit: &str) -> Result<(), SupervisorError>;

    async fn start(&self, unit: &str) -> Result<(), SupervisorError>;

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError>;

    async fn status(&self, unit: &str) -> Result<UnitStatus, SupervisorError>;

    /// The most recent `lines` log lines of a unit
    async fn logs(&self, unit: &str, lines: usize) -> Result<String, SupervisorError>;
}

/// systemd through `systemctl` and `journalctl`
#[derive(Debug, Clone)]
pub struct SystemdSupervisor {
    systemctl: String,
    journalctl: String,
}

impl SystemdSupervisor {
    pub fn new(settings: &SupervisorSettings) -> Self {
        Self {
            systemctl: settings.systemctl.clone(),
            journalctl: settings.journalctl.clone(),
        }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<String, SupervisorError> {
        run(&self.systemctl, args, true).await
    }
}

impl Default for SystemdSupervisor {
    fn default() -> Self {
        Self::new(&SupervisorSettings::default())
    }
}

/// Run a command and return its stdout. With `require_success`, a non-zero
/// exit is an error carrying stderr.
async fn run(
    program: &str,
    args: &[&str],
    require_success: bool,
) -> Result<String, SupervisorError> {
    let command = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    debug!("Running {}", command);

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| SupervisorError::Spawn {
            command: command.clone(),
            source,
        })?;

    if require_success && !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(SupervisorError::Failed {
            command,
            output: stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn parse_is_active(output: &str) -> UnitStatus {
    match output.trim() {
        "active" | "reloading" | "activating" => UnitStatus::Running,
        "failed" => UnitStatus::Failed,
        _ => UnitStatus::Stopped,
    }
}

#[async_trait]
impl Supervisor for SystemdSupervisor {
    async fn daemon_reload(&self) -> Result<(), SupervisorError> {
        self.systemctl(&["daemon-reload"]).await.map(|_| ())
    }

    async fn enable(&self, unit: &str) -> Result<(), SupervisorError> {
        self.systemctl(&["enable", unit]).await.map(|_| ())
    }

    async fn disable(&self, unit: &str) -> Result<(), SupervisorError> {
        self.systemctl(&["disable", unit]).await.map(|_| ())
    }

    async fn start(&self, unit: &str) -> Result<(), SupervisorError> {
        self.systemctl(&["start", unit]).await.map(|_| ())
    }

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError> {
        self.systemctl(&["stop", unit]).await.map(|_| ())
    }

    async fn status(&self, unit: &str) -> Result<UnitStatus, SupervisorError> {
        // is-active exits non-zero for anything but "active"
        let output = run(&self.systemctl, &["is-active", unit], false).await?;
        Ok(parse_is_active(&output))
    }

    async fn logs(&self, unit: &str, lines: usize) -> Result<String, SupervisorError> {
        let lines = lines.to_string();
        run(
            &self.journalctl,
            &["-u", unit, "-n", &lines, "--no-pager"],
            true,
        )
        .await
    }
}
