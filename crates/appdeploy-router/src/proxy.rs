//! Reverse-proxy control

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {output}")]
    Failed { command: String, output: String },
}

/// Operations the deployment core needs from the reverse proxy
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Validate the complete active configuration
    async fn check(&self) -> Result<(), ProxyError>;

    /// Apply the active configuration
    async fn reload(&self) -> Result<(), ProxyError>;
}

/// nginx controlled through its binary and the service manager
#[derive(Debug, Clone)]
pub struct NginxProxy {
    nginx_bin: PathBuf,
    reload_command: Vec<String>,
}

impl NginxProxy {
    pub fn new(nginx_bin: impl Into<PathBuf>, reload_command: Vec<String>) -> Self {
        Self {
            nginx_bin: nginx_bin.into(),
            reload_command,
        }
    }
}

impl Default for NginxProxy {
    fn default() -> Self {
        Self::new(
            "nginx",
            vec![
                "systemctl".to_string(),
                "reload".to_string(),
                "nginx".to_string(),
            ],
        )
    }
}

async fn run(program: &str, args: &[String]) -> Result<(), ProxyError> {
    let command = std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");
    debug!("Running {}", command);

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| ProxyError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        // nginx -t reports on stderr
        let mut text = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if text.is_empty() {
            text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        return Err(ProxyError::Failed {
            command,
            output: text,
        });
    }

    Ok(())
}

#[async_trait]
impl ProxyControl for NginxProxy {
    async fn check(&self) -> Result<(), ProxyError> {
        run(&self.nginx_bin.to_string_lossy(), &["-t".to_string()]).await
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        let (program, args) = self
            .reload_command
            .split_first()
            .ok_or_else(|| ProxyError::Failed {
                command: "reload".to_string(),
                output: "No reload command configured".to_string(),
            })?;
        run(program, args).await
    }
}
