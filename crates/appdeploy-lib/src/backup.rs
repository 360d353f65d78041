//! Snapshots of deployments before they are replaced or removed

use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::staging::{copy_tree, StagingError};

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Failed to create backup directory {path:?}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to copy into backup: {0}")]
    Copy(#[from] StagingError),
}

/// Why a snapshot is taken; decides the backup name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupReason {
    /// `<name>-<timestamp>`
    Redeploy,
    /// `<name>-removed-<timestamp>`
    Removal,
}

/// Write-once copies under the backup root. Backups are never pruned.
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_root: PathBuf,
}

impl BackupManager {
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
        }
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Copy `destination` into a new backup directory if it exists
    pub fn snapshot_if_exists(
        &self,
        destination: &Path,
        name: &str,
        reason: BackupReason,
    ) -> Result<Option<PathBuf>, BackupError> {
        if !destination.is_dir() {
            return Ok(None);
        }

        let target = self.reserve(name, reason)?;
        if let Err(e) = copy_tree(destination, &target) {
            // An incomplete copy must not pass for a backup
            let _ = fs::remove_dir_all(&target);
            return Err(e.into());
        }

        info!(
            "Backed up {} to {}",
            destination.display(),
            target.display()
        );
        Ok(Some(target))
    }

    /// Create a fresh, uniquely named backup directory. `create_dir` fails on
    /// an existing path, so a collision moves on to the next suffix instead
    /// of reusing a prior backup.
    fn reserve(&self, name: &str, reason: BackupReason) -> Result<PathBuf, BackupError> {
        fs::create_dir_all(&self.backup_root).map_err(|source| BackupError::Create {
            path: self.backup_root.clone(),
            source,
        })?;

        let timestamp = Utc::now().format(TIMESTAMP_FORMAT);
        let base = match reason {
            BackupReason::Redeploy => format!("{}-{}", name, timestamp),
            BackupReason::Removal => format!("{}-removed-{}", name, timestamp),
        };

        let mut attempt = 0u32;
        loop {
            let candidate = if attempt == 0 {
                self.backup_root.join(&base)
            } else {
                self.backup_root.join(format!("{}-{}", base, attempt))
            };

            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(source) => {
                    return Err(BackupError::Create {
                        path: candidate,
                        source,
                    })
                }
            }
        }
    }

    /// Backups of one application, oldest first
    pub fn list(&self, name: &str) -> Result<Vec<PathBuf>, BackupError> {
        let entries = match fs::read_dir(&self.backup_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(BackupError::Create {
                    path: self.backup_root.clone(),
                    source,
                })
            }
        };

        let prefix = format!("{}-", name);
        let mut backups: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|file_name| file_name.strip_prefix(&prefix))
                    // Names may share a prefix ("shop" and "shop-api"), the
                    // remainder must start with a timestamp or "removed"
                    .map(|rest| {
                        rest.starts_with("removed-")
                            || rest.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false)
                    })
                    .unwrap_or(false)
            })
            .map(|entry| entry.path())
            .collect();

        backups.sort_by_key(|path| {
            fs::metadata(path)
                .and_then(|meta| meta.modified())
                .ok()
        });
        Ok(backups)
    }
}
