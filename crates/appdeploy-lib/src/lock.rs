//! Per-application advisory locks
//!
//! Every mutating operation on an application holds
//! `<state_dir>/locks/<name>.lock`. A second operation on the same name fails
//! fast instead of waiting.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::DeployError;

/// Held lock; released on drop
#[derive(Debug)]
pub struct AppLock {
    file: File,
    path: PathBuf,
}

impl AppLock {
    pub fn acquire(state_dir: &Path, name: &str) -> Result<Self, DeployError> {
        let lock_dir = state_dir.join("locks");
        fs::create_dir_all(&lock_dir).map_err(|source| DeployError::Io {
            path: lock_dir.clone(),
            source,
        })?;

        let path = lock_dir.join(format!("{}.lock", name));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| DeployError::Io {
                path: path.clone(),
                source,
            })?;

        if let Err(e) = file.try_lock_exclusive() {
            debug!("Lock {:?} is held: {}", path, e);
            return Err(DeployError::Busy(name.to_string()));
        }

        // Owner PID, for operators inspecting a stuck lock
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        debug!("Acquired lock {:?}", path);
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AppLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock {:?}: {}", self.path, e);
        }
    }
}
