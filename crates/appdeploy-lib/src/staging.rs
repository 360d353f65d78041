//! Staging a bundle into its deployment directory

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::bundle::{staged_path, Executable};
use crate::config::RuntimeSettings;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to walk {path:?}: {message}")]
    Walk { path: PathBuf, message: String },

    #[error("Failed to hand {path:?} to {owner}: {message}")]
    Ownership {
        path: PathBuf,
        owner: String,
        message: String,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StagingError + '_ {
    move |source| StagingError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Recursively copy `source` into `destination`. Symlinks are recreated
/// rather than followed.
pub fn copy_tree(source: &Path, destination: &Path) -> Result<u64, StagingError> {
    let mut copied = 0;

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| StagingError::Walk {
            path: source.to_path_buf(),
            message: e.to_string(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| StagingError::Walk {
                path: entry.path().to_path_buf(),
                message: e.to_string(),
            })?;
        let target = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(io_error(&target))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(io_error(entry.path()))?;
            copy_link(&link, &target).map_err(io_error(&target))?;
        } else {
            fs::copy(entry.path(), &target).map_err(io_error(&target))?;
            copied += 1;
        }
    }

    Ok(copied)
}

#[cfg(unix)]
fn copy_link(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_link(link: &Path, target: &Path) -> io::Result<()> {
    fs::copy(link, target).map(|_| ())
}

/// Directories 0755, files 0644, the executable 0755
#[cfg(unix)]
pub fn normalize_permissions(
    app_dir: &Path,
    executable: Option<&Path>,
) -> Result<(), StagingError> {
    use std::os::unix::fs::PermissionsExt;

    for entry in WalkDir::new(app_dir).follow_links(false) {
        let entry = entry.map_err(|e| StagingError::Walk {
            path: app_dir.to_path_buf(),
            message: e.to_string(),
        })?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }

        let mode = if file_type.is_dir() || Some(entry.path()) == executable {
            0o755
        } else {
            0o644
        };
        fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))
            .map_err(io_error(entry.path()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn normalize_permissions(
    _app_dir: &Path,
    _executable: Option<&Path>,
) -> Result<(), StagingError> {
    Ok(())
}

/// `chown -R user:group`
fn hand_over(app_dir: &Path, runtime: &RuntimeSettings) -> Result<(), StagingError> {
    let owner = format!("{}:{}", runtime.user, runtime.group);
    let output = Command::new("chown")
        .arg("-R")
        .arg(&owner)
        .arg(app_dir)
        .output()
        .map_err(|e| StagingError::Ownership {
            path: app_dir.to_path_buf(),
            owner: owner.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(StagingError::Ownership {
            path: app_dir.to_path_buf(),
            owner,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(suffix);
    path.with_file_name(name)
}

/// Replace `destination` with a copy of `source`.
///
/// The copy is assembled next to the destination first, so a failed copy
/// leaves the previous deployment in place.
pub fn stage(
    source: &Path,
    destination: &Path,
    executable: Option<&Executable>,
    runtime: &RuntimeSettings,
) -> Result<(), StagingError> {
    let incoming = sibling(destination, ".staging");
    if incoming.exists() {
        fs::remove_dir_all(&incoming).map_err(io_error(&incoming))?;
    }
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }

    let result = copy_tree(source, &incoming).and_then(|copied| {
        let executable_path = executable.map(|exe| staged_path(&incoming, exe));
        normalize_permissions(&incoming, executable_path.as_deref())?;
        Ok(copied)
    });
    let copied = match result {
        Ok(copied) => copied,
        Err(e) => {
            let _ = fs::remove_dir_all(&incoming);
            return Err(e);
        }
    };

    if destination.exists() {
        fs::remove_dir_all(destination).map_err(io_error(destination))?;
    }
    fs::rename(&incoming, destination).map_err(io_error(destination))?;

    if runtime.normalize_ownership {
        hand_over(destination, runtime)?;
    } else {
        debug!("Ownership normalization disabled, keeping current owner");
    }

    info!(
        "Staged {} files from {} into {}",
        copied,
        source.display(),
        destination.display()
    );
    Ok(())
}
