//! Application bundle inspection and executable discovery

use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ValidationError;

const RUNTIME_CONFIG_SUFFIX: &str = ".runtimeconfig.json";
const DEPS_SUFFIX: &str = ".deps.json";
const WEB_APP_MARKERS: [&str; 2] = ["web.config", "appsettings.json"];

/// What the supervisor runs, relative to the deployment directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "file")]
pub enum Executable {
    /// Assembly started through the runtime host
    Managed(String),
    /// Self-contained executable started directly
    Native(String),
}

impl Executable {
    pub fn file_name(&self) -> &str {
        match self {
            Executable::Managed(file) | Executable::Native(file) => file,
        }
    }

    /// `ExecStart=` command line for a deployment living in `app_dir`
    pub fn command_line(&self, app_dir: &Path, runtime_host: &Path) -> String {
        let target = app_dir.join(self.file_name());
        match self {
            Executable::Managed(_) => format!(
                "{} {}",
                quote_arg(&runtime_host.to_string_lossy()),
                quote_arg(&target.to_string_lossy())
            ),
            Executable::Native(_) => quote_arg(&target.to_string_lossy()),
        }
    }

    fn from_file_name(file_name: &str) -> Self {
        if file_name.ends_with(".dll") {
            Executable::Managed(file_name.to_string())
        } else {
            Executable::Native(file_name.to_string())
        }
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.chars().any(char::is_whitespace) {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Top-level regular file names of a bundle
fn file_names(dir: &Path) -> Result<BTreeSet<String>, ValidationError> {
    let entries =
        fs::read_dir(dir).map_err(|_| ValidationError::NotADirectory(dir.to_path_buf()))?;

    Ok(entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect())
}

/// `X.dll` with a matching `X.runtimeconfig.json`
fn managed_candidates(files: &BTreeSet<String>) -> Vec<String> {
    files
        .iter()
        .filter(|file| {
            file.strip_suffix(".dll")
                .map(|stem| files.contains(&format!("{}{}", stem, RUNTIME_CONFIG_SUFFIX)))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Extension-less `X` with a matching `X.runtimeconfig.json` or `X.deps.json`
fn native_candidates(files: &BTreeSet<String>) -> Vec<String> {
    files
        .iter()
        .filter(|file| !file.contains('.'))
        .filter(|file| {
            files.contains(&format!("{}{}", file, RUNTIME_CONFIG_SUFFIX))
                || files.contains(&format!("{}{}", file, DEPS_SUFFIX))
        })
        .cloned()
        .collect()
}

/// Check that a directory holds something a supervisor can run
pub fn validate_source_bundle(path: &Path) -> Result<(), ValidationError> {
    if !path.is_dir() {
        return Err(ValidationError::NotADirectory(path.to_path_buf()));
    }

    let files = file_names(path)?;
    let runnable = !managed_candidates(&files).is_empty()
        || !native_candidates(&files).is_empty()
        || WEB_APP_MARKERS.iter().any(|marker| files.contains(*marker));

    if !runnable {
        return Err(ValidationError::NoRuntimeArtifact(path.to_path_buf()));
    }
    Ok(())
}

/// Spellings of the application name tried when several candidates exist
fn name_variants(app_name: &str) -> Vec<String> {
    let mut capitalized = app_name.to_lowercase();
    if let Some(first) = capitalized.get(0..1) {
        capitalized = format!("{}{}", first.to_uppercase(), &capitalized[1..]);
    }

    let mut variants = Vec::new();
    for variant in [
        app_name.to_string(),
        app_name.to_lowercase(),
        app_name.to_uppercase(),
        capitalized,
    ] {
        if !variants.contains(&variant) {
            variants.push(variant);
        }
    }
    variants
}

/// Choose what the supervisor runs.
///
/// Precedence: a single managed assembly, then a single native executable
/// with a runtime descriptor, then a file named like the application, then
/// the explicit file name. Anything else is ambiguous.
pub fn discover_executable(
    bundle: &Path,
    app_name: &str,
    explicit: Option<&str>,
) -> Result<Executable, ValidationError> {
    let files = file_names(bundle)?;
    let managed = managed_candidates(&files);
    let native = native_candidates(&files);

    if managed.len() == 1 {
        debug!("Using managed assembly {}", managed[0]);
        return Ok(Executable::Managed(managed[0].clone()));
    }
    if managed.is_empty() && native.len() == 1 {
        debug!("Using native executable {}", native[0]);
        return Ok(Executable::Native(native[0].clone()));
    }

    for variant in name_variants(app_name) {
        let assembly = format!("{}.dll", variant);
        if files.contains(&assembly) {
            return Ok(Executable::Managed(assembly));
        }
        if files.contains(&variant) {
            return Ok(Executable::Native(variant));
        }
    }

    if let Some(explicit) = explicit {
        if !files.contains(explicit) {
            return Err(ValidationError::ExecutableNotFound(explicit.to_string()));
        }
        return Ok(Executable::from_file_name(explicit));
    }

    let candidates: Vec<String> = managed.into_iter().chain(native).collect();
    if candidates.is_empty() {
        Err(ValidationError::NoExecutable)
    } else {
        Err(ValidationError::AmbiguousExecutable { candidates })
    }
}

/// Path of the executable inside a staged deployment
pub fn staged_path(app_dir: &Path, executable: &Executable) -> PathBuf {
    app_dir.join(executable.file_name())
}
