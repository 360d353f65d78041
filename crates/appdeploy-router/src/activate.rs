//! Route activation
//!
//! Definitions are written to an "available" directory and enabled through a
//! symlink in the matching "enabled" directory, the way Debian lays out nginx.
//! Direct routes are full sites; subdirectory routes are location snippets
//! pulled into a shared host site.
//!
//! Every file and link touched during activation is journaled. If the proxy
//! rejects the resulting configuration, the journal is replayed backwards so
//! the previously active configuration is restored byte for byte, and the
//! rejected definition is left next to it as `<file>.rejected`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::proxy::{ProxyControl, ProxyError};
use crate::route::{ActiveRoute, HostingMode, RouteDefinition, RouteSettings};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Proxy rejected the configuration, previous routes kept: {0}")]
    SyntaxCheck(#[source] ProxyError),

    #[error("Configuration is valid but the proxy failed to reload: {0}")]
    Reload(#[source] ProxyError),

    #[error("Site name '{0}' is reserved for the proxy host configuration")]
    ReservedSite(String),

    #[error("{} exists and is not managed by appdeploy", .0.display())]
    NotManaged(PathBuf),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RouteError + '_ {
    move |source| RouteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where definitions live on disk
#[derive(Debug, Clone)]
pub struct RouteLayout {
    pub sites_available: PathBuf,
    pub sites_enabled: PathBuf,
    pub locations_available: PathBuf,
    pub locations_enabled: PathBuf,
    /// Site disabled when an application takes over the root
    pub default_site: String,
    /// Site that includes every enabled location snippet
    pub host_site: String,
}

impl RouteLayout {
    /// Debian-style layout under an nginx configuration root
    pub fn under(nginx_root: &Path) -> Self {
        Self {
            sites_available: nginx_root.join("sites-available"),
            sites_enabled: nginx_root.join("sites-enabled"),
            locations_available: nginx_root.join("appdeploy").join("locations-available"),
            locations_enabled: nginx_root.join("appdeploy").join("locations-enabled"),
            default_site: "default".to_string(),
            host_site: "appdeploy-subdirectories".to_string(),
        }
    }

    /// Whether a site name belongs to the stock default or the shared host site
    pub fn is_reserved(&self, site_name: &str) -> bool {
        site_name == self.default_site || site_name == self.host_site
    }

    fn site_paths(&self, site_name: &str) -> (PathBuf, PathBuf) {
        (
            self.sites_available.join(site_name),
            self.sites_enabled.join(site_name),
        )
    }

    fn location_paths(&self, site_name: &str) -> (PathBuf, PathBuf) {
        let file_name = format!("{}.conf", site_name);
        (
            self.locations_available.join(&file_name),
            self.locations_enabled.join(&file_name),
        )
    }

    fn paths_for(&self, site_name: &str, mode: &HostingMode) -> (PathBuf, PathBuf) {
        match mode {
            HostingMode::Direct => self.site_paths(site_name),
            HostingMode::Subdirectory(_) => self.location_paths(site_name),
        }
    }

    fn host_site_definition(&self, settings: &RouteSettings) -> String {
        format!(
            "# appdeploy host site for subdirectory routes\n\
             server {{\n    \
                 listen {port};\n    \
                 listen [::]:{port};\n    \
                 server_name {server_name};\n\
             \n    \
                 include {locations}/*.conf;\n\
             }}\n",
            port = settings.listen_port,
            server_name = settings.server_name,
            locations = self.locations_enabled.display(),
        )
    }
}

/// One reversible filesystem change
enum Change {
    File {
        path: PathBuf,
        previous: Option<Vec<u8>>,
    },
    Link {
        path: PathBuf,
        previous: Option<PathBuf>,
    },
}

#[derive(Default)]
struct Journal {
    changes: Vec<Change>,
}

impl Journal {
    fn write_file(&mut self, path: &Path, contents: &[u8]) -> Result<(), RouteError> {
        let previous = read_optional(path)?;
        self.changes.push(Change::File {
            path: path.to_path_buf(),
            previous,
        });
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        fs::write(path, contents).map_err(io_error(path))
    }

    fn remove_file(&mut self, path: &Path) -> Result<(), RouteError> {
        if let Some(previous) = read_optional(path)? {
            self.changes.push(Change::File {
                path: path.to_path_buf(),
                previous: Some(previous),
            });
            fs::remove_file(path).map_err(io_error(path))?;
        }
        Ok(())
    }

    fn set_link(&mut self, path: &Path, target: Option<&Path>) -> Result<(), RouteError> {
        let metadata = fs::symlink_metadata(path).ok();
        let previous = fs::read_link(path).ok();
        match target {
            Some(target) if previous.as_deref() == Some(target) => return Ok(()),
            None if metadata.is_none() => return Ok(()),
            _ => {}
        }

        match metadata {
            Some(meta) if !meta.file_type().is_symlink() => {
                // A plain file where a link is expected; keep its bytes for roll back
                self.remove_file(path)?;
            }
            Some(_) => {
                self.changes.push(Change::Link {
                    path: path.to_path_buf(),
                    previous,
                });
                fs::remove_file(path).map_err(io_error(path))?;
            }
            None => self.changes.push(Change::Link {
                path: path.to_path_buf(),
                previous: None,
            }),
        }

        if let Some(target) = target {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io_error(parent))?;
            }
            make_link(target, path).map_err(io_error(path))?;
        }
        Ok(())
    }

    /// Undo every change, newest first
    fn roll_back(self) {
        for change in self.changes.into_iter().rev() {
            let result = match &change {
                Change::File { path, previous } => match previous {
                    Some(bytes) => fs::write(path, bytes),
                    None => remove_if_present(path),
                },
                Change::Link { path, previous } => {
                    remove_if_present(path).and_then(|_| match previous {
                        Some(target) => make_link(target, path),
                        None => Ok(()),
                    })
                }
            };
            if let Err(e) = result {
                let path = match &change {
                    Change::File { path, .. } | Change::Link { path, .. } => path,
                };
                warn!("Failed to restore {}: {}", path.display(), e);
            }
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, RouteError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path)(e)),
    }
}

/// Whether an existing definition file was generated by appdeploy.
/// Missing files count as managed.
fn is_managed(path: &Path) -> Result<bool, RouteError> {
    Ok(match read_optional(path)? {
        Some(bytes) => ActiveRoute::parse(&String::from_utf8_lossy(&bytes)).is_some(),
        None => true,
    })
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(unix)]
fn make_link(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn make_link(target: &Path, link: &Path) -> io::Result<()> {
    fs::copy(target, link).map(|_| ())
}

/// Activates and removes routes against a proxy
pub struct RouteActivator {
    layout: RouteLayout,
    proxy: Arc<dyn ProxyControl>,
}

impl RouteActivator {
    pub fn new(layout: RouteLayout, proxy: Arc<dyn ProxyControl>) -> Self {
        Self { layout, proxy }
    }

    pub fn layout(&self) -> &RouteLayout {
        &self.layout
    }

    /// Write, enable, check and reload a route.
    ///
    /// Nothing is reloaded unless the syntax check passes; on a failed check
    /// every touched file and link is restored.
    pub async fn activate(&self, route: &RouteDefinition) -> Result<PathBuf, RouteError> {
        if let Some(path) = self.foreign_definition(&route.site_name)? {
            return Err(RouteError::NotManaged(path));
        }

        let (available, enabled) = self.layout.paths_for(&route.site_name, &route.mode);
        let rendered = route.render();
        let mut journal = Journal::default();

        if let Err(e) = self.stage(route, &rendered, &available, &enabled, &mut journal) {
            journal.roll_back();
            return Err(e);
        }

        if let Err(e) = self.proxy.check().await {
            warn!(
                "Route for '{}' failed the proxy syntax check, restoring previous configuration",
                route.app_name
            );
            journal.roll_back();

            let rejected = rejected_path(&available);
            if let Err(write_error) = fs::write(&rejected, &rendered) {
                warn!(
                    "Failed to keep rejected definition at {}: {}",
                    rejected.display(),
                    write_error
                );
            }
            return Err(RouteError::SyntaxCheck(e));
        }

        let stale = rejected_path(&available);
        if let Err(e) = remove_if_present(&stale) {
            warn!(
                "Failed to remove stale rejected definition {}: {}",
                stale.display(),
                e
            );
        }
        self.proxy.reload().await.map_err(RouteError::Reload)?;

        info!(
            "Route {} -> port {} active for '{}'",
            route.mode.public_path(),
            route.port,
            route.app_name
        );
        Ok(available)
    }

    fn stage(
        &self,
        route: &RouteDefinition,
        rendered: &str,
        available: &Path,
        enabled: &Path,
        journal: &mut Journal,
    ) -> Result<(), RouteError> {
        journal.write_file(available, rendered.as_bytes())?;
        journal.set_link(enabled, Some(available))?;

        // A redeploy may switch hosting mode; the other kind must not linger
        let (other_available, other_enabled) = match route.mode {
            HostingMode::Direct => self.layout.location_paths(&route.site_name),
            HostingMode::Subdirectory(_) => self.layout.site_paths(&route.site_name),
        };
        journal.set_link(&other_enabled, None)?;
        journal.remove_file(&other_available)?;

        match route.mode {
            HostingMode::Direct => {
                let (_, default_enabled) = self.layout.site_paths(&self.layout.default_site);
                if fs::symlink_metadata(&default_enabled).is_ok() {
                    debug!("Disabling default site {}", default_enabled.display());
                }
                journal.set_link(&default_enabled, None)?;

                // Only one site may own the root
                for (other_site, other_enabled) in self.enabled_direct_sites()? {
                    if other_site != route.site_name {
                        info!(
                            "Disabling direct route '{}' in favor of '{}'",
                            other_site, route.app_name
                        );
                        journal.set_link(&other_enabled, None)?;
                    }
                }
            }
            HostingMode::Subdirectory(_) => {
                let (host_available, host_enabled) =
                    self.layout.site_paths(&self.layout.host_site);
                if !host_available.exists() {
                    journal.write_file(
                        &host_available,
                        self.layout.host_site_definition(&route.settings).as_bytes(),
                    )?;
                }
                journal.set_link(&host_enabled, Some(&host_available))?;
            }
        }

        Ok(())
    }

    /// The first existing definition for a site that appdeploy did not write,
    /// or any definition at all when the site name is reserved.
    pub fn foreign_definition(&self, site_name: &str) -> Result<Option<PathBuf>, RouteError> {
        if self.layout.is_reserved(site_name) {
            return Err(RouteError::ReservedSite(site_name.to_string()));
        }
        for (available, enabled) in [
            self.layout.site_paths(site_name),
            self.layout.location_paths(site_name),
        ] {
            for path in [available, enabled] {
                if !is_managed(&path)? {
                    return Ok(Some(path));
                }
            }
        }
        Ok(None)
    }

    /// Enabled sites whose definition routes an application at `/`
    fn enabled_direct_sites(&self) -> Result<Vec<(String, PathBuf)>, RouteError> {
        let entries = match fs::read_dir(&self.layout.sites_enabled) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.layout.sites_enabled)(e)),
        };

        let mut sites = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(&self.layout.sites_enabled))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.layout.is_reserved(&name) {
                continue;
            }
            let path = entry.path();
            // Dangling links read as missing
            let direct = match fs::read(&path) {
                Ok(bytes) => ActiveRoute::parse(&String::from_utf8_lossy(&bytes))
                    .map(|active| active.mode().is_direct())
                    .unwrap_or(false),
                Err(_) => false,
            };
            if direct {
                sites.push((name, path));
            }
        }
        Ok(sites)
    }

    /// Remove every definition and enabling link for a site. Returns whether
    /// anything existed. The proxy is not reloaded, and files appdeploy did
    /// not write are refused.
    pub fn deactivate(&self, site_name: &str) -> Result<bool, RouteError> {
        if let Some(path) = self.foreign_definition(site_name)? {
            return Err(RouteError::NotManaged(path));
        }
        let mut removed = false;

        for (available, enabled) in [
            self.layout.site_paths(site_name),
            self.layout.location_paths(site_name),
        ] {
            for path in [enabled, rejected_path(&available), available] {
                if fs::symlink_metadata(&path).is_ok() {
                    fs::remove_file(&path).map_err(io_error(&path))?;
                    debug!("Removed {}", path.display());
                    removed = true;
                }
            }
        }

        if removed {
            info!("Route definitions for '{}' removed", site_name);
        }
        Ok(removed)
    }

    /// Reload the proxy after checking the configuration
    pub async fn reload(&self) -> Result<(), RouteError> {
        self.proxy.check().await.map_err(RouteError::SyntaxCheck)?;
        self.proxy.reload().await.map_err(RouteError::Reload)
    }

    /// The enabled route for a site, if one is active
    pub fn read_active(&self, site_name: &str) -> Result<Option<ActiveRoute>, RouteError> {
        for (_, enabled) in [
            self.layout.site_paths(site_name),
            self.layout.location_paths(site_name),
        ] {
            if let Some(bytes) = read_optional(&enabled)? {
                return Ok(ActiveRoute::parse(&String::from_utf8_lossy(&bytes)));
            }
        }
        Ok(None)
    }

    /// Whether any definition file (enabled or not) exists for a site
    pub fn has_definition(&self, site_name: &str) -> bool {
        [
            self.layout.site_paths(site_name),
            self.layout.location_paths(site_name),
        ]
        .iter()
        .any(|(available, enabled)| {
            fs::symlink_metadata(available).is_ok() || fs::symlink_metadata(enabled).is_ok()
        })
    }
}

fn rejected_path(available: &Path) -> PathBuf {
    let mut name = available
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".rejected");
    available.with_file_name(name)
}
