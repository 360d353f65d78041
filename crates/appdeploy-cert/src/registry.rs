//! On-disk certificate registry
//!
//! One line per certificate, `name|certificate|key|domain|created`, in the
//! order certificates were registered. The file is meant to be readable and
//! editable by an operator, so lines that do not parse are carried through
//! rewrites untouched.
//!
//! Expired certificates are swept whenever the registry is read: both material
//! files are deleted and the line is dropped. Every read-sweep-rewrite runs
//! under an advisory exclusive lock on a sibling `.lock` file.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::material::{parse_not_after, read_not_after, verify_key_pair, MaterialError};
use crate::self_signed::{generate_self_signed_cert, SelfSignedError};

const FIELD_SEPARATOR: char = '|';

/// Certificate registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Certificate not found: {0}")]
    NotFound(String),

    #[error("Certificate already registered: {0}")]
    AlreadyExists(String),

    #[error("Invalid certificate name: {0}")]
    InvalidName(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Field contains the registry separator: {0}")]
    InvalidField(String),

    #[error("Certificate already expired on {0}")]
    Expired(DateTime<Utc>),

    #[error("Failed to remove certificate material: {0}")]
    PartialRemoval(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Material(#[from] MaterialError),

    #[error(transparent)]
    Generation(#[from] SelfSignedError),
}

/// A registered certificate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateEntry {
    pub name: String,
    pub certificate_path: PathBuf,
    pub key_path: PathBuf,
    pub domain: String,
    pub created_at: DateTime<Utc>,
    /// Read from the certificate during the sweep; not stored in the registry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

impl CertificateEntry {
    /// Days until the certificate expires, if known
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.not_after.map(|not_after| (not_after - now).num_days())
    }

    fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.name,
            self.certificate_path.display(),
            self.key_path.display(),
            self.domain,
            self.created_at.to_rfc3339()
        )
    }

    fn parse_line(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        if fields.len() != 5 || fields[0].is_empty() {
            return None;
        }

        let created_at = DateTime::parse_from_rfc3339(fields[4].trim())
            .ok()?
            .with_timezone(&Utc);

        Some(Self {
            name: fields[0].to_string(),
            certificate_path: PathBuf::from(fields[1]),
            key_path: PathBuf::from(fields[2]),
            domain: fields[3].to_string(),
            created_at,
            not_after: None,
        })
    }

    /// Delete the key, then the certificate. Missing files count as deleted.
    ///
    /// A key that cannot be deleted stops the removal with both files in
    /// place, so a failure never leaves a certificate without its key unless
    /// the certificate itself resists deletion.
    fn delete_material(&self) -> Result<(), MaterialRemoval> {
        remove_material_file(&self.key_path).map_err(MaterialRemoval::Untouched)?;
        remove_material_file(&self.certificate_path).map_err(MaterialRemoval::KeyDeleted)
    }
}

/// How far a failed material deletion got
#[derive(Debug)]
enum MaterialRemoval {
    /// Nothing was deleted; the entry must be kept
    Untouched(String),
    /// The key is gone but the certificate is still on disk
    KeyDeleted(String),
}

impl MaterialRemoval {
    fn message(&self) -> &str {
        match self {
            MaterialRemoval::Untouched(message) | MaterialRemoval::KeyDeleted(message) => message,
        }
    }
}

fn remove_material_file(path: &Path) -> Result<(), String> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Deleted {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("{}: {}", path.display(), e)),
    }
}

/// A registry line: either a parsed entry or operator text kept verbatim
#[derive(Debug, Clone)]
enum RegistryLine {
    Entry(CertificateEntry),
    Unparsed(String),
}

/// Held while the registry is being read or rewritten
struct RegistryLock {
    file: File,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// File-backed certificate registry
pub struct CertificateRegistry {
    registry_path: PathBuf,
    cert_root: PathBuf,
}

impl CertificateRegistry {
    /// Create a registry stored at `registry_path`; generated and imported
    /// material is written under `cert_root`.
    pub fn new(registry_path: impl Into<PathBuf>, cert_root: impl Into<PathBuf>) -> Self {
        Self {
            registry_path: registry_path.into(),
            cert_root: cert_root.into(),
        }
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    pub fn cert_root(&self) -> &Path {
        &self.cert_root
    }

    /// Validate certificate name (alphanumeric, hyphens, underscores only)
    pub fn validate_name(name: &str) -> Result<(), RegistryError> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    /// Validate a certificate domain
    pub fn validate_domain(domain: &str) -> Result<(), RegistryError> {
        if domain.is_empty() {
            return Err(RegistryError::InvalidDomain(
                "Domain cannot be empty".to_string(),
            ));
        }

        if domain.contains(' ') || domain.contains(FIELD_SEPARATOR) {
            return Err(RegistryError::InvalidDomain(format!(
                "Domain contains invalid characters: {}",
                domain
            )));
        }

        if domain.starts_with('.') || domain.ends_with('.') {
            return Err(RegistryError::InvalidDomain(
                "Domain cannot start or end with a dot".to_string(),
            ));
        }

        Ok(())
    }

    /// Append a record. The caller ensures `name` is not already active.
    pub fn register(
        &self,
        name: &str,
        certificate_path: &Path,
        key_path: &Path,
        domain: &str,
    ) -> Result<CertificateEntry, RegistryError> {
        let _lock = self.lock()?;
        self.append_locked(name, certificate_path, key_path, domain)
    }

    /// All non-expired entries in registration order
    pub fn list(&self) -> Result<Vec<CertificateEntry>, RegistryError> {
        self.list_at(Utc::now())
    }

    /// Like [`list`](Self::list), sweeping against the given clock
    pub fn list_at(&self, now: DateTime<Utc>) -> Result<Vec<CertificateEntry>, RegistryError> {
        let _lock = self.lock()?;
        self.sweep_locked(now)
    }

    /// Look up a non-expired entry by name
    pub fn find_by_name(&self, name: &str) -> Result<CertificateEntry, RegistryError> {
        self.find_by_name_at(name, Utc::now())
    }

    pub fn find_by_name_at(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<CertificateEntry, RegistryError> {
        self.list_at(now)?
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Delete a certificate's material files, then drop its line.
    ///
    /// If the key cannot be deleted, both files and the line are kept. Once
    /// the key is gone the line is dropped even if the certificate file
    /// lingers, so the registry never points at a certificate without a key.
    pub fn remove(&self, name: &str) -> Result<CertificateEntry, RegistryError> {
        let _lock = self.lock()?;
        self.sweep_locked(Utc::now())?;

        let mut removed = None;
        let remaining: Vec<RegistryLine> = self
            .read_lines()?
            .into_iter()
            .filter_map(|line| match line {
                RegistryLine::Entry(entry) if removed.is_none() && entry.name == name => {
                    removed = Some(entry);
                    None
                }
                other => Some(other),
            })
            .collect();
        let removed = removed.ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        match removed.delete_material() {
            Ok(()) => {}
            Err(MaterialRemoval::Untouched(message)) => {
                warn!("Certificate '{}' kept, key not deleted: {}", name, message);
                return Err(RegistryError::PartialRemoval(message));
            }
            Err(MaterialRemoval::KeyDeleted(message)) => {
                self.write_lines(&remaining)?;
                warn!("Certificate '{}' removed with errors: {}", name, message);
                return Err(RegistryError::PartialRemoval(message));
            }
        }
        self.write_lines(&remaining)?;

        info!("Removed certificate '{}'", name);
        Ok(removed)
    }

    /// Generate a self-signed certificate, store it under the certificate root
    /// and register it.
    pub fn create_self_signed(
        &self,
        name: &str,
        domain: &str,
        validity_days: u32,
    ) -> Result<CertificateEntry, RegistryError> {
        Self::validate_name(name)?;
        Self::validate_domain(domain)?;

        let _lock = self.lock()?;
        self.ensure_absent_locked(name)?;

        let generated = generate_self_signed_cert(domain, validity_days)?;
        let (certificate_path, key_path) = self.material_paths(name);
        self.write_material(
            &certificate_path,
            generated.pem_cert.as_bytes(),
            &key_path,
            generated.pem_key.as_bytes(),
        )?;

        let mut entry = self.append_locked(name, &certificate_path, &key_path, domain)?;
        entry.not_after = Some(generated.not_after);

        info!(
            "Created self-signed certificate '{}' for {} (expires {})",
            name, domain, generated.not_after
        );
        Ok(entry)
    }

    /// Copy existing PEM material under the certificate root and register it
    pub fn import(
        &self,
        name: &str,
        source_cert: &Path,
        source_key: &Path,
        domain: &str,
    ) -> Result<CertificateEntry, RegistryError> {
        Self::validate_name(name)?;
        Self::validate_domain(domain)?;

        let cert_pem = fs::read(source_cert)?;
        let key_pem = fs::read(source_key)?;

        let not_after = parse_not_after(&cert_pem)?;
        if not_after <= Utc::now() {
            return Err(RegistryError::Expired(not_after));
        }
        verify_key_pair(&cert_pem, &key_pem)?;

        let _lock = self.lock()?;
        self.ensure_absent_locked(name)?;

        let (certificate_path, key_path) = self.material_paths(name);
        self.write_material(&certificate_path, &cert_pem, &key_path, &key_pem)?;

        let mut entry = self.append_locked(name, &certificate_path, &key_path, domain)?;
        entry.not_after = Some(not_after);

        info!(
            "Imported certificate '{}' from {}",
            name,
            source_cert.display()
        );
        Ok(entry)
    }

    fn material_paths(&self, name: &str) -> (PathBuf, PathBuf) {
        (
            self.cert_root.join(format!("{}.crt", name)),
            self.cert_root.join(format!("{}.key", name)),
        )
    }

    fn ensure_absent_locked(&self, name: &str) -> Result<(), RegistryError> {
        if self
            .sweep_locked(Utc::now())?
            .iter()
            .any(|entry| entry.name == name)
        {
            return Err(RegistryError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    fn write_material(
        &self,
        certificate_path: &Path,
        cert_pem: &[u8],
        key_path: &Path,
        key_pem: &[u8],
    ) -> Result<(), RegistryError> {
        fs::create_dir_all(&self.cert_root)?;

        fs::write(certificate_path, cert_pem)?;
        if let Err(e) = write_private(key_path, key_pem) {
            let _ = fs::remove_file(certificate_path);
            return Err(e.into());
        }
        Ok(())
    }

    fn append_locked(
        &self,
        name: &str,
        certificate_path: &Path,
        key_path: &Path,
        domain: &str,
    ) -> Result<CertificateEntry, RegistryError> {
        Self::validate_name(name)?;
        let certificate_field = certificate_path.to_string_lossy();
        let key_field = key_path.to_string_lossy();
        for field in [&*certificate_field, &*key_field, domain] {
            if field.contains(FIELD_SEPARATOR) || field.contains('\n') {
                return Err(RegistryError::InvalidField(field.to_string()));
            }
        }

        let entry = CertificateEntry {
            name: name.to_string(),
            certificate_path: certificate_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            domain: domain.to_string(),
            created_at: Utc::now(),
            not_after: None,
        };

        if let Some(parent) = self.registry_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.registry_path)?;
        writeln!(file, "{}", entry.to_line())?;
        file.sync_all()?;

        debug!("Registered certificate '{}'", name);
        Ok(entry)
    }

    /// Drop expired entries (deleting their material) and return the rest
    fn sweep_locked(&self, now: DateTime<Utc>) -> Result<Vec<CertificateEntry>, RegistryError> {
        let lines = self.read_lines()?;
        let mut kept_lines = Vec::with_capacity(lines.len());
        let mut active = Vec::new();
        let mut swept = 0usize;
        let mut read_failure = None;

        for line in lines {
            let mut entry = match line {
                RegistryLine::Entry(entry) => entry,
                unparsed => {
                    kept_lines.push(unparsed);
                    continue;
                }
            };

            let expired_at = match read_not_after(&entry.certificate_path) {
                Ok(not_after) if not_after > now => {
                    entry.not_after = Some(not_after);
                    kept_lines.push(RegistryLine::Entry(entry.clone()));
                    active.push(entry);
                    continue;
                }
                Ok(not_after) => {
                    info!(
                        "Sweeping expired certificate '{}' (expired {})",
                        entry.name, not_after
                    );
                    Some(not_after)
                }
                Err(MaterialError::Io(e)) if e.kind() != std::io::ErrorKind::NotFound => {
                    warn!(
                        "Cannot read certificate '{}', keeping it: {}",
                        entry.name, e
                    );
                    kept_lines.push(RegistryLine::Entry(entry));
                    read_failure.get_or_insert(e);
                    continue;
                }
                // Missing or unparseable material counts as expired
                Err(e) => {
                    warn!(
                        "Sweeping certificate '{}' with unreadable material: {}",
                        entry.name, e
                    );
                    None
                }
            };

            match entry.delete_material() {
                Ok(()) => swept += 1,
                Err(MaterialRemoval::Untouched(message)) => {
                    warn!(
                        "Keeping certificate '{}' (expired {:?}), key not deleted: {}",
                        entry.name, expired_at, message
                    );
                    kept_lines.push(RegistryLine::Entry(entry));
                }
                Err(failure) => {
                    warn!(
                        "Swept certificate '{}' but its material was not fully deleted: {}",
                        entry.name,
                        failure.message()
                    );
                    swept += 1;
                }
            }
        }

        if swept > 0 {
            self.write_lines(&kept_lines)?;
        }
        if let Some(e) = read_failure {
            return Err(MaterialError::Io(e).into());
        }

        Ok(active)
    }

    fn read_lines(&self) -> Result<Vec<RegistryLine>, RegistryError> {
        let content = match fs::read_to_string(&self.registry_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| match CertificateEntry::parse_line(line) {
                Some(entry) => RegistryLine::Entry(entry),
                None => {
                    warn!("Keeping unparsable registry line: {}", line);
                    RegistryLine::Unparsed(line.to_string())
                }
            })
            .collect())
    }

    /// Replace the registry through a temporary file and rename
    fn write_lines(&self, lines: &[RegistryLine]) -> Result<(), RegistryError> {
        let mut content = String::new();
        for line in lines {
            match line {
                RegistryLine::Entry(entry) => content.push_str(&entry.to_line()),
                RegistryLine::Unparsed(raw) => content.push_str(raw),
            }
            content.push('\n');
        }

        let tmp_path = self.registry_path.with_extension("tmp");
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &self.registry_path)?;
        Ok(())
    }

    fn lock(&self) -> Result<RegistryLock, RegistryError> {
        if let Some(parent) = self.registry_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.registry_path.with_extension("lock"))?;
        FileExt::lock_exclusive(&file)?;
        Ok(RegistryLock { file })
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_registry() -> (CertificateRegistry, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let registry = CertificateRegistry::new(
            temp_dir.path().join("registry.txt"),
            temp_dir.path().join("certs"),
        );
        (registry, temp_dir)
    }

    #[test]
    fn test_validate_name() {
        assert!(CertificateRegistry::validate_name("shop").is_ok());
        assert!(CertificateRegistry::validate_name("shop-api_2").is_ok());
        assert!(CertificateRegistry::validate_name("").is_err());
        assert!(CertificateRegistry::validate_name("shop/api").is_err());
        assert!(CertificateRegistry::validate_name("shop|api").is_err());
    }

    #[test]
    fn test_validate_domain() {
        assert!(CertificateRegistry::validate_domain("example.com").is_ok());
        assert!(CertificateRegistry::validate_domain("").is_err());
        assert!(CertificateRegistry::validate_domain("bad domain.com").is_err());
        assert!(CertificateRegistry::validate_domain(".example.com").is_err());
        assert!(CertificateRegistry::validate_domain("example.com.").is_err());
    }

    #[test]
    fn test_line_format() {
        let entry = CertificateEntry {
            name: "shop".to_string(),
            certificate_path: PathBuf::from("/etc/appdeploy/certs/shop.crt"),
            key_path: PathBuf::from("/etc/appdeploy/certs/shop.key"),
            domain: "shop.example.com".to_string(),
            created_at: DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
                .unwrap()
                .with_timezone(&Utc),
            not_after: None,
        };

        let line = entry.to_line();
        assert_eq!(
            line,
            "shop|/etc/appdeploy/certs/shop.crt|/etc/appdeploy/certs/shop.key|shop.example.com|2026-01-02T03:04:05+00:00"
        );
        assert_eq!(CertificateEntry::parse_line(&line), Some(entry));
    }

    #[test]
    fn test_parse_line_rejects_short_lines() {
        assert!(CertificateEntry::parse_line("shop|/a|/b").is_none());
        assert!(CertificateEntry::parse_line("|/a|/b|d|2026-01-02T03:04:05Z").is_none());
        assert!(CertificateEntry::parse_line("shop|/a|/b|d|yesterday").is_none());
    }

    #[test]
    fn test_empty_registry_lists_nothing() {
        let (registry, _temp) = create_test_registry();
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_create_and_find() {
        let (registry, _temp) = create_test_registry();

        let created = registry
            .create_self_signed("shop", "shop.example.com", 30)
            .unwrap();
        assert!(created.certificate_path.exists());
        assert!(created.key_path.exists());

        let found = registry.find_by_name("shop").unwrap();
        assert_eq!(found.domain, "shop.example.com");
        assert_eq!(found.certificate_path, created.certificate_path);
        assert!(found.days_until_expiry(Utc::now()).unwrap() >= 29);
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (registry, _temp) = create_test_registry();
        let created = registry.create_self_signed("shop", "localhost", 1).unwrap();

        let mode = fs::metadata(&created.key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_duplicate_active_name_rejected() {
        let (registry, _temp) = create_test_registry();

        registry.create_self_signed("shop", "localhost", 10).unwrap();
        let result = registry.create_self_signed("shop", "localhost", 10);

        assert!(matches!(result, Err(RegistryError::AlreadyExists(_))));
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn test_list_preserves_file_order() {
        let (registry, _temp) = create_test_registry();

        registry.create_self_signed("zeta", "localhost", 10).unwrap();
        registry.create_self_signed("alpha", "localhost", 10).unwrap();
        registry.create_self_signed("mid", "localhost", 10).unwrap();

        let names: Vec<String> = registry
            .list()
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_remove_unknown() {
        let (registry, _temp) = create_test_registry();
        assert!(matches!(
            registry.remove("ghost"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_unparsed_lines_survive_rewrite() {
        let (registry, _temp) = create_test_registry();

        fs::write(registry.registry_path(), "# operator note\n").unwrap();
        registry.create_self_signed("shop", "localhost", 10).unwrap();
        registry.remove("shop").unwrap();

        let content = fs::read_to_string(registry.registry_path()).unwrap();
        assert_eq!(content, "# operator note\n");
    }

    #[test]
    fn test_missing_material_is_swept() {
        let (registry, _temp) = create_test_registry();

        let created = registry.create_self_signed("shop", "localhost", 10).unwrap();
        fs::remove_file(&created.certificate_path).unwrap();

        assert!(registry.list().unwrap().is_empty());
        assert!(!created.key_path.exists());
    }

    #[test]
    fn test_import_copies_material() {
        let (registry, temp) = create_test_registry();

        let generated = generate_self_signed_cert("api.example.com", 5).unwrap();
        let source_cert = temp.path().join("incoming.crt");
        let source_key = temp.path().join("incoming.key");
        fs::write(&source_cert, &generated.pem_cert).unwrap();
        fs::write(&source_key, &generated.pem_key).unwrap();

        let entry = registry
            .import("api", &source_cert, &source_key, "api.example.com")
            .unwrap();

        assert_eq!(entry.certificate_path, registry.cert_root().join("api.crt"));
        assert_eq!(
            fs::read_to_string(&entry.certificate_path).unwrap(),
            generated.pem_cert
        );
        assert!(source_cert.exists());
    }

    #[test]
    fn test_import_rejects_unusable_key() {
        let (registry, temp) = create_test_registry();

        let generated = generate_self_signed_cert("localhost", 5).unwrap();
        let source_cert = temp.path().join("a.crt");
        let source_key = temp.path().join("a.key");
        fs::write(&source_cert, &generated.pem_cert).unwrap();
        fs::write(&source_key, "not a key").unwrap();

        let result = registry.import("broken", &source_cert, &source_key, "localhost");

        assert!(matches!(
            result,
            Err(RegistryError::Material(MaterialError::InvalidKey(_)))
        ));
        assert!(registry.list().unwrap().is_empty());
        assert!(!registry.cert_root().join("broken.crt").exists());
    }
}
