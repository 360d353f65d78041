//! End-to-end deployment flows against a temporary host layout
//!
//! systemd and nginx are replaced by in-process fakes. The fake supervisor
//! opens a listener on the unit's port when it starts a unit, so the
//! readiness probe sees a live application.

#![cfg(unix)]

use appdeploy_lib::config::PathSettings;
use appdeploy_lib::lock::AppLock;
use appdeploy_lib::{
    AppState, DeployConfig, DeployError, Deployer, DeploymentRequest, DeploymentState,
    HostingMode, ProxyControl, ProxyError, Supervisor, SupervisorError, UnitFiles, UnitStatus,
    ValidationError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use walkdir::WalkDir;

struct FakeSupervisor {
    units: UnitFiles,
    listen_on_start: AtomicBool,
    calls: Mutex<Vec<String>>,
    running: Mutex<HashMap<String, Option<TcpListener>>>,
}

impl FakeSupervisor {
    fn new(unit_dir: &Path) -> Self {
        Self {
            units: UnitFiles::new(unit_dir),
            listen_on_start: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn daemon_reload(&self) -> Result<(), SupervisorError> {
        self.record("daemon-reload".to_string());
        Ok(())
    }

    async fn enable(&self, unit: &str) -> Result<(), SupervisorError> {
        self.record(format!("enable {}", unit));
        Ok(())
    }

    async fn disable(&self, unit: &str) -> Result<(), SupervisorError> {
        self.record(format!("disable {}", unit));
        Ok(())
    }

    async fn start(&self, unit: &str) -> Result<(), SupervisorError> {
        self.record(format!("start {}", unit));
        let app = unit.trim_end_matches(".service");
        let installed = self
            .units
            .read(app)
            .ok()
            .flatten()
            .ok_or_else(|| SupervisorError::Failed {
                command: format!("start {}", unit),
                output: "Unit not found".to_string(),
            })?;

        let listener = if self.listen_on_start.load(Ordering::SeqCst) {
            Some(
                TcpListener::bind(SocketAddr::new(installed.bind_address, installed.port))
                    .map_err(|e| SupervisorError::Failed {
                        command: format!("start {}", unit),
                        output: e.to_string(),
                    })?,
            )
        } else {
            None
        };
        self.running.lock().unwrap().insert(unit.to_string(), listener);
        Ok(())
    }

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError> {
        self.record(format!("stop {}", unit));
        self.running.lock().unwrap().remove(unit);
        Ok(())
    }

    async fn status(&self, unit: &str) -> Result<UnitStatus, SupervisorError> {
        if self.running.lock().unwrap().contains_key(unit) {
            Ok(UnitStatus::Running)
        } else {
            Ok(UnitStatus::Stopped)
        }
    }

    async fn logs(&self, unit: &str, lines: usize) -> Result<String, SupervisorError> {
        Ok(format!("{} last {} lines\n", unit, lines))
    }
}

#[derive(Default)]
struct FakeProxy {
    reject: AtomicBool,
}

#[async_trait]
impl ProxyControl for FakeProxy {
    async fn check(&self) -> Result<(), ProxyError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(ProxyError::Failed {
                command: "nginx -t".to_string(),
                output: "invalid configuration".to_string(),
            });
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        Ok(())
    }
}

struct Harness {
    temp: TempDir,
    config: DeployConfig,
    supervisor: Arc<FakeSupervisor>,
    proxy: Arc<FakeProxy>,
    deployer: Deployer,
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn harness_with(adjust: impl FnOnce(&mut DeployConfig)) -> Harness {
    let temp = TempDir::new().unwrap();
    let mut config = DeployConfig::default();
    config.paths = PathSettings::under(temp.path());
    config.runtime.normalize_ownership = false;
    config.probe.timeout_ms = 2_000;
    adjust(&mut config);

    // Stock distribution default site
    let layout = config.route_layout();
    fs::create_dir_all(&layout.sites_available).unwrap();
    fs::create_dir_all(&layout.sites_enabled).unwrap();
    let default_site = layout.sites_available.join("default");
    fs::write(&default_site, "server { listen 80 default_server; }\n").unwrap();
    std::os::unix::fs::symlink(&default_site, layout.sites_enabled.join("default")).unwrap();

    let supervisor = Arc::new(FakeSupervisor::new(&config.paths.unit_dir));
    let proxy = Arc::new(FakeProxy::default());
    let deployer = Deployer::new(config.clone(), supervisor.clone(), proxy.clone());

    Harness {
        temp,
        config,
        supervisor,
        proxy,
        deployer,
    }
}

/// A published managed application
fn bundle(root: &Path, dir: &str, assembly: &str, contents: &[u8]) -> PathBuf {
    let source = root.join(dir);
    fs::create_dir_all(source.join("wwwroot")).unwrap();
    fs::write(source.join(format!("{}.dll", assembly)), contents).unwrap();
    fs::write(
        source.join(format!("{}.runtimeconfig.json", assembly)),
        b"{\"runtimeOptions\":{}}",
    )
    .unwrap();
    fs::write(source.join("wwwroot").join("index.html"), b"<h1>hello</h1>").unwrap();
    source
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Every path under a directory, sorted
fn snapshot(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();
    paths
}

#[tokio::test]
async fn test_deploy_then_status() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    let port = free_port();

    let report = h
        .deployer
        .deploy(DeploymentRequest::new("foo", &source, port))
        .await
        .unwrap();

    assert!(report.verified);
    assert!(report.backup.is_none());
    assert_eq!(report.final_state(), DeploymentState::Verified);
    assert_eq!(report.route, "/");
    assert_eq!(report.url, format!("http://127.0.0.1:{}", port));
    assert_eq!(
        report.states,
        vec![
            DeploymentState::Requested,
            DeploymentState::Validated,
            DeploymentState::BackedUp,
            DeploymentState::Staged,
            DeploymentState::UnitCreated,
            DeploymentState::RouteActive,
            DeploymentState::Started,
            DeploymentState::Verified,
        ]
    );

    assert_eq!(
        h.supervisor.calls(),
        vec!["daemon-reload", "enable foo.service", "start foo.service"]
    );
    assert_eq!(
        fs::read(h.config.paths.apps_root.join("foo").join("Foo.dll")).unwrap(),
        b"v1"
    );

    let status = h.deployer.status_query().status("foo").await.unwrap();
    assert_eq!(status.state, AppState::Running);
    assert_eq!(status.port, Some(port));
    assert_eq!(status.route.as_deref(), Some("/"));
    assert_eq!(status.mode, Some(HostingMode::Direct));

    let listed = h.deployer.status_query().list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "foo");
}

#[tokio::test]
async fn test_subdirectory_deployment() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Shop", b"v1");

    let report = h
        .deployer
        .deploy(DeploymentRequest::new("shop", &source, free_port()).with_subdirectory("/store//front/"))
        .await
        .unwrap();

    assert_eq!(report.route, "/store/front/");
    let status = h.deployer.status_query().status("shop").await.unwrap();
    assert_eq!(
        status.mode,
        Some(HostingMode::Subdirectory("store/front".to_string()))
    );

    // The stock default site stays enabled for subdirectory hosting
    let layout = h.config.route_layout();
    assert!(fs::symlink_metadata(layout.sites_enabled.join("default")).is_ok());
}

#[tokio::test]
async fn test_redeploy_takes_one_identical_backup() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    let port = free_port();

    h.deployer
        .deploy(DeploymentRequest::new("foo", &source, port))
        .await
        .unwrap();
    let deployed = h.config.paths.apps_root.join("foo");
    let before: Vec<(PathBuf, Vec<u8>)> = snapshot(&deployed)
        .into_iter()
        .filter(|path| path.is_file())
        .map(|path| {
            let bytes = fs::read(&path).unwrap();
            (path.strip_prefix(&deployed).unwrap().to_path_buf(), bytes)
        })
        .collect();

    fs::write(source.join("Foo.dll"), b"v2").unwrap();
    let report = h
        .deployer
        .deploy(DeploymentRequest::new("foo", &source, port))
        .await
        .unwrap();

    let backups = h.deployer.backups().list("foo").unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(report.backup.as_ref(), Some(&backups[0]));

    for (relative, bytes) in before {
        assert_eq!(fs::read(backups[0].join(&relative)).unwrap(), bytes);
    }
    assert_eq!(fs::read(deployed.join("Foo.dll")).unwrap(), b"v2");

    // The previous instance is stopped only once the new unit is installed
    let calls = h.supervisor.calls();
    let stop = calls.iter().position(|c| c == "stop foo.service").unwrap();
    let last_enable = calls.iter().rposition(|c| c == "enable foo.service").unwrap();
    let last_start = calls.iter().rposition(|c| c == "start foo.service").unwrap();
    assert!(last_enable < stop && stop < last_start);
}

#[tokio::test]
async fn test_redeploy_then_remove() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    let port = free_port();

    h.deployer
        .deploy(DeploymentRequest::new("foo", &source, port))
        .await
        .unwrap();
    h.deployer
        .deploy(DeploymentRequest::new("foo", &source, port))
        .await
        .unwrap();

    let removal = h.deployer.remove("foo").await.unwrap();
    assert!(removal.is_complete(), "{:?}", removal.failures);

    let removed: Vec<PathBuf> = h
        .deployer
        .backups()
        .list("foo")
        .unwrap()
        .into_iter()
        .filter(|path| {
            path.file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("foo-removed-")
        })
        .collect();
    assert_eq!(removed.len(), 1);
    assert_eq!(removal.backup.as_ref(), Some(&removed[0]));
    assert_eq!(fs::read(removed[0].join("Foo.dll")).unwrap(), b"v1");

    let layout = h.config.route_layout();
    assert!(!h.config.paths.unit_dir.join("foo.service").exists());
    assert!(fs::symlink_metadata(layout.sites_enabled.join("foo")).is_err());
    assert!(!layout.sites_available.join("foo").exists());
    assert!(!h.config.paths.apps_root.join("foo").exists());

    assert!(h.deployer.status_query().list().await.unwrap().is_empty());
    assert!(matches!(
        h.deployer.status_query().status("foo").await,
        Err(DeployError::NotDeployed(_))
    ));

    let calls = h.supervisor.calls();
    assert!(calls.contains(&"disable foo.service".to_string()));
}

#[tokio::test]
async fn test_remove_unknown_application() {
    let h = harness();

    assert!(matches!(
        h.deployer.remove("ghost").await,
        Err(DeployError::NotDeployed(_))
    ));
    assert!(h.deployer.backups().list("ghost").unwrap().is_empty());
}

#[tokio::test]
async fn test_route_failure_leaves_unit_unstarted() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    h.proxy.reject.store(true, Ordering::SeqCst);

    let failure = h
        .deployer
        .deploy(DeploymentRequest::new("foo", &source, free_port()))
        .await
        .unwrap_err();

    assert_eq!(failure.last_state, DeploymentState::UnitCreated);
    assert_eq!(failure.states.last(), Some(&DeploymentState::Failed));
    assert!(matches!(failure.error, DeployError::Route(_)));

    assert!(h.config.paths.unit_dir.join("foo.service").exists());
    assert!(h.supervisor.calls().contains(&"enable foo.service".to_string()));
    assert!(!h
        .supervisor
        .calls()
        .iter()
        .any(|call| call.starts_with("start")));

    let status = h.deployer.status_query().status("foo").await.unwrap();
    assert_eq!(status.state, AppState::Stopped);
    assert!(status.route.is_none());
}

#[tokio::test]
async fn test_validation_failures_change_nothing() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    let before = snapshot(h.temp.path());

    let empty = h.temp.path().join("empty");
    fs::create_dir_all(&empty).unwrap();
    fs::write(empty.join("readme.txt"), b"nothing to run").unwrap();
    let before_with_empty = snapshot(h.temp.path());
    assert!(before_with_empty.len() > before.len());

    let cases = vec![
        (
            DeploymentRequest::new("bad name", &source, free_port()),
            ValidationError::InvalidName("bad name".to_string()),
        ),
        (
            DeploymentRequest::new("foo", &source, 80),
            ValidationError::PortOutOfRange(80),
        ),
        (
            DeploymentRequest::new("foo", &empty, free_port()),
            ValidationError::NoRuntimeArtifact(empty.clone()),
        ),
        (
            DeploymentRequest::new("foo", &source, free_port()).with_subdirectory("//"),
            ValidationError::EmptySubdirectory,
        ),
        (
            DeploymentRequest::new("foo", &source, free_port()).with_tls("missing"),
            ValidationError::CertificateNotFound("missing".to_string()),
        ),
    ];

    for (request, expected) in cases {
        let failure = h.deployer.deploy(request).await.unwrap_err();
        assert!(failure.is_validation());
        assert_eq!(failure.last_state, DeploymentState::Requested);
        match failure.error {
            DeployError::Validation(actual) => assert_eq!(actual, expected),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    let after: Vec<PathBuf> = snapshot(h.temp.path())
        .into_iter()
        .filter(|path| !path.starts_with(&h.config.paths.state_dir))
        .collect();
    let expected: Vec<PathBuf> = before_with_empty
        .into_iter()
        .filter(|path| !path.starts_with(&h.config.paths.state_dir))
        .collect();
    assert_eq!(after, expected);
    assert!(h.supervisor.calls().is_empty());
}

#[tokio::test]
async fn test_port_claimed_by_another_application() {
    let h = harness();
    let port = free_port();
    let foo = bundle(h.temp.path(), "foo-publish", "Foo", b"foo");
    let bar = bundle(h.temp.path(), "bar-publish", "Bar", b"bar");

    h.deployer
        .deploy(DeploymentRequest::new("foo", &foo, port))
        .await
        .unwrap();
    let failure = h
        .deployer
        .deploy(DeploymentRequest::new("bar", &bar, port))
        .await
        .unwrap_err();

    match failure.error {
        DeployError::Validation(ValidationError::PortInUse { port: p, holder }) => {
            assert_eq!(p, port);
            assert_eq!(holder.as_deref(), Some("foo"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!h.config.paths.apps_root.join("bar").exists());
}

#[tokio::test]
async fn test_port_held_by_foreign_process() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    let squatter = TcpListener::bind("0.0.0.0:0").unwrap();
    let port = squatter.local_addr().unwrap().port();

    let failure = h
        .deployer
        .deploy(DeploymentRequest::new("foo", &source, port))
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        DeployError::Validation(ValidationError::PortInUse { holder: None, .. })
    ));
}

#[tokio::test]
async fn test_unverified_deployment_is_a_warning() {
    let h = harness_with(|config| config.probe.timeout_ms = 200);
    h.supervisor.listen_on_start.store(false, Ordering::SeqCst);
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");

    let report = h
        .deployer
        .deploy(DeploymentRequest::new("foo", &source, free_port()))
        .await
        .unwrap();

    assert!(!report.verified);
    assert_eq!(report.final_state(), DeploymentState::Started);
    assert!(report
        .warnings
        .iter()
        .any(|warning| warning.contains("unverified")));
}

#[tokio::test]
async fn test_concurrent_operation_is_busy() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    let _held = AppLock::acquire(&h.config.paths.state_dir, "foo").unwrap();

    let failure = h
        .deployer
        .deploy(DeploymentRequest::new("foo", &source, free_port()))
        .await
        .unwrap_err();

    assert!(matches!(failure.error, DeployError::Busy(_)));
    assert!(!h.config.paths.apps_root.join("foo").exists());
}

#[tokio::test]
async fn test_direct_tls_deployment() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    h.deployer
        .registry()
        .create_self_signed("foo-cert", "localhost", 30)
        .unwrap();

    let report = h
        .deployer
        .deploy(DeploymentRequest::new("foo", &source, free_port()).with_tls("foo-cert"))
        .await
        .unwrap();

    assert!(report.url.starts_with("https://"));
    let unit = fs::read_to_string(h.config.paths.unit_dir.join("foo.service")).unwrap();
    assert!(unit.contains("ASPNETCORE_Kestrel__Certificates__Default__Path="));

    let route = fs::read_to_string(h.config.route_layout().sites_available.join("foo")).unwrap();
    assert!(route.contains("proxy_pass https://127.0.0.1:"));

    let status = h.deployer.status_query().status("foo").await.unwrap();
    assert_eq!(status.certificate.as_deref(), Some("foo-cert"));
    assert_eq!(h.deployer.certificate_users("foo-cert").unwrap(), vec!["foo"]);
}

#[tokio::test]
async fn test_certificate_without_tls_rejected() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    let mut request = DeploymentRequest::new("foo", &source, free_port());
    request.certificate = Some("foo-cert".to_string());

    let failure = h.deployer.deploy(request).await.unwrap_err();
    assert!(matches!(
        failure.error,
        DeployError::Validation(ValidationError::CertificateWithoutTls)
    ));
}

#[tokio::test]
async fn test_restart_and_logs() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    h.deployer
        .deploy(DeploymentRequest::new("foo", &source, free_port()))
        .await
        .unwrap();

    assert!(h.deployer.restart("foo").await.unwrap());
    let calls = h.supervisor.calls();
    assert_eq!(
        &calls[calls.len() - 2..],
        &["stop foo.service".to_string(), "start foo.service".to_string()]
    );

    let logs = h.deployer.logs("foo", 50).await.unwrap();
    assert_eq!(logs, "foo.service last 50 lines\n");

    assert!(matches!(
        h.deployer.restart("ghost").await,
        Err(DeployError::NotDeployed(_))
    ));
}

#[tokio::test]
async fn test_unconfigured_application() {
    let h = harness();
    fs::create_dir_all(h.config.paths.apps_root.join("orphan")).unwrap();

    let status = h.deployer.status_query().status("orphan").await.unwrap();
    assert_eq!(status.state, AppState::Unconfigured);
    assert!(status.port.is_none());
}

#[tokio::test]
async fn test_site_rename_retires_previous_route() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    let port = free_port();

    h.deployer
        .deploy(DeploymentRequest::new("foo", &source, port))
        .await
        .unwrap();
    h.deployer
        .deploy(DeploymentRequest::new("foo", &source, port).with_site_name("public"))
        .await
        .unwrap();

    let layout = h.config.route_layout();
    assert!(layout.sites_available.join("public").exists());
    assert!(!layout.sites_available.join("foo").exists());

    let status = h.deployer.status_query().status("foo").await.unwrap();
    assert_eq!(status.route.as_deref(), Some("/"));
}

fn validation_error(failure: appdeploy_lib::DeploymentFailure) -> ValidationError {
    assert!(failure.is_validation());
    match failure.error {
        DeployError::Validation(error) => error,
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_reserved_site_names_are_rejected() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    let layout = h.config.route_layout();
    let stock = fs::read(layout.sites_available.join("default")).unwrap();

    let failure = h
        .deployer
        .deploy(DeploymentRequest::new("default", &source, free_port()))
        .await
        .unwrap_err();
    assert_eq!(
        validation_error(failure),
        ValidationError::ReservedSiteName("default".to_string())
    );

    let failure = h
        .deployer
        .deploy(
            DeploymentRequest::new("foo", &source, free_port())
                .with_site_name(layout.host_site.clone()),
        )
        .await
        .unwrap_err();
    assert_eq!(
        validation_error(failure),
        ValidationError::ReservedSiteName(layout.host_site.clone())
    );

    assert_eq!(fs::read(layout.sites_available.join("default")).unwrap(), stock);
    assert!(fs::symlink_metadata(layout.sites_enabled.join("default")).is_ok());
    assert!(h.supervisor.calls().is_empty());
}

#[tokio::test]
async fn test_site_routed_for_another_application_is_rejected() {
    let h = harness();
    let foo = bundle(h.temp.path(), "foo-publish", "Foo", b"foo");
    let bar = bundle(h.temp.path(), "bar-publish", "Bar", b"bar");

    h.deployer
        .deploy(DeploymentRequest::new("foo", &foo, free_port()))
        .await
        .unwrap();
    let failure = h
        .deployer
        .deploy(DeploymentRequest::new("bar", &bar, free_port()).with_site_name("foo"))
        .await
        .unwrap_err();

    assert_eq!(
        validation_error(failure),
        ValidationError::SiteInUse {
            site: "foo".to_string(),
            holder: "foo".to_string(),
        }
    );
    assert!(!h.config.paths.apps_root.join("bar").exists());
    let status = h.deployer.status_query().status("foo").await.unwrap();
    assert_eq!(status.route.as_deref(), Some("/"));
}

#[tokio::test]
async fn test_foreign_site_definition_is_rejected() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Legacy", b"v1");
    let layout = h.config.route_layout();
    let legacy = layout.sites_available.join("legacy");
    fs::write(&legacy, "server { listen 8080; }\n").unwrap();

    let failure = h
        .deployer
        .deploy(DeploymentRequest::new("legacy", &source, free_port()))
        .await
        .unwrap_err();

    assert_eq!(validation_error(failure), ValidationError::ForeignSite(legacy.clone()));
    assert_eq!(
        fs::read_to_string(&legacy).unwrap(),
        "server { listen 8080; }\n"
    );
    assert!(!h.config.paths.apps_root.join("legacy").exists());
    assert!(matches!(
        h.deployer.remove("legacy").await,
        Err(DeployError::NotDeployed(_))
    ));
    assert!(legacy.exists());
}

#[tokio::test]
async fn test_foreign_unit_is_never_overwritten() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Nginx", b"v1");
    fs::create_dir_all(&h.config.paths.unit_dir).unwrap();
    let system_unit = h.config.paths.unit_dir.join("nginx.service");
    let foreign = "[Unit]\nDescription=A high performance web server\n";
    fs::write(&system_unit, foreign).unwrap();

    let failure = h
        .deployer
        .deploy(DeploymentRequest::new("nginx", &source, free_port()))
        .await
        .unwrap_err();
    assert_eq!(
        validation_error(failure),
        ValidationError::ForeignUnit(system_unit.clone())
    );

    assert!(matches!(
        h.deployer.remove("nginx").await,
        Err(DeployError::NotDeployed(_))
    ));
    assert!(matches!(
        h.deployer.logs("nginx", 10).await,
        Err(DeployError::NotDeployed(_))
    ));
    assert_eq!(fs::read_to_string(&system_unit).unwrap(), foreign);
    assert!(h.supervisor.calls().is_empty());
}

#[tokio::test]
async fn test_second_direct_application_takes_over_root() {
    let h = harness();
    let foo = bundle(h.temp.path(), "foo-publish", "Foo", b"foo");
    let bar = bundle(h.temp.path(), "bar-publish", "Bar", b"bar");

    h.deployer
        .deploy(DeploymentRequest::new("foo", &foo, free_port()))
        .await
        .unwrap();
    h.deployer
        .deploy(DeploymentRequest::new("bar", &bar, free_port()))
        .await
        .unwrap();

    let layout = h.config.route_layout();
    let default_servers: Vec<String> = fs::read_dir(&layout.sites_enabled)
        .unwrap()
        .filter_map(|entry| {
            let entry = entry.unwrap();
            let content = fs::read_to_string(entry.path()).ok()?;
            content
                .contains("default_server")
                .then(|| entry.file_name().to_string_lossy().into_owned())
        })
        .collect();
    assert_eq!(default_servers, vec!["bar".to_string()]);

    let foo_status = h.deployer.status_query().status("foo").await.unwrap();
    assert!(foo_status.route.is_none());
    let bar_status = h.deployer.status_query().status("bar").await.unwrap();
    assert_eq!(bar_status.route.as_deref(), Some("/"));
}

#[tokio::test]
async fn test_failed_redeploy_keeps_previous_instance_running() {
    let h = harness();
    let source = bundle(h.temp.path(), "publish", "Foo", b"v1");
    let port = free_port();

    h.deployer
        .deploy(DeploymentRequest::new("foo", &source, port))
        .await
        .unwrap();

    h.proxy.reject.store(true, Ordering::SeqCst);
    fs::write(source.join("Foo.dll"), b"v2").unwrap();
    let failure = h
        .deployer
        .deploy(DeploymentRequest::new("foo", &source, port))
        .await
        .unwrap_err();

    assert_eq!(failure.last_state, DeploymentState::UnitCreated);
    assert!(matches!(failure.error, DeployError::Route(_)));
    assert!(!h.supervisor.calls().contains(&"stop foo.service".to_string()));

    let status = h.deployer.status_query().status("foo").await.unwrap();
    assert_eq!(status.state, AppState::Running);
    assert_eq!(status.route.as_deref(), Some("/"));
    assert_eq!(status.port, Some(port));
}
