use appdeploy_cli::config::{ConfigManager, ConfigSource};
use appdeploy_lib::DeployConfig;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_environment_beats_system_and_user_files() {
    let dir = TempDir::new().unwrap();
    let system = dir.path().join("system.yml");
    let user = dir.path().join("user.yml");
    let from_env = dir.path().join("env.yml");
    for path in [&system, &user, &from_env] {
        fs::write(path, "").unwrap();
    }

    let source = ConfigManager::locate_with(None, Some(from_env.clone()), &system, Some(user));

    assert_eq!(source, ConfigSource::Environment(from_env));
}

#[test]
fn test_system_file_beats_user_file() {
    let dir = TempDir::new().unwrap();
    let system = dir.path().join("system.yml");
    let user = dir.path().join("user.yml");
    fs::write(&system, "").unwrap();
    fs::write(&user, "").unwrap();

    let source = ConfigManager::locate_with(None, None, &system, Some(user));

    assert_eq!(source, ConfigSource::System(system));
}

#[test]
fn test_user_file_used_when_system_missing() {
    let dir = TempDir::new().unwrap();
    let system = dir.path().join("missing.yml");
    let user = dir.path().join("user.yml");
    fs::write(&user, "").unwrap();

    let source = ConfigManager::locate_with(None, None, &system, Some(user.clone()));

    assert_eq!(source, ConfigSource::User(user));
}

#[test]
fn test_defaults_when_nothing_exists() {
    let dir = TempDir::new().unwrap();

    let source = ConfigManager::locate_with(
        None,
        None,
        &dir.path().join("system.yml"),
        Some(dir.path().join("user.yml")),
    );

    assert_eq!(source, ConfigSource::Defaults);
    assert_eq!(source.path(), None);
}

#[test]
fn test_missing_explicit_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.yml");

    let source = ConfigManager::locate_with(Some(&missing), None, &missing, None);
    let err = ConfigManager::load_from(&source).unwrap_err();

    assert!(format!("{:#}", err).contains("nope.yml"));
}

#[test]
fn test_partial_file_keeps_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yml");
    fs::write(&path, "proxy:\n  listen_port: 8080\n").unwrap();

    let config = ConfigManager::load_from(&ConfigSource::Explicit(path)).unwrap();

    assert_eq!(config.proxy.listen_port, 8080);
    assert_eq!(config.paths, DeployConfig::default().paths);
}

#[test]
fn test_template_written_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("etc").join("config.yml");

    ConfigManager::write_template(&path, false).unwrap();
    let written = fs::read_to_string(&path).unwrap();
    assert_eq!(DeployConfig::parse(&written).unwrap(), DeployConfig::default());

    assert!(ConfigManager::write_template(&path, false).is_err());
    ConfigManager::write_template(&path, true).unwrap();
}
