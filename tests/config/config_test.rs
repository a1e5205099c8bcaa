/*!
 * Configuration Tests
 * JSON files, process environment and runtime wiring
 */

use personality_kernel::core::config::{env, ConfigError};
use personality_kernel::core::limits::DEFAULT_THREAD_CAPACITY;
use personality_kernel::RuntimeConfig;
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

const ALL_VARS: [&str; 5] = [
    env::THREAD_CAPACITY,
    env::LARGE_ADDRESS_AWARE,
    env::XSTATE_COMPACTION,
    env::DLL_OVERRIDES,
    env::APP_NAME,
];

fn clear_env() {
    for key in ALL_VARS {
        std::env::remove_var(key);
    }
}

fn write_config(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_from_file_full() {
    let file = write_config(
        r#"{
            "thread_capacity": 16,
            "large_address_aware": true,
            "xstate_compaction": true,
            "dll_overrides": "d3d9=n,b",
            "app_name": "game.exe"
        }"#,
    );
    let config = RuntimeConfig::from_file(file.path()).unwrap();
    assert_eq!(
        config,
        RuntimeConfig::default()
            .with_thread_capacity(16)
            .with_large_address_aware(true)
            .with_xstate_compaction(true)
            .with_dll_overrides("d3d9=n,b")
            .with_app_name("game.exe")
    );
}

#[test]
fn test_from_file_partial_uses_defaults() {
    let file = write_config(r#"{ "large_address_aware": true }"#);
    let config = RuntimeConfig::from_file(file.path()).unwrap();
    assert_eq!(config.thread_capacity, DEFAULT_THREAD_CAPACITY);
    assert!(config.large_address_aware);
    assert_eq!(config.dll_overrides, None);
}

#[test]
fn test_from_file_errors() {
    let file = write_config("{ not json");
    assert!(matches!(
        RuntimeConfig::from_file(file.path()),
        Err(ConfigError::Parse(_))
    ));

    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        RuntimeConfig::from_file(dir.path().join("missing.json")),
        Err(ConfigError::Io(_))
    ));
}

#[test]
fn test_config_serializes_back() {
    let config = RuntimeConfig::default().with_app_name("tool.exe");
    let text = serde_json::to_string(&config).unwrap();
    let file = write_config(&text);
    assert_eq!(RuntimeConfig::from_file(file.path()).unwrap(), config);
}

#[test]
#[serial]
fn test_from_env() {
    clear_env();
    std::env::set_var(env::THREAD_CAPACITY, "12");
    std::env::set_var(env::LARGE_ADDRESS_AWARE, "on");
    std::env::set_var(env::DLL_OVERRIDES, "");
    std::env::set_var(env::APP_NAME, "setup.exe");

    let config = RuntimeConfig::from_env().unwrap();
    clear_env();

    assert_eq!(config.thread_capacity, 12);
    assert!(config.large_address_aware);
    assert!(!config.xstate_compaction);
    assert_eq!(config.dll_overrides, None);
    assert_eq!(config.app_name.as_deref(), Some("setup.exe"));
}

#[test]
#[serial]
fn test_from_env_rejects_bad_capacity() {
    clear_env();
    std::env::set_var(env::THREAD_CAPACITY, "lots");
    let result = RuntimeConfig::from_env();
    clear_env();

    match result {
        Err(ConfigError::InvalidValue { key, value }) => {
            assert_eq!(key, env::THREAD_CAPACITY);
            assert_eq!(value, "lots");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
#[serial]
fn test_empty_environment_is_default() {
    clear_env();
    assert_eq!(RuntimeConfig::from_env().unwrap(), RuntimeConfig::default());
}
