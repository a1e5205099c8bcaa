/*!
 * Load Order Tests
 * Override resolution, freezing and runtime configuration
 */

use super::common::ScriptedDispatcher;
use personality_kernel::loader::{LoadOrder, LoadOrderError, LoadOrderRegistry};
use personality_kernel::{NtStatus, Runtime, RuntimeConfig};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::thread;

#[test]
fn test_resolution_is_cached_and_reported_once() {
    let registry = LoadOrderRegistry::new();
    registry.parse_overrides("winmm=b,n").unwrap();

    for name in ["winmm", "WINMM.DLL", "c:\\windows\\system32\\winmm.dll"] {
        assert_eq!(registry.get_load_order(name), LoadOrder::BuiltinNative);
    }
    assert_eq!(registry.resolution_reports("winmm"), 1);
    assert_eq!(registry.resolution_reports("ole32"), 0);
}

#[test]
fn test_app_override_rejected_for_module_resolved_before_app_name() {
    let registry = LoadOrderRegistry::new();
    assert_eq!(registry.get_load_order("kernel32"), LoadOrder::Default);
    registry.set_app_name("app.exe").unwrap();

    let err = registry.set_override("app.exe", "kernel32", LoadOrder::Native).unwrap_err();
    assert!(matches!(err, LoadOrderError::AlreadyResolved { ref module } if module.as_str() == "kernel32"));
    assert_eq!(registry.get_load_order("kernel32"), LoadOrder::Default);
}

#[test]
fn test_overrides_frozen_after_resolution() {
    let registry = LoadOrderRegistry::new();
    registry.parse_overrides("d3d11=n").unwrap();
    assert_eq!(registry.get_load_order("d3d11"), LoadOrder::Native);

    let err = registry.parse_overrides("d3d11=b").unwrap_err();
    assert!(matches!(err, LoadOrderError::AlreadyResolved { ref module } if module.as_str() == "d3d11"));
    assert_eq!(registry.get_load_order("d3d11"), LoadOrder::Native);

    // Unresolved modules can still be configured
    assert_eq!(registry.parse_overrides("dxgi=b").unwrap(), 1);
    assert_eq!(registry.get_load_order("dxgi"), LoadOrder::Builtin);
}

#[test]
fn test_app_identity_locks_on_first_resolution() {
    let registry = LoadOrderRegistry::new();
    registry.set_app_name("C:\\Games\\Game.exe").unwrap();
    registry.set_override("game.exe", "xinput1_3", LoadOrder::Native).unwrap();
    assert_eq!(registry.app_name().unwrap().as_str(), "game.exe");

    assert_eq!(registry.get_load_order("xinput1_3.dll"), LoadOrder::Native);

    assert!(matches!(
        registry.set_override("game.exe", "dinput8", LoadOrder::Builtin),
        Err(LoadOrderError::AlreadyLocked { .. })
    ));
    assert!(matches!(
        registry.set_app_name("other.exe"),
        Err(LoadOrderError::AlreadyLocked { .. })
    ));
    registry.set_app_name("game.exe").unwrap();
}

#[test]
fn test_invalid_entries_rejected() {
    let registry = LoadOrderRegistry::new();
    let err = registry.parse_overrides("dsound=x").unwrap_err();
    assert_eq!(NtStatus::from(&err), NtStatus::INVALID_PARAMETER);
    assert!(registry.parse_overrides("missing-equals").is_err());
    assert!(registry
        .set_override("app.exe", "dsound", LoadOrder::Invalid)
        .is_err());
    assert_eq!(registry.get_load_order("dsound"), LoadOrder::Default);
}

#[test]
fn test_concurrent_first_resolution_agrees() {
    let registry = Arc::new(LoadOrderRegistry::new());
    registry.parse_overrides("quartz=n,b").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || registry.get_load_order("quartz"))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), LoadOrder::NativeBuiltin);
    }
    assert_eq!(registry.resolution_reports("quartz"), 1);
}

#[test]
fn test_runtime_applies_configured_overrides() {
    let config = RuntimeConfig::default()
        .with_thread_capacity(2)
        .with_app_name("viewer.exe")
        .with_dll_overrides("gdiplus=n;riched20=");
    let runtime = Runtime::builder(Arc::new(ScriptedDispatcher::default()))
        .with_config(config)
        .build()
        .unwrap();

    let load_order = runtime.load_order();
    assert_eq!(load_order.app_name().unwrap().as_str(), "viewer.exe");
    assert_eq!(load_order.get_load_order("GdiPlus.dll"), LoadOrder::Native);
    assert_eq!(load_order.get_load_order("riched20"), LoadOrder::Disabled);
    assert_eq!(load_order.get_load_order("comdlg32").to_string(), "default");
}

#[test]
fn test_runtime_rejects_bad_overrides() {
    let config = RuntimeConfig::default()
        .with_thread_capacity(2)
        .with_dll_overrides("gdiplus=sideways");
    let err = Runtime::builder(Arc::new(ScriptedDispatcher::default()))
        .with_config(config)
        .build()
        .err()
        .unwrap();
    assert_eq!(err.status(), NtStatus::INVALID_PARAMETER);
}
