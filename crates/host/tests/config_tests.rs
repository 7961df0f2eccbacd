//! Configuration file tests
//!
//! Loads, saves and validates `host.toml` files on disk.

use common::ClassId;
use host::HostConfig;
use host::config::expand_path;
use host::usb::{ClassTable, DeviceKind};
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;

const CUSTOM_CONFIG: &str = r#"
[host]
log_level = "debug"
instance_name = "tuner-host"
runtime_dir = "/tmp/tuner-host"

[idle]
enabled = false
poll_interval_secs = 10
threshold = 6

[servers.control]
bind_addr = "0.0.0.0:50000"

[servers.streaming]
bind_addr = "0.0.0.0:50001"

[[classes]]
kind = "px4"
usb_id = "0x0511:0x083f"

[[classes]]
kind = "PX-MLT"
class_id = "{0511024E-7573-6264-8000-000000000000}"

[classes.config]
tuners = 5
interface = 1

[[classes]]
kind = "isdb6014"
usb_id = "0x0511:0x0045"
"#;

#[test]
fn test_load_custom_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host.toml");
    fs::write(&path, CUSTOM_CONFIG).unwrap();

    let config = HostConfig::load(Some(path)).unwrap();
    assert_eq!(config.host.log_level, "debug");
    assert_eq!(config.host.instance_name, "tuner-host");
    assert!(!config.idle.enabled);
    assert_eq!(config.servers.streaming.bind_addr, "0.0.0.0:50001");
    assert_eq!(config.classes.len(), 3);

    let table = ClassTable::from_definitions(config.class_definitions());
    assert_eq!(table.len(), 2);

    let mlt = table.get(&ClassId::from_usb_ids(0x0511, 0x024e)).unwrap();
    assert_eq!(mlt.kind, DeviceKind::PxMlt);
    assert_eq!(
        mlt.config.get("interface").and_then(|v| v.as_integer()),
        Some(1)
    );

    let settings = config.supervisor_settings();
    assert_eq!(settings.runtime_dir, PathBuf::from("/tmp/tuner-host"));
    assert_eq!(settings.idle_threshold, 6);
    assert!(!settings.idle_shutdown);
}

#[test]
fn test_duplicate_classes_last_wins() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host.toml");
    fs::write(
        &path,
        r#"
[[classes]]
kind = "px4"
usb_id = "0x0511:0x024e"

[[classes]]
kind = "pxmlt"
usb_id = "0x0511:0x024E"
"#,
    )
    .unwrap();

    let config = HostConfig::load(Some(path)).unwrap();
    let table = ClassTable::from_definitions(config.class_definitions());
    assert_eq!(table.len(), 1);
    assert_eq!(
        table.get(&ClassId::from_usb_ids(0x0511, 0x024e)).unwrap().kind,
        DeviceKind::PxMlt
    );
}

#[test]
fn test_load_rejects_invalid_file() {
    let dir = tempdir().unwrap();

    let path = dir.path().join("bad-level.toml");
    fs::write(&path, "[host]\nlog_level = \"loud\"\n").unwrap();
    assert!(HostConfig::load(Some(path)).is_err());

    let path = dir.path().join("bad-id.toml");
    fs::write(&path, "[[classes]]\nkind = \"px4\"\nusb_id = \"511:83f\"\n").unwrap();
    assert!(HostConfig::load(Some(path)).is_err());

    let path = dir.path().join("no-id.toml");
    fs::write(&path, "[[classes]]\nkind = \"px4\"\n").unwrap();
    assert!(HostConfig::load(Some(path)).is_err());

    let path = dir.path().join("syntax.toml");
    fs::write(&path, "[host\n").unwrap();
    assert!(HostConfig::load(Some(path)).is_err());

    assert!(HostConfig::load(Some(dir.path().join("missing.toml"))).is_err());
}

#[test]
fn test_save_then_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("host.toml");

    let mut config = HostConfig::default();
    config.host.instance_name = "saved-host".to_string();
    config.save(&path).unwrap();

    let loaded = HostConfig::load(Some(path)).unwrap();
    assert_eq!(loaded.host.instance_name, "saved-host");
    assert_eq!(loaded.class_definitions(), config.class_definitions());
}

#[test]
fn test_empty_file_uses_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host.toml");
    fs::write(&path, "").unwrap();

    let config = HostConfig::load(Some(path)).unwrap();
    assert_eq!(config.idle.poll_interval_secs, 5);
    assert_eq!(config.idle.threshold, 3);
    assert_eq!(config.class_definitions().len(), 6);
}

#[test]
fn test_expand_path_tilde() {
    let Some(home) = dirs::home_dir() else {
        return;
    };
    assert_eq!(expand_path("~/host.toml"), home.join("host.toml"));
    assert_eq!(expand_path("/etc/host.toml"), PathBuf::from("/etc/host.toml"));
}
