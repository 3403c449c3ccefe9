//! Device config loading and validation tests.

use eldcore::config::{ConfigError, DeviceConfig};
use eldcore::hos::HosProfile;
use std::io::Write;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn minimal_config_fills_defaults() {
    let file = write_config(
        r#"
[device]
device_id = "ELD-42"
driver_id = "D-42"
vehicle_id = "T-42"
"#,
    );
    let config = DeviceConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.device.device_id, "ELD-42");
    // Untouched sections keep built-in defaults
    assert_eq!(config.hos.max_daily_drive_secs, 11 * 3600);
    assert_eq!(config.telemetry.debounce_secs, 60);
    assert_eq!(config.storage.retention_days, 180);
}

#[test]
fn jurisdiction_selects_rolling_profile() {
    let file = write_config(
        r#"
[hos]
jurisdiction = "us_60h_7d"
"#,
    );
    let config = DeviceConfig::load_from_file(file.path()).unwrap();
    let profile = HosProfile::from_config(&config.hos).unwrap();

    assert_eq!(profile.rolling_window_days, 7);
    assert_eq!(profile.rolling_cap_secs, 60 * 3600);

    // Default profile is 70h/8d
    let default_profile = HosProfile::from_config(&DeviceConfig::default().hos).unwrap();
    assert_eq!(default_profile.rolling_window_days, 8);
    assert_eq!(default_profile.rolling_cap_secs, 70 * 3600);
}

#[test]
fn unknown_jurisdiction_is_rejected() {
    let file = write_config(
        r#"
[hos]
jurisdiction = "eu_weekly"
"#,
    );
    let err = DeviceConfig::load_from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn retention_below_regulatory_floor_is_rejected() {
    let file = write_config(
        r#"
[storage]
retention_days = 90
"#,
    );
    let err = DeviceConfig::load_from_file(file.path()).unwrap_err();
    match err {
        ConfigError::Invalid(msg) => assert!(msg.contains("180")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn zero_timeout_is_rejected() {
    let file = write_config(
        r#"
[sync]
request_timeout_secs = 0
"#,
    );
    assert!(DeviceConfig::load_from_file(file.path()).is_err());
}

#[test]
fn critical_budget_cannot_exceed_normal_budget() {
    let file = write_config(
        r#"
[sync]
batch_byte_budget = 1024
critical_batch_byte_budget = 4096
"#,
    );
    assert!(DeviceConfig::load_from_file(file.path()).is_err());
}

#[test]
fn malformed_toml_reports_parse_error() {
    let file = write_config("[device\ndevice_id = ");
    let err = DeviceConfig::load_from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_, _)));
}

#[test]
fn absurd_home_terminal_offset_is_rejected() {
    let file = write_config(
        r#"
[device]
home_terminal_offset_minutes = 2000
"#,
    );
    assert!(DeviceConfig::load_from_file(file.path()).is_err());
}
