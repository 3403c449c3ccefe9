//! Device Configuration - operator-tunable TOML values for one ELD unit
//!
//! Every tunable the engine consults is a field in this module. Each struct
//! implements `Default` with values matching the constants in
//! [`super::defaults`], so behavior is unchanged when no config file is
//! present.

use super::defaults;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for an ELD device deployment.
///
/// Load with `DeviceConfig::load()` which searches:
/// 1. `$ELDCORE_CONFIG` env var
/// 2. `./device_config.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device / driver identification
    #[serde(default)]
    pub device: DeviceInfo,

    /// HOS jurisdiction profile selection and overrides
    #[serde(default)]
    pub hos: HosConfig,

    /// Telemetry debounce tuning
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Sync queue and transport tuning
    #[serde(default)]
    pub sync: SyncConfig,

    /// Event log retention
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device: DeviceInfo::default(),
            hos: HosConfig::default(),
            telemetry: TelemetryConfig::default(),
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Load configuration using the standard search order:
    /// 1. `$ELDCORE_CONFIG` environment variable
    /// 2. `./device_config.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("ELDCORE_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), device = %config.device.device_id, "Loaded device config from ELDCORE_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from ELDCORE_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "ELDCORE_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("device_config.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(device = %config.device.device_id, "Loaded device config from ./device_config.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./device_config.toml, using defaults");
                }
            }
        }

        info!("No device_config.toml found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: DeviceConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    ///
    /// Regulatory floors are enforced here rather than clamped silently:
    /// an operator config below the retention floor is a deployment error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.retention_days < defaults::RETENTION_FLOOR_DAYS {
            return Err(ConfigError::Invalid(format!(
                "storage.retention_days = {} is below the regulatory floor of {} days",
                self.storage.retention_days,
                defaults::RETENTION_FLOOR_DAYS
            )));
        }
        if self.telemetry.debounce_secs == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.debounce_secs must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.telemetry.min_confidence) {
            return Err(ConfigError::Invalid(format!(
                "telemetry.min_confidence = {} must be within 0.0–1.0",
                self.telemetry.min_confidence
            )));
        }
        if self.sync.batch_byte_budget == 0 || self.sync.critical_batch_byte_budget == 0 {
            return Err(ConfigError::Invalid(
                "sync byte budgets must be non-zero".to_string(),
            ));
        }
        if self.sync.critical_batch_byte_budget > self.sync.batch_byte_budget {
            return Err(ConfigError::Invalid(
                "sync.critical_batch_byte_budget must not exceed sync.batch_byte_budget"
                    .to_string(),
            ));
        }
        if self.sync.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.request_timeout_secs must be at least 1 (unbounded waits are not allowed)"
                    .to_string(),
            ));
        }
        if self.device.home_terminal_offset_minutes.abs() > 14 * 60 {
            return Err(ConfigError::Invalid(format!(
                "device.home_terminal_offset_minutes = {} is outside valid UTC offsets",
                self.device.home_terminal_offset_minutes
            )));
        }
        self.hos.jurisdiction()?;
        Ok(())
    }
}

// ============================================================================
// Device Identification
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique device identifier reported to the backend
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Driver this device session belongs to
    #[serde(default = "default_driver_id")]
    pub driver_id: String,

    /// Vehicle the device is installed in
    #[serde(default = "default_vehicle_id")]
    pub vehicle_id: String,

    /// Home-terminal UTC offset in minutes — HOS day boundaries are
    /// computed in this zone, not device wall clock
    #[serde(default)]
    pub home_terminal_offset_minutes: i32,

    /// Local data directory for sled and archives
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_device_id() -> String {
    "ELD-0001".to_string()
}

fn default_driver_id() -> String {
    "DRIVER-0001".to_string()
}

fn default_vehicle_id() -> String {
    "TRUCK-0001".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("eldcore_data")
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            driver_id: default_driver_id(),
            vehicle_id: default_vehicle_id(),
            home_terminal_offset_minutes: 0,
            data_dir: default_data_dir(),
        }
    }
}

// ============================================================================
// HOS Jurisdiction
// ============================================================================

/// Which rolling-window rule set applies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Jurisdiction {
    /// 60 hours on duty in any 7 consecutive days
    Us60h7d,
    /// 70 hours on duty in any 8 consecutive days
    Us70h8d,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HosConfig {
    /// Jurisdiction profile: "us_60h_7d" or "us_70h_8d"
    #[serde(default = "default_jurisdiction")]
    pub jurisdiction: String,

    /// Daily driving limit override (seconds)
    #[serde(default = "default_max_drive")]
    pub max_daily_drive_secs: u64,

    /// Daily on-duty limit override (seconds)
    #[serde(default = "default_max_duty")]
    pub max_daily_duty_secs: u64,

    /// Cumulative driving before a break is required (seconds)
    #[serde(default = "default_break_after")]
    pub break_required_after_drive_secs: u64,

    /// Minimum qualifying break duration (seconds)
    #[serde(default = "default_break_len")]
    pub qualifying_break_secs: u64,

    /// Contiguous rest that restarts the rolling windows (seconds)
    #[serde(default = "default_restart")]
    pub restart_secs: u64,
}

fn default_jurisdiction() -> String {
    "us_70h_8d".to_string()
}
fn default_max_drive() -> u64 {
    defaults::MAX_DAILY_DRIVE_SECS
}
fn default_max_duty() -> u64 {
    defaults::MAX_DAILY_DUTY_SECS
}
fn default_break_after() -> u64 {
    defaults::BREAK_REQUIRED_AFTER_DRIVE_SECS
}
fn default_break_len() -> u64 {
    defaults::QUALIFYING_BREAK_SECS
}
fn default_restart() -> u64 {
    defaults::RESTART_SECS
}

impl Default for HosConfig {
    fn default() -> Self {
        Self {
            jurisdiction: default_jurisdiction(),
            max_daily_drive_secs: default_max_drive(),
            max_daily_duty_secs: default_max_duty(),
            break_required_after_drive_secs: default_break_after(),
            qualifying_break_secs: default_break_len(),
            restart_secs: default_restart(),
        }
    }
}

impl HosConfig {
    /// Parse the jurisdiction string into the closed enum.
    pub fn jurisdiction(&self) -> Result<Jurisdiction, ConfigError> {
        match self.jurisdiction.as_str() {
            "us_60h_7d" => Ok(Jurisdiction::Us60h7d),
            "us_70h_8d" => Ok(Jurisdiction::Us70h8d),
            other => Err(ConfigError::Invalid(format!(
                "hos.jurisdiction = {:?} (expected \"us_60h_7d\" or \"us_70h_8d\")",
                other
            ))),
        }
    }
}

// ============================================================================
// Telemetry
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Speed above which sustained motion counts as driving (mph)
    #[serde(default = "default_speed_threshold")]
    pub driving_speed_threshold_mph: f64,

    /// Continuous seconds at/over threshold before an auto-switch fires
    #[serde(default = "default_debounce")]
    pub debounce_secs: u64,

    /// Confidence floor below which samples are ignored
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

fn default_speed_threshold() -> f64 {
    defaults::DRIVING_SPEED_THRESHOLD_MPH
}
fn default_debounce() -> u64 {
    defaults::MOTION_DEBOUNCE_SECS
}
fn default_min_confidence() -> f64 {
    defaults::TELEMETRY_MIN_CONFIDENCE
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            driving_speed_threshold_mph: default_speed_threshold(),
            debounce_secs: default_debounce(),
            min_confidence: default_min_confidence(),
        }
    }
}

// ============================================================================
// Sync
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Backend hub URL (empty disables the HTTP transport)
    #[serde(default)]
    pub hub_url: String,

    /// API key for the hub
    #[serde(default)]
    pub api_key: String,

    /// Byte budget per normal batch
    #[serde(default = "default_batch_budget")]
    pub batch_byte_budget: usize,

    /// Byte budget per Critical batch
    #[serde(default = "default_critical_budget")]
    pub critical_batch_byte_budget: usize,

    /// HTTP request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Consecutive failures before surfacing a "sync delayed" warning
    #[serde(default = "default_delay_ceiling")]
    pub delayed_warning_ceiling: u32,
}

fn default_batch_budget() -> usize {
    defaults::BATCH_BYTE_BUDGET
}
fn default_critical_budget() -> usize {
    defaults::CRITICAL_BATCH_BYTE_BUDGET
}
fn default_request_timeout() -> u64 {
    defaults::SYNC_REQUEST_TIMEOUT_SECS
}
fn default_delay_ceiling() -> u32 {
    defaults::SYNC_DELAYED_WARNING_CEILING
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hub_url: String::new(),
            api_key: String::new(),
            batch_byte_budget: default_batch_budget(),
            critical_batch_byte_budget: default_critical_budget(),
            request_timeout_secs: default_request_timeout(),
            delayed_warning_ceiling: default_delay_ceiling(),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// On-device retention before archival (days, >= regulatory floor)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Compaction sweep interval (seconds)
    #[serde(default = "default_compaction_interval")]
    pub compaction_interval_secs: u64,
}

fn default_retention_days() -> u32 {
    defaults::RETENTION_FLOOR_DAYS
}
fn default_compaction_interval() -> u64 {
    defaults::COMPACTION_INTERVAL_SECS
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            compaction_interval_secs: default_compaction_interval(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Config loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
