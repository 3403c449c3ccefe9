//! Device Configuration Module
//!
//! Per-device configuration loaded from TOML files, replacing hardcoded
//! thresholds with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `ELDCORE_CONFIG` environment variable (path to TOML file)
//! 2. `device_config.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(DeviceConfig::load());
//!
//! // Anywhere in the codebase:
//! let debounce = config::get().telemetry.debounce_secs;
//! ```

mod device_config;
pub mod defaults;

pub use device_config::*;

use std::sync::OnceLock;

/// Global device configuration, initialized once at startup.
static DEVICE_CONFIG: OnceLock<DeviceConfig> = OnceLock::new();

/// Initialize the global device configuration.
///
/// Must be called exactly once before any calls to `get()`.
pub fn init(config: DeviceConfig) {
    if DEVICE_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global device configuration.
///
/// Panics if `init()` has not been called. A missing config is a fatal
/// startup error, not a recoverable condition.
pub fn get() -> &'static DeviceConfig {
    DEVICE_CONFIG
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

/// Check whether the config has been initialized.
///
/// Useful for tests and optional config paths.
pub fn is_initialized() -> bool {
    DEVICE_CONFIG.get().is_some()
}
