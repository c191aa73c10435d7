//! Configuration module for the bridge core
//!
//! All configuration is loaded from environment variables following the
//! pattern `MAIL_BRIDGE_<KEY>`. User-facing settings (ports, TLS, data
//! directory) are not configured here; they live in the vault so front-ends
//! can change them at runtime.

use std::env;
use std::env::VarError;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{AppError, AppResult};

/// Default directory holding the vault file and the TLS certificate
const DEFAULT_SETTINGS_DIR: &str = "./bridge-data";

/// Process-wide bridge configuration
///
/// Holds timing constants for the background loops. Cloned into each
/// component at construction time.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Directory holding `vault.json`, `cert.pem` and `key.pem`
    pub settings_dir: PathBuf,
    /// Interval between remote event polls per user, in milliseconds
    pub event_poll_ms: u64,
    /// First connection recheck delay while the API is down, in milliseconds
    pub recheck_initial_ms: u64,
    /// Ceiling for the doubling recheck delay, in milliseconds
    pub recheck_max_ms: u64,
    /// Attempts made on a failing remote event before raising a bad event
    pub bad_event_retries: u32,
    /// Minimum spacing between attempts on a failing event, in milliseconds
    pub bad_event_backoff_ms: u64,
    /// Per-subscriber queue depth on the event bus
    pub bus_capacity: usize,
    /// Heartbeat loop wake-up interval in seconds
    pub heartbeat_interval_seconds: u64,
    /// Update checker interval in seconds
    pub update_interval_seconds: u64,
    /// Message metadata page size used by full syncs
    pub sync_page_size: usize,
    /// Socket timeout for the diagnostics IMAP client, in milliseconds
    pub imap_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            settings_dir: PathBuf::from(DEFAULT_SETTINGS_DIR),
            event_poll_ms: 20_000,
            recheck_initial_ms: 1_000,
            recheck_max_ms: 30_000,
            bad_event_retries: 5,
            bad_event_backoff_ms: 10_000,
            bus_capacity: 256,
            heartbeat_interval_seconds: 3_600,
            update_interval_seconds: 6 * 3_600,
            sync_page_size: 150,
            imap_timeout_ms: 30_000,
        }
    }
}

impl BridgeConfig {
    /// Load all configuration from environment variables
    ///
    /// Every key is optional; unset keys fall back to [`BridgeConfig::default`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a variable is set but malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_BRIDGE_SETTINGS_DIR=/var/lib/mail-bridge
    /// MAIL_BRIDGE_EVENT_POLL_MS=30000
    /// MAIL_BRIDGE_BAD_EVENT_RETRIES=3
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let defaults = Self::default();
        let settings_dir = match env::var("MAIL_BRIDGE_SETTINGS_DIR") {
            Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
            Ok(_) | Err(VarError::NotPresent) => defaults.settings_dir,
            Err(VarError::NotUnicode(_)) => {
                return Err(AppError::InvalidInput(
                    "environment variable MAIL_BRIDGE_SETTINGS_DIR contains non-unicode data"
                        .to_owned(),
                ));
            }
        };

        let config = Self {
            settings_dir,
            event_poll_ms: parse_u64_env("MAIL_BRIDGE_EVENT_POLL_MS", defaults.event_poll_ms)?,
            recheck_initial_ms: parse_u64_env(
                "MAIL_BRIDGE_RECHECK_INITIAL_MS",
                defaults.recheck_initial_ms,
            )?,
            recheck_max_ms: parse_u64_env("MAIL_BRIDGE_RECHECK_MAX_MS", defaults.recheck_max_ms)?,
            bad_event_retries: parse_u32_env(
                "MAIL_BRIDGE_BAD_EVENT_RETRIES",
                defaults.bad_event_retries,
            )?,
            bad_event_backoff_ms: parse_u64_env(
                "MAIL_BRIDGE_BAD_EVENT_BACKOFF_MS",
                defaults.bad_event_backoff_ms,
            )?,
            bus_capacity: parse_usize_env("MAIL_BRIDGE_BUS_CAPACITY", defaults.bus_capacity)?,
            heartbeat_interval_seconds: parse_u64_env(
                "MAIL_BRIDGE_HEARTBEAT_INTERVAL_SECONDS",
                defaults.heartbeat_interval_seconds,
            )?,
            update_interval_seconds: parse_u64_env(
                "MAIL_BRIDGE_UPDATE_INTERVAL_SECONDS",
                defaults.update_interval_seconds,
            )?,
            sync_page_size: parse_usize_env(
                "MAIL_BRIDGE_SYNC_PAGE_SIZE",
                defaults.sync_page_size,
            )?,
            imap_timeout_ms: parse_u64_env("MAIL_BRIDGE_IMAP_TIMEOUT_MS", defaults.imap_timeout_ms)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would stall a background loop
    fn validate(&self) -> AppResult<()> {
        if self.bad_event_retries == 0 {
            return Err(AppError::invalid(
                "MAIL_BRIDGE_BAD_EVENT_RETRIES must be at least 1",
            ));
        }
        if self.bus_capacity == 0 {
            return Err(AppError::invalid("MAIL_BRIDGE_BUS_CAPACITY must be at least 1"));
        }
        if self.recheck_initial_ms == 0 || self.recheck_initial_ms > self.recheck_max_ms {
            return Err(AppError::invalid(
                "MAIL_BRIDGE_RECHECK_INITIAL_MS must be positive and not exceed MAIL_BRIDGE_RECHECK_MAX_MS",
            ));
        }
        if self.sync_page_size == 0 {
            return Err(AppError::invalid("MAIL_BRIDGE_SYNC_PAGE_SIZE must be at least 1"));
        }
        Ok(())
    }

    /// Path of the vault file inside the settings directory
    pub fn vault_path(&self) -> PathBuf {
        self.settings_dir.join("vault.json")
    }

    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }

    pub fn recheck_initial(&self) -> Duration {
        Duration::from_millis(self.recheck_initial_ms)
    }

    pub fn recheck_max(&self) -> Duration {
        Duration::from_millis(self.recheck_max_ms)
    }

    pub fn bad_event_backoff(&self) -> Duration {
        Duration::from_millis(self.bad_event_backoff_ms)
    }

    pub fn imap_timeout(&self) -> Duration {
        Duration::from_millis(self.imap_timeout_ms)
    }
}

/// Parse a boolean value with flexible spelling
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Used by the operator binary too.
pub fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Read an environment variable, mapping non-unicode data to an error
fn read_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    read_env(key)?.map_or(Ok(default), |v| {
        v.trim().parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        })
    })
}

/// Parse a `u32` environment variable with default fallback
fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    read_env(key)?.map_or(Ok(default), |v| {
        v.trim().parse::<u32>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u32 environment variable {key}: '{v}'"))
        })
    })
}

/// Parse a `usize` environment variable with default fallback
fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    read_env(key)?.map_or(Ok(default), |v| {
        v.trim().parse::<usize>().map_err(|_| {
            AppError::InvalidInput(format!("invalid usize environment variable {key}: '{v}'"))
        })
    })
}
