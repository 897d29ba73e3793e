//! Engine configuration.
//!
//! All knobs carry serde defaults so an embedding process can deserialize
//! a partial config (TOML/JSON) and get production values for everything
//! it leaves out. The fingerprint pepper is process-wide configuration —
//! it is resolved from the `FINGERPRINT_PEPPER` environment variable
//! first, then the config file, then a built-in default, and is never
//! accepted from user input.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable that overrides the configured pepper.
pub const PEPPER_ENV_VAR: &str = "FINGERPRINT_PEPPER";

/// Built-in pepper used when neither env nor config provides one.
/// Deployments are expected to override this.
const DEFAULT_PEPPER: &str = "devicegate-fingerprint-pepper-v1";

/// Configuration for the devicegate engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicegateConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Maximum in-flight statements against the store. Doubles as the
    /// connection pool size; callers past the cap block until a slot
    /// frees. Sized for ~2000 concurrent employees on a single-writer
    /// embedded store.
    #[serde(default = "default_max_concurrent_statements")]
    pub max_concurrent_statements: u32,

    /// SQLite busy_timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,

    /// Secret pepper mixed into fingerprint hashing. Overridden by the
    /// `FINGERPRINT_PEPPER` environment variable when set.
    #[serde(default)]
    pub fingerprint_pepper: Option<String>,

    /// When true, new registrations start `approved` instead of `pending`
    /// (trusted enrollment environments only).
    #[serde(default)]
    pub auto_approve_registrations: bool,

    /// Hard ceiling on devices touched by one bulk admin action.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,

    /// Retention horizon for access logs and LOW/MEDIUM security events.
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("devicegate.db")
}

fn default_max_concurrent_statements() -> u32 {
    10
}

fn default_busy_timeout_ms() -> u32 {
    30_000
}

fn default_max_batch_size() -> u32 {
    100
}

fn default_log_retention_days() -> u32 {
    90
}

impl Default for DevicegateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_concurrent_statements: default_max_concurrent_statements(),
            busy_timeout_ms: default_busy_timeout_ms(),
            fingerprint_pepper: None,
            auto_approve_registrations: false,
            max_batch_size: default_max_batch_size(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

impl DevicegateConfig {
    /// Resolve the effective pepper: env var > config > built-in default.
    pub fn resolve_pepper(&self) -> String {
        if let Ok(pepper) = std::env::var(PEPPER_ENV_VAR) {
            if !pepper.is_empty() {
                return pepper;
            }
        }
        self.fingerprint_pepper
            .clone()
            .unwrap_or_else(|| DEFAULT_PEPPER.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_enterprise_profile() {
        let config = DevicegateConfig::default();
        assert_eq!(config.max_concurrent_statements, 10);
        assert_eq!(config.busy_timeout_ms, 30_000);
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.log_retention_days, 90);
        assert!(!config.auto_approve_registrations);
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let config: DevicegateConfig =
            serde_json::from_str(r#"{"db_path": "/tmp/gate.db", "max_batch_size": 25}"#).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/gate.db"));
        assert_eq!(config.max_batch_size, 25);
        assert_eq!(config.max_concurrent_statements, 10);
    }

    #[test]
    fn configured_pepper_used_when_env_unset() {
        let config = DevicegateConfig {
            fingerprint_pepper: Some("unit-test-pepper".into()),
            ..Default::default()
        };
        // The test runner may or may not carry FINGERPRINT_PEPPER; only
        // assert the config fallback when the env var is absent.
        if std::env::var(PEPPER_ENV_VAR).is_err() {
            assert_eq!(config.resolve_pepper(), "unit-test-pepper");
        }
    }
}
