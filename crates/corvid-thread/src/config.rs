//! Runtime configuration for the thread core
//!
//! Values come from one of three places: [`RuntimeConfig::default`], a TOML
//! document, or a [`ConfigProvider`] (the host's configuration callback, or
//! `CORVID_*` environment variables through [`EnvConfigProvider`]).

use crate::defaults::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file
    #[error("Failed to read config: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A value parsed but is out of range
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue {
        /// Setting name
        name: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Host-side configuration callback
///
/// Names are the setting names without prefix, e.g. `GcStressLevel`.
pub trait ConfigProvider {
    /// Integer setting, or `default` when unset
    fn get_int_config_value(&self, name: &str, default: u64) -> u64;

    /// String setting, `None` when unset
    fn get_string_config_value(&self, name: &str) -> Option<String>;
}

/// Reads settings from `CORVID_<NAME>` environment variables
///
/// `GcStressLevel` maps to `CORVID_GC_STRESS_LEVEL`. Integers may be decimal or
/// `0x`-prefixed hex; anything unparsable counts as unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvConfigProvider;

impl EnvConfigProvider {
    fn var_name(name: &str) -> String {
        let mut var = String::from(CONFIG_ENV_PREFIX);
        for (i, ch) in name.chars().enumerate() {
            if ch.is_ascii_uppercase() && i > 0 {
                var.push('_');
            }
            var.push(ch.to_ascii_uppercase());
        }
        var
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn get_int_config_value(&self, name: &str, default: u64) -> u64 {
        self.get_string_config_value(name)
            .and_then(|value| parse_int(&value))
            .unwrap_or(default)
    }

    fn get_string_config_value(&self, name: &str) -> Option<String> {
        std::env::var(Self::var_name(name)).ok()
    }
}

fn parse_int(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Tunables of the thread core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How long the suspending thread sleeps between handshake passes (microseconds)
    pub suspend_poll_interval_us: u64,

    /// Log a warning once a suspension has taken this long (milliseconds)
    pub suspend_warn_after_ms: u64,

    /// Dynamic-type TLS cells reserved on first allocation
    pub initial_tls_cells: u32,

    /// GC stress level: 0 disables, N stresses roughly one allocation in N
    pub gc_stress_level: u32,

    /// Fixed GC stress seed (None = random per thread)
    pub gc_stress_seed: Option<u64>,

    /// Stack size assumed when bounds must be estimated
    pub stack_size_hint: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            suspend_poll_interval_us: DEFAULT_SUSPEND_POLL_INTERVAL_US,
            suspend_warn_after_ms: DEFAULT_SUSPEND_WARN_AFTER_MS,
            initial_tls_cells: DEFAULT_INITIAL_TLS_CELLS,
            gc_stress_level: 0,
            gc_stress_seed: None,
            stack_size_hint: DEFAULT_STACK_SIZE_HINT,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from a host callback, falling back to defaults
    pub fn from_provider(provider: &dyn ConfigProvider) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let gc_stress_seed = match provider.get_string_config_value("GcStressSeed") {
            Some(raw) => Some(parse_int(&raw).ok_or_else(|| ConfigError::InvalidValue {
                name: "GcStressSeed",
                reason: format!("not an integer: {:?}", raw),
            })?),
            None => None,
        };

        let config = Self {
            suspend_poll_interval_us: provider
                .get_int_config_value("SuspendPollIntervalUs", defaults.suspend_poll_interval_us),
            suspend_warn_after_ms: provider
                .get_int_config_value("SuspendWarnAfterMs", defaults.suspend_warn_after_ms),
            initial_tls_cells: narrow(
                "InitialTlsCells",
                provider.get_int_config_value("InitialTlsCells", defaults.initial_tls_cells as u64),
            )?,
            gc_stress_level: narrow(
                "GcStressLevel",
                provider.get_int_config_value("GcStressLevel", defaults.gc_stress_level as u64),
            )?,
            gc_stress_seed,
            stack_size_hint: narrow(
                "StackSizeHint",
                provider.get_int_config_value("StackSizeHint", defaults.stack_size_hint as u64),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from `CORVID_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_provider(&EnvConfigProvider)
    }

    /// Parse a configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.suspend_poll_interval_us == 0 {
            return Err(ConfigError::InvalidValue {
                name: "suspend_poll_interval_us",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.stack_size_hint < 64 * 1024 {
            return Err(ConfigError::InvalidValue {
                name: "stack_size_hint",
                reason: format!("{} bytes is smaller than 64 KiB", self.stack_size_hint),
            });
        }
        Ok(())
    }

    /// Sleep between handshake passes
    pub fn suspend_poll_interval(&self) -> Duration {
        Duration::from_micros(self.suspend_poll_interval_us)
    }

    /// Delay before a slow suspension is reported
    pub fn suspend_warn_after(&self) -> Duration {
        Duration::from_millis(self.suspend_warn_after_ms)
    }
}

fn narrow<T: TryFrom<u64>>(name: &'static str, value: u64) -> Result<T, ConfigError> {
    T::try_from(value).map_err(|_| ConfigError::InvalidValue {
        name,
        reason: format!("{} is out of range", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapProvider(HashMap<&'static str, &'static str>);

    impl ConfigProvider for MapProvider {
        fn get_int_config_value(&self, name: &str, default: u64) -> u64 {
            self.0
                .get(name)
                .and_then(|v| parse_int(v))
                .unwrap_or(default)
        }

        fn get_string_config_value(&self, name: &str) -> Option<String> {
            self.0.get(name).map(|v| v.to_string())
        }
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.initial_tls_cells, DEFAULT_INITIAL_TLS_CELLS);
        assert_eq!(config.gc_stress_level, 0);
        assert_eq!(config.suspend_poll_interval(), Duration::from_micros(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_provider() {
        let provider = MapProvider(HashMap::from([
            ("GcStressLevel", "4"),
            ("GcStressSeed", "0x2a"),
            ("InitialTlsCells", "16"),
        ]));
        let config = RuntimeConfig::from_provider(&provider).unwrap();

        assert_eq!(config.gc_stress_level, 4);
        assert_eq!(config.gc_stress_seed, Some(42));
        assert_eq!(config.initial_tls_cells, 16);
        assert_eq!(config.suspend_warn_after_ms, DEFAULT_SUSPEND_WARN_AFTER_MS);
    }

    #[test]
    fn test_provider_rejects_bad_seed() {
        let provider = MapProvider(HashMap::from([("GcStressSeed", "soon")]));
        assert!(matches!(
            RuntimeConfig::from_provider(&provider),
            Err(ConfigError::InvalidValue { name: "GcStressSeed", .. })
        ));
    }

    #[test]
    fn test_provider_rejects_out_of_range() {
        let provider = MapProvider(HashMap::from([("GcStressLevel", "0x1_0000_0000")]));
        // Unparsable ints fall back to the default
        assert_eq!(RuntimeConfig::from_provider(&provider).unwrap().gc_stress_level, 0);

        let provider = MapProvider(HashMap::from([("GcStressLevel", "4294967296")]));
        assert!(RuntimeConfig::from_provider(&provider).is_err());
    }

    #[test]
    fn test_env_var_names() {
        assert_eq!(EnvConfigProvider::var_name("GcStressLevel"), "CORVID_GC_STRESS_LEVEL");
        assert_eq!(EnvConfigProvider::var_name("StackSizeHint"), "CORVID_STACK_SIZE_HINT");
    }

    #[test]
    fn test_env_provider_reads_variable() {
        std::env::set_var("CORVID_ENV_PROVIDER_HEX", "0x10");
        assert_eq!(EnvConfigProvider.get_int_config_value("EnvProviderHex", 1), 16);
        assert_eq!(EnvConfigProvider.get_int_config_value("EnvProviderMissing", 7), 7);
        std::env::remove_var("CORVID_ENV_PROVIDER_HEX");
    }

    #[test]
    fn test_from_toml() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            gc_stress_level = 2
            gc_stress_seed = 99
            suspend_warn_after_ms = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.gc_stress_level, 2);
        assert_eq!(config.gc_stress_seed, Some(99));
        assert_eq!(config.suspend_warn_after(), Duration::from_millis(50));
        assert_eq!(config.stack_size_hint, DEFAULT_STACK_SIZE_HINT);
    }

    #[test]
    fn test_toml_validation() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("suspend_poll_interval_us = 0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("gc_stress_level = \"high\""),
            Err(ConfigError::ParseError(_))
        ));
    }
}
