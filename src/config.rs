//! Plugin configuration.
//!
//! A [`PluginConfig`] is what a test harness hands to a server-under-test:
//! the capabilities the plugin declares plus optional assertions about the
//! flags its handlers should see. It is read from JSON, either directly or
//! from a `cfg=<json>` command line argument.
//!
//! ```
//! use nbd_core::capability::Capability;
//! use nbd_core::config::PluginConfig;
//!
//! let config = PluginConfig::from_arg(r#"cfg={"size": 512, "can_fua": "emulate"}"#).unwrap();
//! assert_eq!(config.capabilities.size, 512);
//! assert_eq!(config.capabilities.can_fua, Capability::Emulate);
//! assert!(config.capabilities.can_write);
//! assert_eq!(config.expectations.zero_expect_may_trim, None);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::{Capability, CapabilitySet};

const ARG_PREFIX: &str = "cfg=";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("plugin configuration must look like cfg=<json>, got {0:?}")]
    MissingPrefix(String),

    #[error("invalid plugin configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("export size {0} is too large for an in-memory plugin")]
    TooLarge(u64),
}

/// Capabilities a plugin declares. Missing keys take the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginCapabilities {
    pub size: u64,
    pub can_write: bool,
    pub is_rotational: bool,
    pub can_multi_conn: bool,
    pub can_flush: bool,
    pub can_trim: bool,
    pub can_zero: bool,
    pub can_fast_zero: bool,
    pub can_fua: Capability,
    pub can_cache: Capability,
}

impl Default for PluginCapabilities {
    fn default() -> Self {
        Self {
            size: 0,
            can_write: true,
            is_rotational: false,
            can_multi_conn: false,
            can_flush: false,
            can_trim: false,
            can_zero: true,
            can_fast_zero: false,
            can_fua: Capability::None,
            can_cache: Capability::None,
        }
    }
}

impl PluginCapabilities {
    /// What a server advertises for these capabilities.
    ///
    /// A read-only export never advertises trim, zero, fast zero or FUA, and
    /// fast zero is only advertised together with zero.
    pub fn advertised(&self) -> CapabilitySet {
        let writable = self.can_write;
        let supports_zero = writable && self.can_zero;
        CapabilitySet {
            read_only: !writable,
            supports_flush: self.can_flush,
            supports_trim: writable && self.can_trim,
            supports_zero,
            supports_fast_zero: supports_zero && self.can_fast_zero,
            supports_cache: self.can_cache,
            supports_fua: if writable { self.can_fua } else { Capability::None },
            is_rotational: self.is_rotational,
            can_multi_conn: self.can_multi_conn,
            can_extents: false,
        }
    }
}

/// Flags a test handler expects to receive. `None` means "don't check".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerExpectations {
    pub pwrite_expect_fua: Option<bool>,
    pub trim_expect_fua: Option<bool>,
    pub zero_expect_fua: Option<bool>,
    pub zero_expect_may_trim: Option<bool>,
    pub zero_expect_fast_zero: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(flatten)]
    pub capabilities: PluginCapabilities,

    #[serde(flatten)]
    pub expectations: HandlerExpectations,
}

impl PluginConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parses the `cfg=<json>` argument form.
    pub fn from_arg(arg: &str) -> Result<Self, ConfigError> {
        let json = arg
            .strip_prefix(ARG_PREFIX)
            .ok_or_else(|| ConfigError::MissingPrefix(arg.to_string()))?;
        Self::from_json(json)
    }

    /// The `cfg=<json>` argument that parses back to this configuration.
    pub fn to_arg(&self) -> Result<String, ConfigError> {
        Ok(format!("{ARG_PREFIX}{}", serde_json::to_string(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_takes_defaults() {
        let config = PluginConfig::from_json("{}").unwrap();
        assert_eq!(config, PluginConfig::default());
        assert_eq!(config.capabilities.size, 0);
        assert!(config.capabilities.can_write);
        assert!(config.capabilities.can_zero);
        assert!(!config.capabilities.can_flush);
        assert_eq!(config.capabilities.can_cache, Capability::None);
    }

    #[test]
    fn test_expectations_are_flattened() {
        let config = PluginConfig::from_json(
            r#"{"size": 1048576, "can_trim": true, "trim_expect_fua": true, "zero_expect_may_trim": false}"#,
        )
        .unwrap();
        assert_eq!(config.capabilities.size, 1 << 20);
        assert!(config.capabilities.can_trim);
        assert_eq!(config.expectations.trim_expect_fua, Some(true));
        assert_eq!(config.expectations.zero_expect_may_trim, Some(false));
        assert_eq!(config.expectations.pwrite_expect_fua, None);
    }

    #[test]
    fn test_bad_capability_value() {
        let result = PluginConfig::from_json(r#"{"can_fua": "sometimes"}"#);
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_arg_requires_prefix() {
        assert!(matches!(
            PluginConfig::from_arg("{}"),
            Err(ConfigError::MissingPrefix(_))
        ));
    }

    #[test]
    fn test_arg_form_survives_formatting() {
        let mut config = PluginConfig::default();
        config.capabilities.can_cache = Capability::Native;
        config.expectations.zero_expect_fast_zero = Some(true);

        let arg = config.to_arg().unwrap();
        assert!(arg.starts_with("cfg="));
        assert_eq!(PluginConfig::from_arg(&arg).unwrap(), config);
    }

    #[test]
    fn test_read_only_export_hides_write_capabilities() {
        let capabilities = PluginCapabilities {
            can_write: false,
            can_trim: true,
            can_fast_zero: true,
            can_flush: true,
            can_fua: Capability::Native,
            can_cache: Capability::Emulate,
            ..Default::default()
        };
        let advertised = capabilities.advertised();
        assert!(advertised.read_only);
        assert!(!advertised.supports_trim);
        assert!(!advertised.supports_zero);
        assert!(!advertised.supports_fast_zero);
        assert_eq!(advertised.supports_fua, Capability::None);
        assert!(advertised.supports_flush);
        assert_eq!(advertised.supports_cache, Capability::Emulate);
    }

    #[test]
    fn test_fast_zero_needs_zero() {
        let capabilities = PluginCapabilities {
            can_zero: false,
            can_fast_zero: true,
            ..Default::default()
        };
        assert!(!capabilities.advertised().supports_fast_zero);
    }
}
