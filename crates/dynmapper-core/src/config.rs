//! Service configuration.
//!
//! Loaded from TOML, then overridden by `DYNMAPPER_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default values.
pub mod defaults {
    pub const LOG_PAYLOAD: bool = false;
    pub const LOG_SUBSTITUTION: bool = false;
    pub const SEND_MAPPING_STATUS: bool = true;
    pub const MAX_SNOOPED_TEMPLATES: usize = 10;
    pub const WORKER_POOL_SIZE: usize = 16;
    pub const DISPATCH_TIMEOUT_SECS: u64 = 60;
    pub const HOUSEKEEPING_INTERVAL_SECS: u64 = 30;
    pub const INJECT_TIME_IF_MISSING: bool = true;
    /// Default log filter when `RUST_LOG` is unset.
    pub const LOG_FILTER: &str = "dynmapper=info";
}

/// Environment variable names.
pub mod env_vars {
    pub const LOG_JSON: &str = "DYNMAPPER_LOG_JSON";
    pub const LOG_PAYLOAD: &str = "DYNMAPPER_LOG_PAYLOAD";
    pub const LOG_SUBSTITUTION: &str = "DYNMAPPER_LOG_SUBSTITUTION";
    pub const SEND_MAPPING_STATUS: &str = "DYNMAPPER_SEND_MAPPING_STATUS";
    pub const MAX_SNOOPED_TEMPLATES: &str = "DYNMAPPER_MAX_SNOOPED_TEMPLATES";
    pub const WORKER_POOL_SIZE: &str = "DYNMAPPER_WORKER_POOL_SIZE";
    pub const DISPATCH_TIMEOUT_SECS: &str = "DYNMAPPER_DISPATCH_TIMEOUT_SECS";
    pub const HOUSEKEEPING_INTERVAL_SECS: &str = "DYNMAPPER_HOUSEKEEPING_INTERVAL_SECS";
    pub const INJECT_TIME_IF_MISSING: &str = "DYNMAPPER_INJECT_TIME_IF_MISSING";
}

/// Mapper service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfiguration {
    pub log_payload: bool,
    pub log_substitution: bool,
    pub send_mapping_status: bool,
    /// Snooping stops once this many samples are recorded.
    pub max_snooped_templates: usize,
    /// Permits of the shared fan-out worker pool.
    pub worker_pool_size: usize,
    pub dispatch_timeout_secs: u64,
    pub housekeeping_interval_secs: u64,
    pub inject_time_if_missing: bool,
}

impl Default for ServiceConfiguration {
    fn default() -> Self {
        Self {
            log_payload: defaults::LOG_PAYLOAD,
            log_substitution: defaults::LOG_SUBSTITUTION,
            send_mapping_status: defaults::SEND_MAPPING_STATUS,
            max_snooped_templates: defaults::MAX_SNOOPED_TEMPLATES,
            worker_pool_size: defaults::WORKER_POOL_SIZE,
            dispatch_timeout_secs: defaults::DISPATCH_TIMEOUT_SECS,
            housekeeping_interval_secs: defaults::HOUSEKEEPING_INTERVAL_SECS,
            inject_time_if_missing: defaults::INJECT_TIME_IF_MISSING,
        }
    }
}

impl ServiceConfiguration {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Apply `DYNMAPPER_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source. Unparsable values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
            lookup(name).and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = parsed(&lookup, env_vars::LOG_PAYLOAD) {
            self.log_payload = v;
        }
        if let Some(v) = parsed(&lookup, env_vars::LOG_SUBSTITUTION) {
            self.log_substitution = v;
        }
        if let Some(v) = parsed(&lookup, env_vars::SEND_MAPPING_STATUS) {
            self.send_mapping_status = v;
        }
        if let Some(v) = parsed(&lookup, env_vars::MAX_SNOOPED_TEMPLATES) {
            self.max_snooped_templates = v;
        }
        if let Some(v) = parsed(&lookup, env_vars::WORKER_POOL_SIZE) {
            self.worker_pool_size = v;
        }
        if let Some(v) = parsed(&lookup, env_vars::DISPATCH_TIMEOUT_SECS) {
            self.dispatch_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, env_vars::HOUSEKEEPING_INTERVAL_SECS) {
            self.housekeeping_interval_secs = v;
        }
        if let Some(v) = parsed(&lookup, env_vars::INJECT_TIME_IF_MISSING) {
            self.inject_time_if_missing = v;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(Error::Config("workerPoolSize must be greater than 0".to_string()));
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(Error::Config("dispatchTimeoutSecs must be greater than 0".to_string()));
        }
        if self.housekeeping_interval_secs == 0 {
            return Err(Error::Config(
                "housekeepingIntervalSecs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ServiceConfiguration::default();
        assert_eq!(config.worker_pool_size, 16);
        assert_eq!(config.dispatch_timeout(), Duration::from_secs(60));
        assert!(config.send_mapping_status);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = ServiceConfiguration::from_toml_str(
            r#"
            logPayload = true
            workerPoolSize = 4
            "#,
        )
        .unwrap();
        assert!(config.log_payload);
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.max_snooped_templates, defaults::MAX_SNOOPED_TEMPLATES);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(ServiceConfiguration::from_toml_str("workerPoolSize = 0").is_err());
        assert!(ServiceConfiguration::from_toml_str("workerPoolSize = \"x\"").is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (env_vars::WORKER_POOL_SIZE, "2"),
            (env_vars::LOG_SUBSTITUTION, "true"),
            (env_vars::DISPATCH_TIMEOUT_SECS, "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = ServiceConfiguration::default()
            .with_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.worker_pool_size, 2);
        assert!(config.log_substitution);
        assert_eq!(config.dispatch_timeout_secs, defaults::DISPATCH_TIMEOUT_SECS);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapper.toml");
        std::fs::write(&path, "maxSnoopedTemplates = 3\n").unwrap();
        let config = ServiceConfiguration::from_file(&path).unwrap();
        assert_eq!(config.max_snooped_templates, 3);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            ServiceConfiguration::from_file(&missing),
            Err(Error::Config(_))
        ));
    }
}
