//! Configuration loading.
//!
//! Precedence, lowest to highest: built-in defaults, an optional TOML config
//! file, environment variables, CLI flags. Every key in spec §6 is
//! recognized; the TOML layer rejects unknown keys via `deny_unknown_fields`,
//! matching `spec.rs::validate_spec`'s rejection of an unsupported
//! `api_version` in the teacher.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub vboxmanage_path: Option<String>,
    pub max_parallel_vboxmanage: usize,
    pub session_ttl_seconds: u64,
    pub session_cleanup_interval_seconds: u64,
    pub connection_pool_max_size: usize,
    pub connection_idle_ttl_seconds: u64,
    pub connection_max_usage: u32,
    pub connection_pool_cleanup_interval_seconds: u64,
    pub job_result_ttl_seconds: u64,
    pub graceful_stop_timeout_seconds: u64,
    pub default_operation_timeout_seconds: u64,
    pub long_operation_timeout_seconds: u64,
    pub log_level: String,
    /// Directory to write rotating daily log files to. `None` logs to
    /// stderr only — stdout is reserved for the JSON-RPC stream and must
    /// never carry log output.
    pub log_dir: Option<String>,
    /// Not part of the spec's recognized-options table, but needed to bound
    /// shutdown: how long in-flight handlers get before being cancelled.
    pub shutdown_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vboxmanage_path: None,
            max_parallel_vboxmanage: 8,
            session_ttl_seconds: 3600,
            session_cleanup_interval_seconds: 300,
            connection_pool_max_size: 20,
            connection_idle_ttl_seconds: 300,
            connection_max_usage: 100,
            connection_pool_cleanup_interval_seconds: 60,
            job_result_ttl_seconds: 1800,
            graceful_stop_timeout_seconds: 60,
            default_operation_timeout_seconds: 30,
            long_operation_timeout_seconds: 1800,
            log_level: "info".to_string(),
            log_dir: None,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl Config {
    /// Load defaults, then overlay an optional TOML file, then environment
    /// variables. CLI flags are applied by the caller (`bin/virtualization_mcp`)
    /// after this returns, since `clap` owns flag parsing.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut cfg = Config::default();

        if let Some(path) = config_path {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                Error::ConfigError(format!("failed to read {}: {e}", path.display()))
            })?;
            cfg = toml::from_str(&raw)
                .map_err(|e| Error::ConfigError(format!("invalid config {}: {e}", path.display())))?;
        }

        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("VBOXMANAGE_PATH") {
            if self.vboxmanage_path.is_none() {
                self.vboxmanage_path = Some(v);
            }
        }
        // VBOX_USER_HOME is honored by the adapter at spawn time as a
        // fallback env var for the child process, not as a Config field.
        if let Ok(v) = std::env::var("VIRTUALIZATION_MCP_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_parallel_vboxmanage == 0 {
            return Err(Error::ConfigError(
                "max_parallel_vboxmanage must be >= 1".into(),
            ));
        }
        if !["trace", "debug", "info", "warn", "error"].contains(&self.log_level.as_str()) {
            return Err(Error::ConfigError(format!(
                "invalid log_level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Config::default();
        assert_eq!(cfg.max_parallel_vboxmanage, 8);
        assert_eq!(cfg.session_ttl_seconds, 3600);
        assert_eq!(cfg.connection_pool_max_size, 20);
        assert_eq!(cfg.connection_max_usage, 100);
        assert_eq!(cfg.job_result_ttl_seconds, 1800);
        assert_eq!(cfg.graceful_stop_timeout_seconds, 60);
    }

    #[test]
    fn rejects_zero_parallelism() {
        let mut cfg = Config::default();
        cfg.max_parallel_vboxmanage = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_toml_keys() {
        let raw = "max_parallel_vboxmanage = 4\nbogus_key = true\n";
        let err = toml::from_str::<Config>(raw).unwrap_err();
        assert!(err.to_string().contains("bogus_key") || err.to_string().contains("unknown"));
    }
}
