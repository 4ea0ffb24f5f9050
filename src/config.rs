//! Runtime configuration, loadable from TOML and environment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ExecutionError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_global: usize,
    pub max_per_tenant: usize,
    pub acquire_timeout_secs: u64,
    pub idle_ttl_secs: u64,
    pub headless: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_global: 100,
            max_per_tenant: 10,
            acquire_timeout_secs: 30,
            idle_ttl_secs: 15 * 60,
            headless: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_max_task_duration_secs: u64,
    pub default_max_run_duration_secs: u64,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub strict_extraction: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_task_duration_secs: 3600,
            default_max_run_duration_secs: 2 * 3600,
            cache_enabled: true,
            cache_ttl_secs: 24 * 3600,
            strict_extraction: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub global_concurrent_runs: usize,
    pub tenant_concurrent_runs: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global_concurrent_runs: 100,
            tenant_concurrent_runs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9090/v1/decide".to_string(),
            api_key: None,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StratusConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
}

impl StratusConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ExecutionError::Validation(format!("config read: {}", e)))?;
        toml::from_str(&raw).map_err(|e| ExecutionError::Validation(format!("config parse: {}", e)))
    }

    pub fn session_pool(&self) -> crate::session::SessionPoolConfig {
        crate::session::SessionPoolConfig {
            max_global: self.sessions.max_global,
            max_per_tenant: self.sessions.max_per_tenant,
            acquire_timeout: Duration::from_secs(self.sessions.acquire_timeout_secs),
            idle_ttl: Duration::from_secs(self.sessions.idle_ttl_secs),
            max_recovery_attempts: 3,
            driver: crate::driver::DriverConfig {
                headless: self.sessions.headless,
                ..crate::driver::DriverConfig::default()
            },
        }
    }

    pub fn task_engine(&self) -> crate::engine::TaskEngineConfig {
        crate::engine::TaskEngineConfig {
            default_max_duration: Duration::from_secs(self.engine.default_max_task_duration_secs),
            cache_enabled: self.engine.cache_enabled,
            cache_ttl: Duration::from_secs(self.engine.cache_ttl_secs),
            action: crate::action::ActionConfig {
                strict_extraction: self.engine.strict_extraction,
                ..crate::action::ActionConfig::default()
            },
            ..crate::engine::TaskEngineConfig::default()
        }
    }

    pub fn orchestrator(&self) -> crate::workflow::OrchestratorConfig {
        crate::workflow::OrchestratorConfig {
            default_max_duration: Duration::from_secs(self.engine.default_max_run_duration_secs),
        }
    }

    pub fn http_oracle(&self) -> crate::oracle::HttpOracleConfig {
        crate::oracle::HttpOracleConfig {
            endpoint: self.oracle.endpoint.clone(),
            api_key: self.oracle.api_key.clone(),
            request_timeout: Duration::from_secs(self.oracle.request_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_limits() {
        let config = StratusConfig::default();
        assert_eq!(config.sessions.max_global, 100);
        assert_eq!(config.sessions.max_per_tenant, 10);
        assert_eq!(config.concurrency.tenant_concurrent_runs, 10);
        assert_eq!(config.engine.default_max_run_duration_secs, 7200);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: StratusConfig =
            toml::from_str("[server]\nport = 9000\n").expect("partial config parses");
        assert_eq!(parsed.server.port, 9000);
        assert_eq!(parsed.sessions.max_global, 100);
    }

    #[test]
    fn loads_from_a_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratus.toml");
        std::fs::write(&path, "[sessions]\nmax_global = 5\nheadless = false\n").unwrap();
        let config = StratusConfig::load(&path).unwrap();
        assert_eq!(config.sessions.max_global, 5);
        assert!(!config.session_pool().driver.headless);
    }
}
