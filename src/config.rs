//! TOML configuration for the CI/CD manager.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a runnable configuration. The loaded value is immutable and is
//! passed explicitly to the components that need it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "CICD_MANAGER_CONFIG";

/// Standard system location of the configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/cicd-manager/config.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub catalogue: CatalogueConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub metrics_repository: MetricsRepositoryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ManagerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded manager configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.manager.url = config.manager.url.trim_end_matches('/').to_string();
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `CICD_MANAGER_CONFIG` environment variable.
    /// 2. `/etc/cicd-manager/config.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CICD_MANAGER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address of the HTTP surface.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSection {
    /// Externally reachable base URL. Agents call back into it.
    pub url: String,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/cicd-manager.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Catalogue
// ---------------------------------------------------------------------------

/// Seed files for the testbed catalogue and the metrics contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogueConfig {
    pub tests_path: PathBuf,
    pub testbeds_path: PathBuf,
    pub metrics_contract_path: PathBuf,
}

impl Default for CatalogueConfig {
    fn default() -> Self {
        Self {
            tests_path: PathBuf::from("static/tests.yaml"),
            testbeds_path: PathBuf::from("static/testbeds.yaml"),
            metrics_contract_path: PathBuf::from("static/metrics_collection.yaml"),
        }
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Upper bound for one liveness probe.
    pub probe_timeout_secs: u64,
    /// Upper bound for any other control-plane request.
    pub request_timeout_secs: u64,
}

impl AgentsConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics repository
// ---------------------------------------------------------------------------

/// Time-series database the metrics bundle writes into.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsRepositoryConfig {
    pub location: String,
    pub database: String,
}

impl Default for MetricsRepositoryConfig {
    fn default() -> Self {
        Self {
            location: "http://localhost:8086".to_string(),
            database: "metrics".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Custom base template. The built-in one is used when unset.
    pub template_path: Option<PathBuf>,
    /// Runner version installed when a test has no requirements file.
    pub robot_version: String,
    /// Python modules installed before the tests run.
    pub test_python_modules: Vec<String>,
    /// Python modules installed before the metrics bundle runs.
    pub metrics_python_modules: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            template_path: None,
            robot_version: "6.0.2".to_string(),
            test_python_modules: vec![
                "robotframework==4.1.1".to_string(),
                "paramiko==2.7.2".to_string(),
                "python3-nmap==1.5.1".to_string(),
            ],
            metrics_python_modules: vec![
                "scp==0.14.1".to_string(),
                "robotframework==4.1.1".to_string(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Root directory of the local artifact warehouse.
    pub warehouse_dir: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            warehouse_dir: PathBuf::from("warehouse"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
