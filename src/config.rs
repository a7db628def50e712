//! TOML configuration -- scheduler preferences with compiled-in defaults,
//! an environment-variable override for the config file path, and CLI flags
//! layered on top by the caller.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrency budget: how many test processes may run at once.
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
    /// Scheduler tick period, seconds.
    #[serde(default = "default_refresh_rate")]
    pub refresh_rate: f64,
    /// Resource monitor sampling period, seconds.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Default run mode: restart, resume or check.
    #[serde(default = "default_run_mode")]
    pub run_mode: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_processes: default_max_processes(),
            refresh_rate: default_refresh_rate(),
            sample_rate: default_sample_rate(),
            run_mode: default_run_mode(),
        }
    }
}

/// The opaque test-execution engine: a program invoked with the unit path
/// appended as its final argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_runner_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: default_runner_program(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Directory walked for test units.
    #[serde(default = "default_discovery_dir")]
    pub dir: String,
    /// Substring a file name must contain to count as a test unit.
    #[serde(default = "default_discovery_pattern")]
    pub pattern: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            dir: default_discovery_dir(),
            pattern: default_discovery_pattern(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_max_processes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_refresh_rate() -> f64 {
    1.0
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_run_mode() -> String {
    "restart".to_string()
}

fn default_runner_program() -> String {
    "sh".to_string()
}

fn default_discovery_dir() -> String {
    "tests".to_string()
}

fn default_discovery_pattern() -> String {
    "test".to_string()
}

fn default_db_path() -> String {
    "testflight.db".to_string()
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `TESTFLIGHT_CONFIG` environment variable.
    /// 2. `testflight.toml` in the working directory.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("TESTFLIGHT_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(path = %path.display(), "config override failed, falling back: {}", e);
                }
            }
        }

        let local = Path::new("testflight.toml");
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => warn!("local config failed, using defaults: {}", e),
            }
        }

        Self::default()
    }
}
