//! Engine configuration
//!
//! Loaded from a TOML file merged over built-in defaults. Every knob the
//! executor, dataset provider, and sandbox substrate expose is reachable
//! from here; the CLI maps a few of them onto flags.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use edgeql_sandbox::{ImageCatalog, NodeRuntime, ReaperConfig, ResourceLimits, SandboxRunnerConfig};

use crate::error::{Error, Result};
use crate::executor::ExecutorConfig;

fn default_datasets_dir() -> PathBuf {
    PathBuf::from("datasets")
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("edgeql")
}

fn default_workers() -> usize {
    ExecutorConfig::default_workers()
}

fn default_node_timeout_ms() -> u64 {
    60_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

/// Sandbox-related settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Explicit container driver binary; discovered on PATH when unset
    pub driver_binary: Option<PathBuf>,
    /// CPU cap in fractional cores
    pub cpus: f64,
    /// Memory cap in MiB
    pub memory_mib: u64,
    /// tmpfs size for `/tmp` in MiB
    pub tmpfs_mib: u64,
    /// Grace period before force-kill on cancellation, in milliseconds
    pub grace_period_ms: u64,
    /// Container start deadline in milliseconds
    pub container_start_timeout_ms: u64,
    /// Image override for JavaScript nodes
    pub image_js: Option<String>,
    /// Image override for Python nodes
    pub image_python: Option<String>,
    /// Image override for wasm nodes
    pub image_wasm: Option<String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            driver_binary: None,
            cpus: limits.cpus,
            memory_mib: limits.memory_mib,
            tmpfs_mib: limits.tmpfs_mib,
            grace_period_ms: limits.grace_period.as_millis() as u64,
            container_start_timeout_ms: limits.container_start.as_millis() as u64,
            image_js: None,
            image_python: None,
            image_wasm: None,
        }
    }
}

/// Reaper settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    /// Seconds between sweeps
    pub interval_secs: u64,
    /// Minimum orphan age in seconds before collection
    pub max_age_secs: u64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        let config = ReaperConfig::default();
        Self {
            interval_secs: config.interval.as_secs(),
            max_age_secs: config.max_age.as_secs(),
        }
    }
}

/// The full engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory datasets are resolved against
    pub datasets_dir: PathBuf,
    /// Custom-node discovery root; no custom nodes when unset
    pub custom_nodes_dir: Option<PathBuf>,
    /// Root for per-invocation sandbox working directories
    pub scratch_dir: PathBuf,
    /// Worker pool size
    pub workers: usize,
    /// Default per-node wall clock in milliseconds
    pub default_node_timeout_ms: u64,
    /// Bounded drain after fail-fast or cancellation, in milliseconds
    pub drain_timeout_ms: u64,
    /// Sandbox settings
    pub sandbox: SandboxSettings,
    /// Reaper settings
    pub reaper: ReaperSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            datasets_dir: default_datasets_dir(),
            custom_nodes_dir: None,
            scratch_dir: default_scratch_dir(),
            workers: default_workers(),
            default_node_timeout_ms: default_node_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            sandbox: SandboxSettings::default(),
            reaper: ReaperSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)?;
        toml::from_str(&body)
            .map_err(|err| Error::Execution(format!("{}: {err}", path.display())))
    }

    /// Executor configuration derived from these settings.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            workers: self.workers.max(1),
            default_node_timeout: Duration::from_millis(self.default_node_timeout_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }

    /// Default resource limits for sandboxed nodes.
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits::default()
            .with_cpus(self.sandbox.cpus)
            .with_memory_mib(self.sandbox.memory_mib)
            .with_wall_clock(Duration::from_millis(self.default_node_timeout_ms))
            .with_grace_period(Duration::from_millis(self.sandbox.grace_period_ms))
    }

    /// Sandbox runner configuration.
    pub fn sandbox_runner_config(&self) -> SandboxRunnerConfig {
        let mut images = ImageCatalog::default();
        if let Some(image) = &self.sandbox.image_js {
            images = images.with_image(NodeRuntime::Javascript, image);
        }
        if let Some(image) = &self.sandbox.image_python {
            images = images.with_image(NodeRuntime::Python, image);
        }
        if let Some(image) = &self.sandbox.image_wasm {
            images = images.with_image(NodeRuntime::Wasm, image);
        }
        SandboxRunnerConfig {
            driver_binary: self.sandbox.driver_binary.clone(),
            scratch_root: self.scratch_dir.clone(),
            datasets_dir: Some(self.datasets_dir.clone()),
            images,
        }
    }

    /// Reaper configuration.
    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.reaper.interval_secs),
            max_age: Duration::from_secs(self.reaper.max_age_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.datasets_dir, PathBuf::from("datasets"));
        assert!(config.custom_nodes_dir.is_none());
        assert!(config.workers >= 1 && config.workers <= 4);
        assert_eq!(config.default_node_timeout_ms, 60_000);
        assert_eq!(config.sandbox.memory_mib, 512);
        assert_eq!(config.sandbox.tmpfs_mib, 100);
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edgeql.toml");
        std::fs::write(
            &path,
            r#"
datasets_dir = "/data/ohlcv"
workers = 2

[sandbox]
memory_mib = 256
image_python = "registry.local/edgeql-py:3.12"

[reaper]
max_age_secs = 600
"#,
        )
        .unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.datasets_dir, PathBuf::from("/data/ohlcv"));
        assert_eq!(config.workers, 2);
        // Unset fields keep defaults
        assert_eq!(config.default_node_timeout_ms, 60_000);
        assert_eq!(config.sandbox.memory_mib, 256);
        assert_eq!(config.sandbox.cpus, 1.0);
        assert_eq!(config.reaper.max_age_secs, 600);
        assert_eq!(config.reaper.interval_secs, 300);
    }

    #[test]
    fn test_load_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "workers = \"many\"").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(EngineConfig::load(std::path::Path::new("/nonexistent.toml")).is_err());
    }

    #[test]
    fn test_derived_configs() {
        let mut config = EngineConfig::default();
        config.workers = 0; // degenerate value clamps to 1
        config.sandbox.image_js = Some("edgeql/js:next".to_string());
        assert_eq!(config.executor_config().workers, 1);

        let limits = config.resource_limits();
        assert_eq!(limits.wall_clock, Duration::from_secs(60));

        let sandbox = config.sandbox_runner_config();
        assert_eq!(
            sandbox.images.image_for(NodeRuntime::Javascript),
            "edgeql/js:next"
        );
        assert_eq!(
            sandbox.images.image_for(NodeRuntime::Python),
            "edgeql/runtime-python:latest"
        );
        assert_eq!(sandbox.datasets_dir, Some(PathBuf::from("datasets")));

        let reaper = config.reaper_config();
        assert_eq!(reaper.interval, Duration::from_secs(300));
    }

    #[test]
    fn test_roundtrip_serialization() {
        let config = EngineConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
