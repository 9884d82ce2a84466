//! Engine configuration
//!
//! Loaded from an optional TOML file, then overridden by `CODEBOX_*`
//! environment variables. Every field has a default so a missing file or a
//! partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};
use crate::policy::{QuotaLimits, ResourceLimits, EXECUTE_TOOL};

pub const CODEBOX_CONFIG: &str = "CODEBOX_CONFIG";
pub const CODEBOX_PYTHON: &str = "CODEBOX_PYTHON";
pub const CODEBOX_MAX_EXECUTION_SECS: &str = "CODEBOX_MAX_EXECUTION_SECS";
pub const CODEBOX_MAX_MEMORY_MB: &str = "CODEBOX_MAX_MEMORY_MB";
pub const CODEBOX_MAX_OUTPUT_BYTES: &str = "CODEBOX_MAX_OUTPUT_BYTES";
pub const CODEBOX_MAX_NPROC: &str = "CODEBOX_MAX_NPROC";
pub const CODEBOX_MAX_EXECUTIONS: &str = "CODEBOX_MAX_EXECUTIONS";
pub const CODEBOX_MAX_TOOL_EXECUTIONS: &str = "CODEBOX_MAX_TOOL_EXECUTIONS";
pub const CODEBOX_MAX_CONSECUTIVE_FAILURES: &str = "CODEBOX_MAX_CONSECUTIVE_FAILURES";
pub const CODEBOX_POOL_SIZE: &str = "CODEBOX_POOL_SIZE";
pub const CODEBOX_HISTORY_SIZE: &str = "CODEBOX_HISTORY_SIZE";
pub const CODEBOX_ARTIFACT_DIR: &str = "CODEBOX_ARTIFACT_DIR";
pub const CODEBOX_PUBLIC_BASE_URL: &str = "CODEBOX_PUBLIC_BASE_URL";

const MAX_POOL_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interpreter used to run the worker harness
    pub python_path: PathBuf,
    pub limits: ResourceLimits,
    pub quota: QuotaLimits,
    pub pool: PoolConfig,
    pub history: HistoryConfig,
    pub cache: CacheConfig,
    pub artifacts: ArtifactConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            limits: ResourceLimits::default(),
            quota: QuotaLimits::default(),
            pool: PoolConfig::default(),
            history: HistoryConfig::default(),
            cache: CacheConfig::default(),
            artifacts: ArtifactConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of isolates allowed to run at once across all conversations
    pub size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { size: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_entries: 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Deterministic analysis operations whose results may be memoized
    pub cacheable_tools: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cacheable_tools: vec![
                "correlation_analysis".to_string(),
                "hypothesis_test".to_string(),
                "distribution_analysis".to_string(),
                "get_column_info".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Directory published artifacts are written to
    pub root: PathBuf,
    /// Origin prepended to every artifact URL
    pub public_base_url: String,
    /// Path under which the file-serving layer exposes `root`
    pub route_prefix: String,
    /// Worker outputs larger than this are dropped
    pub max_artifact_bytes: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("output/plots"),
            public_base_url: "http://localhost:8000".to_string(),
            route_prefix: "/api/v2/files/plots".to_string(),
            max_artifact_bytes: 10 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `path` (or `CODEBOX_CONFIG` when `path` is None),
    /// apply environment overrides and validate the result.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let from_env = std::env::var(CODEBOX_CONFIG).ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> EngineResult<Self> {
        toml::from_str(raw).map_err(|e| EngineError::Config(format!("Invalid TOML: {}", e)))
    }

    /// Apply `CODEBOX_*` overrides on top of the current values.
    pub fn apply_env(&mut self) -> EngineResult<()> {
        if let Some(python) = env_string(CODEBOX_PYTHON) {
            self.python_path = PathBuf::from(python);
        }
        if let Some(secs) = env_parse::<u64>(CODEBOX_MAX_EXECUTION_SECS)? {
            self.limits.wall_clock_secs = secs;
        }
        if let Some(mb) = env_parse::<u64>(CODEBOX_MAX_MEMORY_MB)? {
            self.limits.memory_mb = mb;
        }
        if let Some(bytes) = env_parse::<usize>(CODEBOX_MAX_OUTPUT_BYTES)? {
            self.limits.max_output_bytes = bytes;
        }
        if let Some(nproc) = env_parse::<u64>(CODEBOX_MAX_NPROC)? {
            self.limits.max_processes = Some(nproc).filter(|v| *v > 0);
        }
        if let Some(max) = env_parse::<u32>(CODEBOX_MAX_EXECUTIONS)? {
            self.quota.max_executions = max;
        }
        if let Some(max) = env_parse::<u32>(CODEBOX_MAX_TOOL_EXECUTIONS)? {
            self.quota.per_tool.insert(EXECUTE_TOOL.to_string(), max);
        }
        if let Some(max) = env_parse::<u32>(CODEBOX_MAX_CONSECUTIVE_FAILURES)? {
            self.quota.max_consecutive_failures = max;
        }
        if let Some(size) = env_parse::<usize>(CODEBOX_POOL_SIZE)? {
            self.pool.size = size;
        }
        if let Some(size) = env_parse::<usize>(CODEBOX_HISTORY_SIZE)? {
            self.history.max_entries = size;
        }
        if let Some(dir) = env_string(CODEBOX_ARTIFACT_DIR) {
            self.artifacts.root = PathBuf::from(dir);
        }
        if let Some(url) = env_string(CODEBOX_PUBLIC_BASE_URL) {
            self.artifacts.public_base_url = url;
        }
        Ok(())
    }

    /// Reject unusable settings; clamps the pool size into its supported range.
    pub fn validate(&mut self) -> EngineResult<()> {
        if self.limits.wall_clock_secs == 0 {
            return Err(EngineError::Config(
                "limits.wall_clock_secs must be greater than zero".to_string(),
            ));
        }
        if self.pool.size == 0 {
            return Err(EngineError::Config(
                "pool.size must be greater than zero".to_string(),
            ));
        }
        if self.pool.size > MAX_POOL_SIZE {
            tracing::warn!(
                "pool.size {} exceeds {}, clamping",
                self.pool.size,
                MAX_POOL_SIZE
            );
            self.pool.size = MAX_POOL_SIZE;
        }
        if self.history.max_entries == 0 {
            return Err(EngineError::Config(
                "history.max_entries must be greater than zero".to_string(),
            ));
        }
        if self.python_path.as_os_str().is_empty() {
            return Err(EngineError::Config("python_path is empty".to_string()));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> EngineResult<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::Config(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(None),
    }
}
