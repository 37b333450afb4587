// Worker configuration: environment settings plus the sandbox profile file
use mithril_common::config::{self as env, ConfigError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_SANDBOX_CONFIG: &str = "config/sandbox.json";

/// Resource limits and image for sandboxed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxProfile {
    pub image: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub pids_limit: i64,
    pub network_disabled: bool,
    pub output_limit_kb: usize,
}

impl Default for SandboxProfile {
    fn default() -> Self {
        Self {
            image: "gcc:13".to_string(),
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            pids_limit: 64,
            network_disabled: true,
            output_limit_kb: 1024,
        }
    }
}

impl SandboxProfile {
    /// Load a profile from JSON
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let profile: SandboxProfile =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        if profile.memory_limit_mb == 0 {
            return Err(invalid_limit("memory_limit_mb", "0", path));
        }
        if profile.cpu_limit <= 0.0 {
            return Err(invalid_limit("cpu_limit", &profile.cpu_limit.to_string(), path));
        }
        Ok(profile)
    }

    /// Load from `path`, using built-in defaults when the file is absent
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit as f64 * 1_000_000_000.0) as i64
    }

    pub fn output_limit_bytes(&self) -> usize {
        self.output_limit_kb * 1024
    }
}

fn invalid_limit(key: &str, value: &str, path: &Path) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: format!("sandbox limits in {} must be positive", path.display()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Process,
    Docker,
}

impl FromStr for SandboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(SandboxKind::Process),
            "docker" => Ok(SandboxKind::Docker),
            other => Err(format!("unknown sandbox '{}', expected process or docker", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub nats_url: String,
    pub exercises_dir: PathBuf,
    pub work_root: PathBuf,
    pub max_concurrent_jobs: usize,
    pub sandbox: SandboxKind,
    pub sandbox_config: PathBuf,
    pub redis_url: Option<String>,
    pub cache_ttl_secs: u64,
    pub metrics_addr: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_concurrent_jobs = env::env_parse("MAX_CONCURRENT_JOBS", 4usize)?;
        if max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_CONCURRENT_JOBS".to_string(),
                value: "0".to_string(),
                reason: "at least one job slot is required".to_string(),
            });
        }

        Ok(Self {
            nats_url: env::nats_url(),
            exercises_dir: PathBuf::from(env::env_or("EXERCISES_DIR", "exercises")),
            work_root: env::env_opt("WORK_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            max_concurrent_jobs,
            sandbox: env::env_parse("SANDBOX", SandboxKind::Process)?,
            sandbox_config: PathBuf::from(env::env_or("SANDBOX_CONFIG", DEFAULT_SANDBOX_CONFIG)),
            redis_url: env::env_opt("REDIS_URL"),
            cache_ttl_secs: env::env_parse("CACHE_TTL_SECS", 3600u64)?,
            metrics_addr: env::env_or("METRICS_ADDR", "0.0.0.0:9101"),
        })
    }
}
