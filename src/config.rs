//! JSON configuration loader.
//!
//! Mirrors the teacher's layered CLI/env/file configuration resolution:
//! a `clap::Parser` locates the config file (flag, falling back to an
//! environment variable), `serde` deserializes it with per-field defaults,
//! and a small validation pass enforces the fields the spec calls required.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Parser)]
#[command(name = "eval-server", about = "Remote sandboxed code-evaluation service")]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "EVAL_SERVER_CONFIG")]
    pub config: PathBuf,

    /// Emit newline-delimited JSON logs instead of the human-readable format.
    #[arg(long, default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: Option<u16>,
    pub auth: Option<String>,

    #[serde(default = "default_queue_size", rename = "queueSize")]
    pub queue_size: u32,
    #[serde(default = "default_fetch_timeout_ms", rename = "fetchTimeout")]
    pub fetch_timeout_ms: u64,
    #[serde(
        default = "default_fetch_max_response_length",
        rename = "fetchMaxResponseLength"
    )]
    pub fetch_max_response_length: usize,
    #[serde(
        default = "default_max_fetch_concurrency",
        rename = "maxFetchConcurrency"
    )]
    pub max_fetch_concurrency: usize,
    #[serde(default = "default_workers_timeout_ms", rename = "workersTimeOut")]
    pub workers_timeout_ms: u64,
    #[serde(default = "default_vm_memory_limit_mb", rename = "vmMemoryLimit")]
    pub vm_memory_limit_mb: u64,
    #[serde(default = "default_vm_timeout_ms", rename = "vmTimeout")]
    pub vm_timeout_ms: u64,
    #[serde(
        default = "default_max_child_process_count",
        rename = "maxChildProcessCount"
    )]
    pub max_child_process_count: usize,

    #[serde(rename = "redisHost")]
    pub redis_host: Option<String>,
    #[serde(default = "default_redis_port", rename = "redisPort")]
    pub redis_port: u16,
}

fn default_queue_size() -> u32 {
    20
}
fn default_fetch_timeout_ms() -> u64 {
    15_000
}
fn default_fetch_max_response_length() -> usize {
    10_000
}
fn default_max_fetch_concurrency() -> usize {
    5
}
fn default_workers_timeout_ms() -> u64 {
    600_000
}
fn default_vm_memory_limit_mb() -> u64 {
    32
}
fn default_vm_timeout_ms() -> u64 {
    14_000
}
fn default_max_child_process_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
fn default_redis_port() -> u16 {
    6379
}

/// Resolved, validated configuration used throughout the rest of the
/// service. `port`/`auth`/`redis_host` are required; everything else has a
/// default matching §6 of the specification.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub port: u16,
    pub auth: String,
    pub queue_size: u32,
    pub fetch_timeout_ms: u64,
    pub fetch_max_response_length: usize,
    pub max_fetch_concurrency: usize,
    pub workers_timeout_ms: u64,
    pub vm_memory_limit_mb: u64,
    pub vm_timeout_ms: u64,
    pub max_child_process_count: usize,
    pub redis_host: String,
    pub redis_port: u16,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn resolve(self) -> Result<ResolvedConfig, ConfigError> {
        Ok(ResolvedConfig {
            port: self.port.ok_or(ConfigError::MissingField("port"))?,
            auth: self.auth.ok_or(ConfigError::MissingField("auth"))?,
            redis_host: self
                .redis_host
                .ok_or(ConfigError::MissingField("redisHost"))?,
            queue_size: self.queue_size,
            fetch_timeout_ms: self.fetch_timeout_ms,
            fetch_max_response_length: self.fetch_max_response_length,
            max_fetch_concurrency: self.max_fetch_concurrency,
            workers_timeout_ms: self.workers_timeout_ms,
            vm_memory_limit_mb: self.vm_memory_limit_mb,
            vm_timeout_ms: self.vm_timeout_ms,
            max_child_process_count: self.max_child_process_count,
            redis_port: self.redis_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_port() {
        let cfg: Config =
            serde_json::from_str(r#"{"auth": "x", "redisHost": "localhost"}"#).unwrap();
        let err = cfg.resolve().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("port")));
    }

    #[test]
    fn fills_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"port": 8080, "auth": "x", "redisHost": "localhost"}"#)
                .unwrap();
        let resolved = cfg.resolve().unwrap();
        assert_eq!(resolved.queue_size, 20);
        assert_eq!(resolved.fetch_max_response_length, 10_000);
        assert_eq!(resolved.vm_timeout_ms, 14_000);
    }
}
