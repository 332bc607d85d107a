use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// What to do once a backend is caught violating handle identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptionPolicy {
    /// Log the conflicting identities, then terminate the process.
    #[default]
    Abort,
    /// Log the conflicting identities and fail only the current request.
    Reject,
}

/// Static properties of the exported filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FsInfo {
    /// Upper bound for sizes set through setattr and for writes.
    pub max_file_size: u64,
    pub max_name_len: usize,
    pub umask: u32,
    pub can_set_time: bool,
    /// Without it, lock upcalls only invalidate.
    pub lock_support: bool,
    pub dirs_have_sticky_bit: bool,
}

impl Default for FsInfo {
    fn default() -> Self {
        FsInfo {
            max_file_size: u64::MAX,
            max_name_len: 1024,
            umask: 0,
            can_set_time: true,
            lock_support: true,
            dirs_have_sticky_bit: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub corruption_policy: CorruptionPolicy,
    /// Entry count above which the reclaimer starts dropping unreferenced entries.
    pub entries_hwmark: usize,
    pub reclaim_interval_ms: u64,
    /// Events the upcall queue holds before further submissions are dropped.
    pub upcall_queue_depth: usize,
    pub fs_info: FsInfo,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            corruption_policy: CorruptionPolicy::Abort,
            entries_hwmark: 100_000,
            reclaim_interval_ms: 1000,
            upcall_queue_depth: 4096,
            fs_info: FsInfo::default(),
        }
    }
}

impl CacheConfig {
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms.max(1))
    }
}

pub fn parse_config(content: &str) -> Result<CacheConfig> {
    let cfg: CacheConfig =
        serde_yaml::from_str(content).context("Failed to parse YAML cache config")?;
    Ok(cfg)
}

pub fn load_config(path: &str) -> Result<CacheConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    parse_config(&content)
}
