//! Cache layer configuration.
//!
//! All knobs the embedding engine can turn live here. The struct is designed
//! to deserialize from the engine's configuration file, with sane defaults for
//! every field so an empty table is a valid configuration (apart from the
//! cache root, which the registry validates at construction time).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use bytesize::ByteSize;
use serde::Deserialize;

use crate::fs::FilesystemDescriptor;

fn default_size_hard_limit() -> ByteSize {
    ByteSize::gib(20)
}

fn default_mem_limit_percent() -> u8 {
    80
}

fn default_eviction_timeslice_ms() -> u64 {
    30_000
}

fn default_fs_timeout_base_ms() -> u64 {
    20_000
}

fn default_fs_retries() -> u32 {
    5
}

fn default_fs_backoff_base_ms() -> u64 {
    2_000
}

fn default_failure_cooldown_ms() -> u64 {
    300_000
}

fn default_executor_workers() -> usize {
    32
}

/// Timeout/retry tuning for remote filesystem calls. A global instance lives
/// in [`CacheConfig`]; individual descriptors may override it.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FsTuning {
    /// Permitted duration of a single remote API attempt.
    #[serde(default = "default_fs_timeout_base_ms")]
    pub fs_timeout_base_ms: u64,

    /// Number of attempts for a remote API call. Retries happen only on
    /// timeout or failure, never on a successful negative answer.
    #[serde(default = "default_fs_retries")]
    pub fs_retries: u32,

    /// Base delay unit for the arithmetic-multiple backoff between retries.
    /// The delay before retry `k` is `2 * k * base`, counting from zero, so
    /// the first retry fires immediately.
    #[serde(default = "default_fs_backoff_base_ms")]
    pub fs_backoff_base_ms: u64,
}

impl Default for FsTuning {
    fn default() -> Self {
        Self {
            fs_timeout_base_ms: default_fs_timeout_base_ms(),
            fs_retries: default_fs_retries(),
            fs_backoff_base_ms: default_fs_backoff_base_ms(),
        }
    }
}

impl FsTuning {
    /// Per-attempt timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.fs_timeout_base_ms)
    }

    /// Backoff base unit as a [`Duration`].
    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.fs_backoff_base_ms)
    }
}

/// Top-level cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Absolute path of the local working area. Must exist and be writable;
    /// everything underneath is owned by the cache and may be re-created.
    pub cache_root: PathBuf,

    /// Hard bound on the total size of materialized (ready) files.
    #[serde(default = "default_size_hard_limit")]
    pub cache_size_hard_limit: ByteSize,

    /// Fraction of process memory the cache bookkeeping may claim. Kept for
    /// parity with the embedding engine's sizing knobs; the on-disk bound is
    /// what the eviction engine actually enforces.
    #[serde(default = "default_mem_limit_percent")]
    pub cache_mem_limit_percent: u8,

    /// Cadence of the background eviction sweep.
    #[serde(default = "default_eviction_timeslice_ms")]
    pub cache_eviction_timeslice_ms: u64,

    /// Default filesystem URI (e.g. `hdfs://namenode:8020`) used to resolve
    /// descriptors registered with a `default` host.
    #[serde(default)]
    pub fs_default_name: Option<String>,

    /// Global remote-call tuning.
    #[serde(flatten)]
    pub fs_tuning: FsTuning,

    /// Cooldown before a failed download may be attempted again.
    #[serde(default = "default_failure_cooldown_ms")]
    pub fs_failure_cooldown_ms: u64,

    /// Upper bound on concurrently running bridged remote calls.
    #[serde(default = "default_executor_workers")]
    pub fs_executor_workers: usize,

    /// Per-descriptor overrides of the remote-call tuning, keyed by the
    /// descriptor authority string (`scheme://host:port`).
    #[serde(default)]
    pub fs_overrides: HashMap<String, FsTuning>,
}

impl CacheConfig {
    /// Minimal configuration rooted at `cache_root`, everything else default.
    #[must_use]
    pub fn rooted(cache_root: PathBuf) -> Self {
        Self {
            cache_root,
            cache_size_hard_limit: default_size_hard_limit(),
            cache_mem_limit_percent: default_mem_limit_percent(),
            cache_eviction_timeslice_ms: default_eviction_timeslice_ms(),
            fs_default_name: None,
            fs_tuning: FsTuning::default(),
            fs_failure_cooldown_ms: default_failure_cooldown_ms(),
            fs_executor_workers: default_executor_workers(),
            fs_overrides: HashMap::new(),
        }
    }

    /// Resolve the tuning for a descriptor: its override if one is configured,
    /// otherwise the global values.
    #[must_use]
    pub fn tuning_for(&self, descriptor: &FilesystemDescriptor) -> FsTuning {
        self.fs_overrides
            .get(&descriptor.uri())
            .copied()
            .unwrap_or(self.fs_tuning)
    }

    /// Eviction sweep cadence as a [`Duration`].
    #[must_use]
    pub fn eviction_timeslice(&self) -> Duration {
        Duration::from_millis(self.cache_eviction_timeslice_ms)
    }

    /// Failed-download cooldown as a [`Duration`].
    #[must_use]
    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_millis(self.fs_failure_cooldown_ms)
    }

    /// Hard size limit in bytes.
    #[must_use]
    pub fn size_hard_limit(&self) -> u64 {
        self.cache_size_hard_limit.as_u64()
    }
}
