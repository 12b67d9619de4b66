use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of worker tasks driving jobs.
pub const DEFAULT_WORKER_COUNT: usize = 25;

/// Default hard limit on job files in the live queue directory.
pub const DEFAULT_MAX_LIVE_JOBS: usize = 5000;

/// Default number of parsed job records kept in memory.
pub const DEFAULT_JOB_CACHE_SIZE: usize = 128;

/// Port node daemons listen on for RPC calls.
pub const DEFAULT_RPC_PORT: u16 = 1811;

/// Job queue storage settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Directory holding job files, the serial, version and drain files.
    pub queue_dir: PathBuf,
    /// Live (non-archived) job files allowed before submissions are refused.
    pub max_live_jobs: usize,
    /// Capacity of the parsed job cache.
    pub cache_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_dir: PathBuf::from("/var/lib/opqueue/queue"),
            max_live_jobs: DEFAULT_MAX_LIVE_JOBS,
            cache_size: DEFAULT_JOB_CACHE_SIZE,
        }
    }
}

impl QueueConfig {
    pub fn new(queue_dir: impl Into<PathBuf>) -> Self {
        Self {
            queue_dir: queue_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_max_live_jobs(mut self, max_live_jobs: usize) -> Self {
        self.max_live_jobs = max_live_jobs;
        self
    }
}

/// Lock attempt timing.
///
/// Attempts start at `min_wait_ms` and grow towards `max_wait_ms` until their
/// sum reaches `total_ms`. After that an opcode's priority is raised, and at
/// the highest priority it waits up to `blocking_cap_ms` per attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct LockTimeoutConfig {
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
    pub total_ms: u64,
    pub blocking_cap_ms: u64,
}

impl Default for LockTimeoutConfig {
    fn default() -> Self {
        Self {
            min_wait_ms: 1_000,
            max_wait_ms: 15_000,
            total_ms: 1_800_000,
            blocking_cap_ms: 3_600_000,
        }
    }
}

impl LockTimeoutConfig {
    pub fn blocking_cap(&self) -> Duration {
        Duration::from_millis(self.blocking_cap_ms)
    }
}

/// Node RPC client settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub port: u16,
    pub timeout_ms: u64,
    /// Total attempts for calls failing with a transport error or timeout.
    pub max_attempts: u32,
    /// Initial delay between attempts, doubled after each retry.
    pub backoff_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_RPC_PORT,
            timeout_ms: 60_000,
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// What a failing post-execution hook does to its opcode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HookFailurePolicy {
    /// Record the failure in the job log and keep the opcode result.
    #[default]
    Warn,
    /// Fail the opcode.
    Fatal,
}

impl std::fmt::Display for HookFailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookFailurePolicy::Warn => write!(f, "warn"),
            HookFailurePolicy::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: SocketAddr,
    pub worker_count: usize,
    pub queue: QueueConfig,
    pub lock_timeouts: LockTimeoutConfig,
    pub rpc: RpcConfig,
    pub hook_failure_policy: HookFailurePolicy,
    /// JSON file backing the cluster configuration. In-memory when unset.
    pub cluster_config_path: Option<PathBuf>,
    /// Finalized jobs older than this are archived periodically.
    pub auto_archive_age_secs: Option<u64>,
    pub auto_archive_interval_secs: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5080)),
            worker_count: DEFAULT_WORKER_COUNT,
            queue: QueueConfig::default(),
            lock_timeouts: LockTimeoutConfig::default(),
            rpc: RpcConfig::default(),
            hook_failure_policy: HookFailurePolicy::default(),
            cluster_config_path: None,
            auto_archive_age_secs: None,
            auto_archive_interval_secs: 300,
        }
    }
}

impl MasterConfig {
    pub fn new(listen_addr: SocketAddr, queue_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr,
            queue: QueueConfig::new(queue_dir),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_cluster_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.cluster_config_path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_config_default() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.max_live_jobs, 5000);
        assert_eq!(cfg.cache_size, 128);
    }

    #[test]
    fn queue_config_builder() {
        let cfg = QueueConfig::new("/tmp/q").with_max_live_jobs(3);
        assert_eq!(cfg.queue_dir, PathBuf::from("/tmp/q"));
        assert_eq!(cfg.max_live_jobs, 3);
        assert_eq!(cfg.cache_size, DEFAULT_JOB_CACHE_SIZE);
    }

    #[test]
    fn lock_timeout_config_default() {
        let cfg = LockTimeoutConfig::default();
        assert_eq!(cfg.min_wait_ms, 1_000);
        assert_eq!(cfg.max_wait_ms, 15_000);
        assert_eq!(cfg.total_ms, 1_800_000);
        assert_eq!(cfg.blocking_cap(), Duration::from_secs(3600));
    }

    #[test]
    fn rpc_config_default() {
        let cfg = RpcConfig::default();
        assert_eq!(cfg.port, 1811);
        assert_eq!(cfg.timeout(), Duration::from_secs(60));
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.backoff(), Duration::from_millis(500));
    }

    #[test]
    fn hook_failure_policy_defaults_to_warn() {
        assert_eq!(HookFailurePolicy::default(), HookFailurePolicy::Warn);
        assert_eq!(HookFailurePolicy::Fatal.to_string(), "fatal");
    }

    #[test]
    fn master_config_default() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:5080");
        assert_eq!(cfg.worker_count, 25);
        assert!(cfg.cluster_config_path.is_none());
        assert!(cfg.auto_archive_age_secs.is_none());
    }

    #[test]
    fn master_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = MasterConfig::new(addr, "/srv/queue")
            .with_workers(4)
            .with_cluster_config("/srv/cluster.json");
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.worker_count, 4);
        assert_eq!(cfg.queue.queue_dir, PathBuf::from("/srv/queue"));
        assert_eq!(
            cfg.cluster_config_path,
            Some(PathBuf::from("/srv/cluster.json"))
        );
    }
}
