use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::cluster::{ClusterConfig, ConfigStore, JsonConfigStore};
use crate::config::MasterConfig;
use crate::locking::LockManager;
use crate::processor::Processor;
use crate::rpc::{HttpNodeRpc, NodeRpc, RetryingRpc};
use crate::scheduler::JobQueue;
use crate::worker::WorkerPool;

/// Time budget of one periodic auto-archive pass.
const AUTO_ARCHIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// The master daemon: queue, processor, worker pool and API.
pub struct Master {
    pub config: MasterConfig,
    pub queue: Arc<JobQueue>,
    pub locks: Arc<LockManager>,
    pub processor: Arc<Processor>,
}

impl Master {
    /// Open the cluster configuration and the job queue.
    ///
    /// Jobs left by a previous run are recovered here and start running as
    /// soon as [`Master::run`] spawns the workers.
    pub fn new(config: MasterConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let cluster: Arc<dyn ConfigStore> = match &config.cluster_config_path {
            Some(path) => Arc::new(JsonConfigStore::open(path, default_cluster)?),
            None => Arc::new(JsonConfigStore::in_memory(default_cluster())),
        };
        let rpc: Arc<dyn NodeRpc> = Arc::new(RetryingRpc::new(
            HttpNodeRpc::new(config.rpc.port, cluster.clone()),
            config.rpc.max_attempts,
            config.rpc.backoff(),
        ));

        let locks = Arc::new(LockManager::new());
        let queue = JobQueue::open(&config.queue, config.lock_timeouts.clone())?;
        let processor = Arc::new(Processor::new(
            locks.clone(),
            cluster,
            rpc,
            config.rpc.timeout(),
            config.hook_failure_policy,
        ));

        Ok(Self {
            config,
            queue,
            locks,
            processor,
        })
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// 1. Spawns the worker pool
    /// 2. Spawns the periodic auto-archiver if an age is configured
    /// 3. Serves the API
    ///
    /// On shutdown the API stops accepting requests and workers finish the
    /// step they are in. Jobs still unfinished are resumed by the next run.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            listen_addr = %self.config.listen_addr,
            workers = self.config.worker_count,
            queue_dir = %self.config.queue.queue_dir.display(),
            "Starting master"
        );

        let pool = WorkerPool::spawn(
            self.queue.clone(),
            self.processor.clone(),
            self.config.worker_count,
            shutdown.clone(),
        );

        if let Some(age_secs) = self.config.auto_archive_age_secs {
            let queue = self.queue.clone();
            let interval = Duration::from_secs(self.config.auto_archive_interval_secs.max(1));
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                auto_archive_loop(queue, Duration::from_secs(age_secs), interval, shutdown).await;
            });
        }

        let state = ApiState {
            queue: self.queue.clone(),
            locks: self.locks.clone(),
        };
        let api_shutdown = shutdown.clone();
        let api = tokio::spawn(run_api(self.config.listen_addr, state, api_shutdown));

        shutdown.cancelled().await;
        tracing::info!("Shutting down master");
        pool.shutdown().await;
        if let Err(e) = api.await {
            tracing::error!(error = %e, "API task failed");
        }
        tracing::info!("Master stopped");
    }
}

fn default_cluster() -> ClusterConfig {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    ClusterConfig::new("cluster", hostname)
}

async fn auto_archive_loop(
    queue: Arc<JobQueue>,
    age: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let pass = queue.clone();
                let result = tokio::task::spawn_blocking(move || {
                    pass.auto_archive_jobs(Some(age), AUTO_ARCHIVE_TIMEOUT)
                })
                .await;
                match result {
                    Ok(Ok((archived, remaining))) if archived > 0 || remaining > 0 => {
                        tracing::debug!(archived, remaining, "Auto-archive pass done");
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "Auto-archive failed"),
                    Err(e) => tracing::error!(error = %e, "Auto-archive task failed"),
                }
            }
        }
    }
}
