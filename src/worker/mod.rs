//! Worker pool executing queued jobs.
//!
//! - [`WorkerPool`]: a fixed number of tokio tasks pulling jobs from the
//!   queue's ready heap
//! - [`JobProcessor`]: runs one step of a job (one opcode attempt)
//!
//! # Execution Flow
//!
//! 1. A worker pops the most urgent ready job and claims it
//! 2. [`JobProcessor::run_step`] runs the current opcode under its locks
//! 3. Unfinished jobs go back to the ready heap; jobs waiting on a
//!    dependency are woken up when it finishes

pub mod executor;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, Result};
use crate::processor::Processor;
use crate::scheduler::{JobId, JobQueue};

pub use executor::{JobProcessor, StepOutcome};

/// Pause before retrying a job whose step failed on the queue itself.
const STEP_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `count` workers. They stop pulling jobs once `shutdown` is
    /// cancelled; a step in progress is finished first.
    pub fn spawn(
        queue: Arc<JobQueue>,
        processor: Arc<Processor>,
        count: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let mut workers = JoinSet::new();
        for worker_id in 0..count.max(1) {
            let runner = Arc::new(JobProcessor::new(
                queue.clone(),
                processor.clone(),
                shutdown.clone(),
            ));
            workers.spawn(worker_loop(worker_id, queue.clone(), runner, shutdown.clone()));
        }
        tracing::info!(workers = count.max(1), "Worker pool started");
        Self { workers }
    }

    /// Wait for every worker to exit.
    pub async fn shutdown(mut self) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<JobQueue>,
    runner: Arc<JobProcessor>,
    shutdown: CancellationToken,
) {
    loop {
        let job_id = tokio::select! {
            _ = shutdown.cancelled() => break,
            job_id = queue.next_ready() => job_id,
        };
        if !queue.begin_processing(job_id) {
            continue;
        }

        let reschedule = match run_isolated(&runner, job_id).await {
            Ok(StepOutcome::Continue) => true,
            Ok(StepOutcome::Deferred | StepOutcome::Finished) => false,
            Err(e) => {
                tracing::error!(worker_id, job_id, error = %e, "Job step failed");
                tokio::time::sleep(STEP_RETRY_DELAY).await;
                true
            }
        };
        queue.finish_processing(job_id, reschedule);
    }
    tracing::debug!(worker_id, "Worker stopped");
}

/// Run one step in a task of its own, so a panicking opcode fails its job
/// instead of taking the worker down.
async fn run_isolated(runner: &Arc<JobProcessor>, job_id: JobId) -> Result<StepOutcome> {
    let mut step = JoinSet::new();
    let task_runner = runner.clone();
    step.spawn(async move { task_runner.run_step(job_id).await });
    match step.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(e)) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            runner.fail_current(job_id, &format!("opcode panicked: {}", message))
        }
        Some(Err(e)) => Err(QueueError::Internal(e.to_string())),
        None => Ok(StepOutcome::Finished),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(_) => "unknown panic".to_string(),
    }
}
