use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{LockTimeoutConfig, QueueConfig};
use crate::error::{QueueError, Result};
use crate::locking::LockAttemptTimeoutStrategy;
use crate::opcodes::{InvalidOp, OpInput};
use crate::scheduler::deps::{ChangeNotifier, DepResult, DependencyManager};
use crate::scheduler::job::{
    CancelOutcome, Job, JobFilter, JobId, JobStatus, LogEntry, OpResult, OpStatus,
    CANCELED_MESSAGE,
};
use crate::scheduler::ready::ReadyQueue;
use crate::storage::JobStore;

/// Upper bound for a single long-poll.
pub const MAX_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// In-memory state of an unfinished job.
#[derive(Debug)]
pub(crate) struct LiveJob {
    pub job: Job,
    /// Lock attempt windows of the opcode at the given index.
    pub attempts: Option<(usize, LockAttemptTimeoutStrategy)>,
    processing: bool,
    requeue: bool,
    /// Bumped on every change of `job`.
    version: u64,
    /// Last version written to the store. Held while writing, so writes of
    /// one job happen one at a time and never go back to an older version.
    written: Arc<Mutex<u64>>,
}

/// Result of [`JobQueue::wait_for_job_change`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobChange {
    pub changed: bool,
    pub status: JobStatus,
    pub job: Job,
    pub log_entries: Vec<LogEntry>,
}

impl JobChange {
    fn compute(job: Job, prev_status: Option<JobStatus>, prev_log_serial: u64) -> Self {
        let status = job.calc_status();
        let log_entries = job.log_entries_after(prev_log_serial);
        Self {
            changed: prev_status != Some(status) || !log_entries.is_empty(),
            status,
            job,
            log_entries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub drained: bool,
    /// Job files in the live directory, finished or not.
    pub queue_size: usize,
    pub max_live_jobs: usize,
    pub last_serial: JobId,
    /// Unfinished jobs.
    pub live_jobs: usize,
    /// Jobs waiting for a worker.
    pub ready_jobs: usize,
}

/// The job queue: admission, persistence and bookkeeping of every job.
///
/// Unfinished jobs are kept in memory and written through to the
/// [`JobStore`] on every change. Finished jobs are only on disk.
pub struct JobQueue {
    store: JobStore,
    live: Mutex<HashMap<JobId, LiveJob>>,
    ready: ReadyQueue,
    changes: ChangeNotifier,
    deps: DependencyManager,
    lock_timeouts: LockTimeoutConfig,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("store", &self.store)
            .field("ready", &self.ready.len())
            .finish()
    }
}

impl JobQueue {
    /// Open the queue directory and recover jobs left by a previous run.
    ///
    /// Queued jobs are scheduled again. Jobs interrupted while waiting for
    /// locks or running have their unfinished opcodes reset to queued;
    /// successful opcodes are kept and not run again. Jobs being canceled
    /// are finished as canceled.
    pub fn open(config: &QueueConfig, lock_timeouts: LockTimeoutConfig) -> Result<Arc<Self>> {
        let queue = Self {
            store: JobStore::open(config)?,
            live: Mutex::new(HashMap::new()),
            ready: ReadyQueue::new(),
            changes: ChangeNotifier::new(),
            deps: DependencyManager::new(),
            lock_timeouts,
        };

        let mut recovered = 0;
        for id in queue.store.job_ids()? {
            let Some(mut job) = queue.store.load_job(id, false)? else {
                continue;
            };
            match job.calc_status() {
                status if status.is_finalized() => continue,
                JobStatus::Canceling => {
                    job.mark_unfinished(
                        OpStatus::Canceled,
                        Some(OpResult::Message(CANCELED_MESSAGE.to_string())),
                    );
                    job.finalize();
                    queue.store.update_job(&job)?;
                    tracing::info!(job_id = id, "Finished interrupted cancellation");
                    continue;
                }
                JobStatus::WaitLock | JobStatus::Running => {
                    job.requeue_interrupted();
                    queue.store.update_job(&job)?;
                    tracing::info!(job_id = id, "Requeued interrupted job");
                }
                _ => {}
            }
            let priority = job.calc_priority();
            queue.lock_live().insert(id, LiveJob::new(job));
            queue.ready.push(id, priority);
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!(recovered, "Recovered unfinished jobs");
        }

        Ok(Arc::new(queue))
    }

    fn lock_live(&self) -> MutexGuard<'_, HashMap<JobId, LiveJob>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Submit a job. The job is durable when this returns.
    pub fn submit_job(&self, ops: Vec<OpInput>) -> Result<JobId> {
        self.submit(ops, &[])
    }

    /// Submit several jobs. Dependencies with negative ids refer to earlier
    /// jobs of the same batch (`-1` is the previous one).
    pub fn submit_many_jobs(&self, jobs: Vec<Vec<OpInput>>) -> Vec<Result<JobId>> {
        let mut batch: Vec<Option<JobId>> = Vec::with_capacity(jobs.len());
        let mut results = Vec::with_capacity(jobs.len());
        for ops in jobs {
            let result = self.submit(ops, &batch);
            batch.push(result.as_ref().ok().copied());
            results.push(result);
        }
        results
    }

    fn submit(&self, mut ops: Vec<OpInput>, batch: &[Option<JobId>]) -> Result<JobId> {
        if self.store.drain_flag() {
            return Err(QueueError::Drained);
        }
        if ops.is_empty() {
            return Err(QueueError::Validation("job has no opcodes".to_string()));
        }
        for op in &ops {
            op.validate().map_err(|e| match e {
                InvalidOp::Priority(priority) => QueueError::InvalidPriority(priority),
                InvalidOp::Params(message) => QueueError::Validation(message),
            })?;
        }
        let last_serial = self.store.last_serial();
        for op in &mut ops {
            for dep in &mut op.depends {
                dep.job_id = resolve_dependency(dep.job_id, batch, last_serial)? as i64;
            }
        }

        let job = self.store.create_job(ops)?;
        let id = job.id;
        let priority = job.calc_priority();
        tracing::info!(
            job_id = id,
            ops = job.ops.len(),
            summary = %job.summary().join(","),
            "Job submitted"
        );
        self.lock_live().insert(id, LiveJob::new(job));
        self.ready.push(id, priority);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// A job from memory, disk or the archive.
    pub fn query_job(&self, id: JobId) -> Result<Job> {
        if let Some(live) = self.lock_live().get(&id) {
            return Ok(live.job.clone());
        }
        self.store
            .load_job(id, true)?
            .ok_or(QueueError::JobNotFound(id))
    }

    /// Jobs matching `filter`, by ascending id.
    pub fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut ids: BTreeSet<JobId> = self.store.job_ids()?.into_iter().collect();
        if filter.include_archived {
            ids.extend(self.store.archived_job_ids()?);
        }
        if let Some(wanted) = &filter.ids {
            ids.retain(|id| wanted.contains(id));
        }

        let mut jobs = Vec::new();
        for id in ids {
            match self.query_job(id) {
                Ok(job) if filter.matches(&job) => jobs.push(job),
                Ok(_) | Err(QueueError::JobNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }

    /// Current status of a job, `None` if it does not exist.
    pub fn job_status(&self, id: JobId) -> Option<JobStatus> {
        match self.query_job(id) {
            Ok(job) => Some(job.calc_status()),
            Err(QueueError::JobNotFound(_)) => None,
            Err(e) => {
                tracing::warn!(job_id = id, error = %e, "Cannot read job status");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Cancellation and archival
    // ------------------------------------------------------------------

    pub fn cancel_job(&self, id: JobId) -> Result<CancelOutcome> {
        if let Some(outcome) = self.modify_job(id, |live| live.job.cancel())? {
            tracing::info!(job_id = id, success = outcome.success, "{}", outcome.message);
            return Ok(outcome);
        }
        // Not live: finished or unknown. Cancelling a finished job changes nothing.
        let mut job = self.query_job(id)?;
        Ok(job.cancel())
    }

    /// Move a finished job to the archive. Returns false for unfinished or
    /// already archived jobs.
    pub fn archive_job(&self, id: JobId) -> Result<bool> {
        if self.lock_live().contains_key(&id) {
            return Ok(false);
        }
        let Some(job) = self.store.load_job(id, false)? else {
            return if self.store.load_job(id, true)?.is_some() {
                Ok(false)
            } else {
                Err(QueueError::JobNotFound(id))
            };
        };
        if !job.is_finalized() {
            return Ok(false);
        }
        let archived = self.store.archive_job(&job)?;
        if archived {
            self.changes.prune(id);
            tracing::info!(job_id = id, "Job archived");
        }
        Ok(archived)
    }

    /// Archive finished jobs older than `age` (all finished jobs for `None`).
    ///
    /// Stops after `timeout`; returns the number of archived jobs and the
    /// number of jobs left unchecked.
    pub fn auto_archive_jobs(
        &self,
        age: Option<Duration>,
        timeout: Duration,
    ) -> Result<(usize, usize)> {
        let started = Instant::now();
        let cutoff = age.and_then(|age| chrono::Duration::from_std(age).ok().map(|age| Utc::now() - age));
        let ids = self.store.job_ids()?;

        let mut archived = 0;
        for (index, id) in ids.iter().copied().enumerate() {
            if started.elapsed() >= timeout {
                return Ok((archived, ids.len() - index));
            }
            if self.lock_live().contains_key(&id) {
                continue;
            }
            let Some(job) = self.store.load_job(id, false)? else {
                continue;
            };
            if !job.is_finalized() {
                continue;
            }
            let old_enough = match (cutoff, job.end_timestamp) {
                (None, _) => true,
                (Some(cutoff), Some(end)) => end <= cutoff,
                (Some(_), None) => false,
            };
            if old_enough && self.store.archive_job(&job)? {
                self.changes.prune(id);
                archived += 1;
            }
        }
        if archived > 0 {
            tracing::info!(archived, "Archived finished jobs");
        }
        Ok((archived, 0))
    }

    // ------------------------------------------------------------------
    // Queue state
    // ------------------------------------------------------------------

    pub fn set_drain_flag(&self, drain: bool) -> Result<()> {
        self.store.set_drain_flag(drain)?;
        tracing::info!(drain, "Queue drain flag set");
        Ok(())
    }

    pub fn drain_flag(&self) -> bool {
        self.store.drain_flag()
    }

    pub fn info(&self) -> QueueInfo {
        QueueInfo {
            drained: self.store.drain_flag(),
            queue_size: self.store.queue_size(),
            max_live_jobs: self.store.max_live_jobs(),
            last_serial: self.store.last_serial(),
            live_jobs: self.lock_live().len(),
            ready_jobs: self.ready.len(),
        }
    }

    // ------------------------------------------------------------------
    // Change notification
    // ------------------------------------------------------------------

    /// Wait until the job's status differs from `prev_status` or log entries
    /// newer than `prev_log_serial` appear.
    ///
    /// Returns the current state in any case; `changed` is false when the
    /// timeout (capped at [`MAX_WAIT_TIMEOUT`]) elapsed first. Finished jobs
    /// return at once.
    pub async fn wait_for_job_change(
        &self,
        id: JobId,
        prev_status: Option<JobStatus>,
        prev_log_serial: u64,
        timeout: Duration,
    ) -> Result<JobChange> {
        let deadline = Instant::now() + timeout.min(MAX_WAIT_TIMEOUT);
        // Subscribe before reading so no change slips in between.
        let mut changes = self.changes.subscribe(id);
        loop {
            let change = JobChange::compute(self.query_job(id)?, prev_status, prev_log_serial);
            if change.changed || change.status.is_finalized() {
                return Ok(change);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    let job = self.query_job(id)?;
                    return Ok(JobChange::compute(job, prev_status, prev_log_serial));
                }
                Err(_) => return Ok(change),
            }
        }
    }

    // ------------------------------------------------------------------
    // Worker interface
    // ------------------------------------------------------------------

    pub(crate) async fn next_ready(&self) -> JobId {
        self.ready.pop().await
    }

    pub(crate) fn lock_timeouts(&self) -> &LockTimeoutConfig {
        &self.lock_timeouts
    }

    /// Claim a job for one processing step. False if it finished meanwhile
    /// or another worker has it.
    pub(crate) fn begin_processing(&self, id: JobId) -> bool {
        match self.lock_live().get_mut(&id) {
            Some(live) if !live.processing => {
                live.processing = true;
                live.requeue = false;
                true
            }
            _ => false,
        }
    }

    /// Release a job after a processing step and queue it again if asked to
    /// or if it was woken up during the step.
    pub(crate) fn finish_processing(&self, id: JobId, reschedule: bool) {
        let mut live = self.lock_live();
        if let Some(entry) = live.get_mut(&id) {
            entry.processing = false;
            if reschedule || entry.requeue {
                entry.requeue = false;
                self.ready.push(id, entry.job.calc_priority());
            }
        }
    }

    /// Queue a job that waited for something, unless a worker has it.
    fn schedule(&self, id: JobId) {
        let mut live = self.lock_live();
        if let Some(entry) = live.get_mut(&id) {
            if entry.processing {
                entry.requeue = true;
            } else {
                self.ready.push(id, entry.job.calc_priority());
            }
        }
    }

    /// Evaluate one dependency of `job_id`. Registers the job as a waiter if
    /// the dependency has not finished.
    pub(crate) fn check_dependency(
        &self,
        job_id: JobId,
        dep_id: JobId,
        statuses: &[JobStatus],
    ) -> DepResult {
        self.deps
            .check_and_register(job_id, dep_id, statuses, |dep| self.job_status(dep))
    }

    /// Apply `f` to a live job and persist the job if it changed.
    ///
    /// Returns `None` if the job is not live (finished or unknown). The job
    /// file is written after the queue lock is dropped; a job finished by
    /// `f` leaves memory once it is on disk and its waiters are scheduled.
    pub(crate) fn modify_job<R>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut LiveJob) -> R,
    ) -> Result<Option<R>> {
        let (result, write) = {
            let mut live = self.lock_live();
            let Some(entry) = live.get_mut(&id) else {
                return Ok(None);
            };
            let before = entry.job.clone();
            let result = f(entry);
            if entry.job == before {
                return Ok(Some(result));
            }
            entry.version += 1;
            let finalized = !before.is_finalized() && entry.job.is_finalized();
            let write = (entry.job.clone(), entry.version, entry.written.clone(), finalized);
            (result, write)
        };

        let (job, version, written, finalized) = write;
        self.persist(&job, version, &written)?;
        self.changes.notify(id);
        if finalized {
            self.lock_live().remove(&id);
            self.ready.remove(id);
            self.deps.forget_waiter(id);
            for waiter in self.deps.job_finalized(id) {
                tracing::debug!(job_id = waiter, dependency = id, "Dependency finished");
                self.schedule(waiter);
            }
        }
        Ok(Some(result))
    }

    /// Write `job` unless a newer version of it is already on disk.
    fn persist(&self, job: &Job, version: u64, written: &Mutex<u64>) -> Result<()> {
        let mut written = written.lock().unwrap_or_else(PoisonError::into_inner);
        if *written < version {
            self.store.update_job(job)?;
            *written = version;
        }
        Ok(())
    }
}

impl LiveJob {
    fn new(job: Job) -> Self {
        Self {
            job,
            attempts: None,
            processing: false,
            requeue: false,
            version: 0,
            written: Arc::new(Mutex::new(0)),
        }
    }
}

fn resolve_dependency(
    dep: i64,
    batch: &[Option<JobId>],
    last_serial: JobId,
) -> Result<JobId> {
    if dep < 0 {
        let index = batch.len() as i64 + dep;
        if index < 0 {
            return Err(QueueError::Validation(format!(
                "relative dependency {} outside of the submitted jobs",
                dep
            )));
        }
        return batch[index as usize].ok_or_else(|| {
            QueueError::Validation(format!(
                "relative dependency {} refers to a job that was not created",
                dep
            ))
        });
    }
    let id = dep as JobId;
    if id > last_serial {
        return Err(QueueError::Validation(format!(
            "dependency on job {} which does not exist yet",
            id
        )));
    }
    Ok(id)
}
