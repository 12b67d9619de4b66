use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::locking::LockAttemptTimeoutStrategy;
use crate::opcodes::{OpInput, OP_PRIO_HIGHEST};
use crate::processor::{ExecError, OpCallbacks, OpError, OpErrorKind, Processor};
use crate::scheduler::deps::DepResult;
use crate::scheduler::job::{
    Job, JobId, LogKind, OpResult, OpStatus, CANCELED_MESSAGE, PRECEDING_FAILED_MESSAGE,
};
use crate::scheduler::JobQueue;

/// What a processing step left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// More work to do; queue the job again.
    Continue,
    /// Waiting for another job; the dependency manager wakes it up.
    Deferred,
    /// The job is finished or no longer live.
    Finished,
}

/// What to run in one step, captured while the job is locked.
enum Prepared {
    Done(StepOutcome),
    Run {
        index: usize,
        input: OpInput,
        priority: i32,
        timeout: Duration,
    },
}

/// Runs jobs one opcode at a time.
pub struct JobProcessor {
    queue: Arc<JobQueue>,
    processor: Arc<Processor>,
    shutdown: CancellationToken,
}

impl JobProcessor {
    pub fn new(queue: Arc<JobQueue>, processor: Arc<Processor>, shutdown: CancellationToken) -> Self {
        Self {
            queue,
            processor,
            shutdown,
        }
    }

    /// Run one step of a job: pick its current opcode and try to execute it.
    ///
    /// Every step ends with the job handed back to the queue, so jobs
    /// interleave between opcodes and lock attempts.
    pub async fn run_step(&self, job_id: JobId) -> Result<StepOutcome> {
        let (index, input, priority, timeout) = match self.prepare(job_id)? {
            Prepared::Done(outcome) => return Ok(outcome),
            Prepared::Run {
                index,
                input,
                priority,
                timeout,
            } => (index, input, priority, timeout),
        };

        let callbacks = QueueCallbacks {
            queue: &self.queue,
            job_id,
            index,
        };
        let result = self
            .processor
            .exec_opcode(job_id, &input, priority, timeout, &callbacks, &self.shutdown)
            .await;
        self.apply(job_id, index, result)
    }

    /// Fail the job's current opcode after its step died without a result.
    ///
    /// Locks the step may still hold are released first.
    pub fn fail_current(&self, job_id: JobId, message: &str) -> Result<StepOutcome> {
        let released = self.processor.locks().release_all(job_id);
        let error = OpError::new(OpErrorKind::Internal, message);
        self.queue.modify_job(job_id, |live| {
            live.attempts = None;
            if let Some(index) = live.job.current_op_index() {
                fail_from(&mut live.job, index, error);
            }
        })?;
        tracing::error!(job_id, released, %message, "Opcode aborted");
        Ok(StepOutcome::Finished)
    }

    fn prepare(&self, job_id: JobId) -> Result<Prepared> {
        let Some(job) = self.queue.modify_job(job_id, |live| live.job.clone())? else {
            return Ok(Prepared::Done(StepOutcome::Finished));
        };
        let Some(index) = job.current_op_index() else {
            return Ok(Prepared::Done(StepOutcome::Finished));
        };

        let op = &job.ops[index];
        match op.status {
            OpStatus::Canceling => {
                self.queue.modify_job(job_id, |live| cancel_remaining(&mut live.job))?;
                tracing::info!(job_id, "Job canceled");
                return Ok(Prepared::Done(StepOutcome::Finished));
            }
            OpStatus::Queued => {
                for dep in &op.input.depends {
                    let dep_id = dep.job_id as JobId;
                    match self.queue.check_dependency(job_id, dep_id, &dep.statuses) {
                        DepResult::Continue => {}
                        DepResult::Wait => {
                            tracing::debug!(job_id, dependency = dep_id, "Waiting for dependency");
                            return Ok(Prepared::Done(StepOutcome::Deferred));
                        }
                        DepResult::Failed(message) => {
                            tracing::info!(job_id, dependency = dep_id, %message, "Dependency failed");
                            let error = OpError::new(OpErrorKind::Dependency, message);
                            self.queue
                                .modify_job(job_id, |live| fail_from(&mut live.job, index, error))?;
                            return Ok(Prepared::Done(StepOutcome::Finished));
                        }
                    }
                }
            }
            _ => {}
        }

        let lock_timeouts = self.queue.lock_timeouts().clone();
        let prepared = self.queue.modify_job(job_id, |live| {
            let op = &mut live.job.ops[index];
            if op.status == OpStatus::Queued {
                let now = Utc::now();
                op.status = OpStatus::WaitLock;
                op.start_timestamp.get_or_insert(now);
                op.result = None;
                live.job.start_timestamp.get_or_insert(now);
            }

            if matches!(&live.attempts, Some((at, _)) if *at != index) {
                live.attempts = None;
            }
            let priority = live.job.ops[index].priority;
            let (_, strategy) = live.attempts.get_or_insert_with(|| {
                (index, LockAttemptTimeoutStrategy::new(&lock_timeouts, priority))
            });
            let timeout = match strategy.next_attempt() {
                Some(timeout) => timeout,
                None => {
                    let op = &mut live.job.ops[index];
                    if op.priority > OP_PRIO_HIGHEST {
                        // Out of attempts: raise the priority and start over.
                        op.priority -= 1;
                        tracing::debug!(job_id, priority = op.priority, "Raised opcode priority");
                        *strategy = LockAttemptTimeoutStrategy::new(&lock_timeouts, op.priority);
                        strategy
                            .next_attempt()
                            .unwrap_or_else(|| lock_timeouts.blocking_cap())
                    } else {
                        lock_timeouts.blocking_cap()
                    }
                }
            };
            let op = &live.job.ops[index];
            Prepared::Run {
                index,
                input: op.input.clone(),
                priority: op.priority,
                timeout,
            }
        })?;
        Ok(prepared.unwrap_or(Prepared::Done(StepOutcome::Finished)))
    }

    fn apply(
        &self,
        job_id: JobId,
        index: usize,
        result: std::result::Result<Value, ExecError>,
    ) -> Result<StepOutcome> {
        let outcome = self.queue.modify_job(job_id, |live| {
            let job = &mut live.job;
            match result {
                Err(ExecError::LockTimeout) => {
                    if job.ops[index].status == OpStatus::Canceling {
                        cancel_remaining(job);
                        StepOutcome::Finished
                    } else {
                        StepOutcome::Continue
                    }
                }
                Err(ExecError::Cancelled) => {
                    cancel_remaining(job);
                    StepOutcome::Finished
                }
                Err(ExecError::Op(error)) => {
                    tracing::warn!(job_id, op = index, error = %error, "Opcode failed");
                    fail_from(job, index, error);
                    StepOutcome::Finished
                }
                Ok(value) => {
                    let op = &mut job.ops[index];
                    op.status = OpStatus::Success;
                    op.result = Some(OpResult::Value(value));
                    op.end_timestamp = Some(Utc::now());
                    live.attempts = None;
                    if job.current_op_index().is_none() {
                        job.finalize();
                        tracing::info!(job_id, "Job succeeded");
                        StepOutcome::Finished
                    } else {
                        StepOutcome::Continue
                    }
                }
            }
        })?;
        Ok(outcome.unwrap_or(StepOutcome::Finished))
    }
}

/// Cancel every unfinished opcode and finish the job.
fn cancel_remaining(job: &mut Job) {
    job.mark_unfinished(
        OpStatus::Canceled,
        Some(OpResult::Message(CANCELED_MESSAGE.to_string())),
    );
    job.finalize();
}

/// Fail the opcode at `index` and every opcode after it, and finish the job.
fn fail_from(job: &mut Job, index: usize, error: OpError) {
    let now = Utc::now();
    let op = &mut job.ops[index];
    op.status = OpStatus::Error;
    op.result = Some(OpResult::Error(error));
    op.end_timestamp = Some(now);
    job.mark_unfinished(
        OpStatus::Error,
        Some(OpResult::Error(OpError::exec(PRECEDING_FAILED_MESSAGE))),
    );
    job.finalize();
}

/// Connects a running opcode to its job record.
struct QueueCallbacks<'a> {
    queue: &'a JobQueue,
    job_id: JobId,
    index: usize,
}

impl OpCallbacks for QueueCallbacks<'_> {
    fn notify_start(&self) -> std::result::Result<(), ExecError> {
        let canceled = self
            .queue
            .modify_job(self.job_id, |live| {
                let op = &mut live.job.ops[self.index];
                if op.status == OpStatus::Canceling {
                    return true;
                }
                op.status = OpStatus::Running;
                op.exec_timestamp = Some(Utc::now());
                false
            })
            .map_err(|e| ExecError::Op(OpError::new(OpErrorKind::Internal, e.to_string())))?;
        match canceled {
            Some(false) => Ok(()),
            Some(true) | None => Err(ExecError::Cancelled),
        }
    }

    fn feedback(&self, kind: LogKind, message: String) {
        tracing::debug!(job_id = self.job_id, op = self.index, %message, "Opcode feedback");
        let result = self.queue.modify_job(self.job_id, |live| {
            live.job.add_log(self.index, kind, message);
        });
        if let Err(e) = result {
            tracing::warn!(job_id = self.job_id, error = %e, "Failed to store log entry");
        }
    }
}
