//! Job dependencies and change notification.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::scheduler::job::{JobId, JobStatus};

/// Outcome of checking one dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepResult {
    /// The dependency finished with an accepted status.
    Continue,
    /// The dependency has not finished; the job was registered as a waiter.
    Wait,
    /// The dependency finished with a status not accepted, or does not exist.
    Failed(String),
}

/// Tracks which jobs wait for which other jobs to finish.
#[derive(Debug, Default)]
pub struct DependencyManager {
    waiters: Mutex<HashMap<JobId, BTreeSet<JobId>>>,
}

impl DependencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, BTreeSet<JobId>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether `job_id` may proceed past its dependency on `dep_id`.
    ///
    /// `status_of` is evaluated while registrations are locked, so a
    /// dependency finishing concurrently either is seen as finished here or
    /// wakes the waiter through [`DependencyManager::job_finalized`].
    pub fn check_and_register(
        &self,
        job_id: JobId,
        dep_id: JobId,
        statuses: &[JobStatus],
        status_of: impl FnOnce(JobId) -> Option<JobStatus>,
    ) -> DepResult {
        let mut waiters = self.lock();
        let result = match status_of(dep_id) {
            None => DepResult::Failed(format!("Dependency job {} not found", dep_id)),
            Some(status) if !status.is_finalized() => {
                waiters.entry(dep_id).or_default().insert(job_id);
                return DepResult::Wait;
            }
            Some(status) if statuses.is_empty() || statuses.contains(&status) => {
                DepResult::Continue
            }
            Some(status) => DepResult::Failed(format!(
                "Dependency job {} has status '{}', not in {}",
                dep_id,
                status,
                statuses
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        };
        if let Some(set) = waiters.get_mut(&dep_id) {
            set.remove(&job_id);
            if set.is_empty() {
                waiters.remove(&dep_id);
            }
        }
        result
    }

    /// A job finished: returns the jobs that waited for it.
    pub fn job_finalized(&self, dep_id: JobId) -> Vec<JobId> {
        self.lock()
            .remove(&dep_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// Forget `job_id` as a waiter everywhere.
    pub fn forget_waiter(&self, job_id: JobId) {
        self.lock().retain(|_, set| {
            set.remove(&job_id);
            !set.is_empty()
        });
    }
}

/// Per-job change counters for long-polling clients.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    senders: Mutex<HashMap<JobId, watch::Sender<u64>>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, watch::Sender<u64>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, job_id: JobId) -> watch::Receiver<u64> {
        self.lock()
            .entry(job_id)
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    pub fn notify(&self, job_id: JobId) {
        let mut senders = self.lock();
        if let Some(sender) = senders.get(&job_id) {
            if sender.receiver_count() == 0 {
                senders.remove(&job_id);
            } else {
                sender.send_modify(|changes| *changes += 1);
            }
        }
    }

    /// Drop the channel of a job that will not change any more.
    pub fn prune(&self, job_id: JobId) {
        if let Some(sender) = self.lock().remove(&job_id) {
            sender.send_modify(|changes| *changes += 1);
        }
    }
}
