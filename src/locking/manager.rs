use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{
    canonical_order, LockError, LockInfo, LockMode, LockRequest, PendingLock, ResourceName,
};
use crate::scheduler::job::JobId;

/// How long a single acquisition may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    /// Grant immediately or give up.
    Try,
    /// Queue behind other waiters for at most this long.
    For(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    Timeout,
}

struct Waiter {
    job_id: JobId,
    mode: LockMode,
    priority: i32,
    ticket: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    exclusive: Option<JobId>,
    shared: BTreeSet<JobId>,
    /// Sorted by (priority, ticket): lower priority value first, FIFO within.
    pending: Vec<Waiter>,
}

impl LockState {
    fn mode(&self) -> Option<LockMode> {
        if self.exclusive.is_some() {
            Some(LockMode::Exclusive)
        } else if !self.shared.is_empty() {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    fn is_idle(&self) -> bool {
        self.mode().is_none() && self.pending.is_empty()
    }

    fn is_compatible(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Exclusive => self.exclusive.is_none() && self.shared.is_empty(),
            LockMode::Shared => self.exclusive.is_none(),
        }
    }

    fn holds(&self, job_id: JobId) -> bool {
        self.exclusive == Some(job_id) || self.shared.contains(&job_id)
    }

    fn is_waiting(&self, job_id: JobId) -> bool {
        self.pending.iter().any(|w| w.job_id == job_id)
    }

    fn grant(&mut self, job_id: JobId, mode: LockMode) {
        match mode {
            LockMode::Exclusive => self.exclusive = Some(job_id),
            LockMode::Shared => {
                self.shared.insert(job_id);
            }
        }
    }

    fn release(&mut self, job_id: JobId) -> bool {
        if self.exclusive == Some(job_id) {
            self.exclusive = None;
            true
        } else {
            self.shared.remove(&job_id)
        }
    }

    fn enqueue(&mut self, waiter: Waiter) {
        let key = (waiter.priority, waiter.ticket);
        let pos = self
            .pending
            .partition_point(|w| (w.priority, w.ticket) <= key);
        self.pending.insert(pos, waiter);
    }

    fn remove_waiters(&mut self, job_id: JobId) {
        self.pending.retain(|w| w.job_id != job_id);
    }

    /// Grant the head of the queue while it is compatible with the holders.
    fn promote(&mut self) -> Vec<(JobId, LockMode)> {
        let mut granted = Vec::new();
        while let Some(head) = self.pending.first() {
            if !self.is_compatible(head.mode) {
                break;
            }
            let waiter = self.pending.remove(0);
            // Receiver gone: the waiter timed out and is cleaning up.
            if waiter.grant.send(()).is_err() {
                continue;
            }
            self.grant(waiter.job_id, waiter.mode);
            granted.push((waiter.job_id, waiter.mode));
        }
        granted
    }
}

#[derive(Default)]
struct Inner {
    locks: BTreeMap<ResourceName, LockState>,
    owned: HashMap<JobId, BTreeMap<ResourceName, LockMode>>,
    next_ticket: u64,
}

impl Inner {
    fn record(&mut self, resource: &ResourceName, granted: Vec<(JobId, LockMode)>) {
        for (job_id, mode) in granted {
            tracing::trace!(job_id, resource = %resource, mode = %mode, "Lock granted");
            self.owned
                .entry(job_id)
                .or_default()
                .insert(resource.clone(), mode);
        }
    }

    fn forget(&mut self, job_id: JobId, resource: &ResourceName) {
        if let Some(owned) = self.owned.get_mut(&job_id) {
            owned.remove(resource);
            if owned.is_empty() {
                self.owned.remove(&job_id);
            }
        }
    }

    /// Re-evaluate waiters of `resource` and drop its state when idle.
    fn settle(&mut self, resource: &ResourceName) {
        let Some(state) = self.locks.get_mut(resource) else {
            return;
        };
        let granted = state.promote();
        if state.is_idle() {
            self.locks.remove(resource);
        }
        self.record(resource, granted);
    }

    fn check_order(&self, job_id: JobId, resource: &ResourceName) -> Result<(), LockError> {
        let highest = self
            .owned
            .get(&job_id)
            .and_then(|owned| owned.last_key_value())
            .map(|(name, _)| name);
        match highest {
            Some(held) if held.level > resource.level => Err(LockError::OrderViolation {
                job_id,
                resource: resource.to_string(),
                held: held.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// In-memory reader/writer locks over cluster resources.
///
/// Waiters are served by priority, then arrival. A request that finds other
/// waiters queued is never granted ahead of them, so a pending exclusive
/// request holds back later shared ones.
#[derive(Default)]
pub struct LockManager {
    inner: Mutex<Inner>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire one resource for a job.
    ///
    /// Returns `Timeout` when the wait expires (or immediately for
    /// [`LockWait::Try`]); the job is then no longer queued for the lock.
    pub async fn acquire(
        &self,
        job_id: JobId,
        resource: &ResourceName,
        mode: LockMode,
        priority: i32,
        wait: LockWait,
    ) -> Result<AcquireOutcome, LockError> {
        let (grant_tx, grant_rx) = oneshot::channel();
        let ticket = {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            inner.check_order(job_id, resource)?;

            let state = inner.locks.entry(resource.clone()).or_default();
            if state.holds(job_id) || state.is_waiting(job_id) {
                return Err(LockError::AlreadyHeld {
                    job_id,
                    resource: resource.to_string(),
                });
            }
            if state.pending.is_empty() && state.is_compatible(mode) {
                state.grant(job_id, mode);
                inner.record(resource, vec![(job_id, mode)]);
                return Ok(AcquireOutcome::Granted);
            }
            if wait == LockWait::Try {
                return Ok(AcquireOutcome::Timeout);
            }

            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            state.enqueue(Waiter {
                job_id,
                mode,
                priority,
                ticket,
                grant: grant_tx,
            });
            ticket
        };

        let timeout = match wait {
            LockWait::For(timeout) => timeout,
            LockWait::Try => Duration::ZERO,
        };
        tracing::debug!(job_id, resource = %resource, mode = %mode, ?timeout, "Waiting for lock");

        if let Ok(Ok(())) = tokio::time::timeout(timeout, grant_rx).await {
            return Ok(AcquireOutcome::Granted);
        }

        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        if let Some(state) = inner.locks.get_mut(resource) {
            if state.holds(job_id) {
                return Ok(AcquireOutcome::Granted);
            }
            state.pending.retain(|w| w.ticket != ticket);
        }
        inner.settle(resource);
        tracing::debug!(job_id, resource = %resource, "Lock wait timed out");
        Ok(AcquireOutcome::Timeout)
    }

    /// Acquire a set of resources in canonical order under one deadline.
    ///
    /// On timeout or error everything acquired by this call is released
    /// again; locks held before the call are kept.
    pub async fn acquire_all(
        &self,
        job_id: JobId,
        requests: &[LockRequest],
        priority: i32,
        timeout: Duration,
    ) -> Result<AcquireOutcome, LockError> {
        let deadline = Instant::now() + timeout;
        let mut acquired: Vec<ResourceName> = Vec::new();

        for request in canonical_order(requests) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = if remaining.is_zero() {
                LockWait::Try
            } else {
                LockWait::For(remaining)
            };
            let outcome = self
                .acquire(job_id, &request.resource, request.mode, priority, wait)
                .await;
            match outcome {
                Ok(AcquireOutcome::Granted) => acquired.push(request.resource),
                Ok(AcquireOutcome::Timeout) => {
                    self.release_each(job_id, &acquired);
                    return Ok(AcquireOutcome::Timeout);
                }
                Err(e) => {
                    self.release_each(job_id, &acquired);
                    return Err(e);
                }
            }
        }
        Ok(AcquireOutcome::Granted)
    }

    fn release_each(&self, job_id: JobId, resources: &[ResourceName]) {
        for resource in resources.iter().rev() {
            if let Err(e) = self.release(job_id, resource) {
                tracing::warn!(job_id, error = %e, "Failed to roll back lock");
            }
        }
    }

    pub fn release(&self, job_id: JobId, resource: &ResourceName) -> Result<(), LockError> {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        let released = inner
            .locks
            .get_mut(resource)
            .map(|state| state.release(job_id))
            .unwrap_or(false);
        if !released {
            return Err(LockError::NotHeld {
                job_id,
                resource: resource.to_string(),
            });
        }
        inner.forget(job_id, resource);
        inner.settle(resource);
        Ok(())
    }

    /// Release every lock held by a job and drop its queued requests.
    pub fn release_all(&self, job_id: JobId) -> usize {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;

        let owned = inner.owned.remove(&job_id).unwrap_or_default();
        let mut touched: Vec<ResourceName> = Vec::with_capacity(owned.len());
        for resource in owned.keys() {
            if let Some(state) = inner.locks.get_mut(resource) {
                state.release(job_id);
            }
            touched.push(resource.clone());
        }
        for (resource, state) in inner.locks.iter_mut() {
            if state.is_waiting(job_id) {
                state.remove_waiters(job_id);
                touched.push(resource.clone());
            }
        }
        for resource in &touched {
            inner.settle(resource);
        }
        owned.len()
    }

    pub fn owned_mode(&self, job_id: JobId, resource: &ResourceName) -> Option<LockMode> {
        self.lock_inner()
            .owned
            .get(&job_id)
            .and_then(|owned| owned.get(resource).copied())
    }

    /// Resources held by a job, in acquisition order.
    pub fn list_owned(&self, job_id: JobId) -> Vec<ResourceName> {
        self.lock_inner()
            .owned
            .get(&job_id)
            .map(|owned| owned.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every lock that is held or waited for.
    pub fn info(&self) -> Vec<LockInfo> {
        let inner = self.lock_inner();
        inner
            .locks
            .iter()
            .map(|(name, state)| {
                let owners = match state.exclusive {
                    Some(job_id) => vec![job_id],
                    None => state.shared.iter().copied().collect(),
                };
                LockInfo {
                    name: name.to_string(),
                    mode: state.mode(),
                    owners,
                    pending: state
                        .pending
                        .iter()
                        .map(|w| PendingLock {
                            job_id: w.job_id,
                            mode: w.mode,
                            priority: w.priority,
                        })
                        .collect(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WAIT: LockWait = LockWait::For(Duration::from_millis(200));

    #[tokio::test]
    async fn shared_holders_coexist() {
        let locks = LockManager::new();
        let node = ResourceName::node("n1");
        for job in [1, 2, 3] {
            let outcome = locks
                .acquire(job, &node, LockMode::Shared, 0, LockWait::Try)
                .await
                .unwrap();
            assert_eq!(outcome, AcquireOutcome::Granted);
        }
        let info = locks.info();
        assert_eq!(info[0].owners, vec![1, 2, 3]);
        assert_eq!(info[0].mode, Some(LockMode::Shared));
    }

    #[tokio::test]
    async fn exclusive_blocks_until_released() {
        let locks = Arc::new(LockManager::new());
        let inst = ResourceName::instance("foo");
        locks
            .acquire(1, &inst, LockMode::Exclusive, 0, LockWait::Try)
            .await
            .unwrap();

        let try_again = locks
            .acquire(2, &inst, LockMode::Shared, 0, LockWait::Try)
            .await
            .unwrap();
        assert_eq!(try_again, AcquireOutcome::Timeout);

        let waiter = {
            let locks = locks.clone();
            let inst = inst.clone();
            tokio::spawn(async move {
                locks
                    .acquire(
                        2,
                        &inst,
                        LockMode::Exclusive,
                        0,
                        LockWait::For(Duration::from_secs(5)),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        locks.release(1, &inst).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), AcquireOutcome::Granted);
        assert_eq!(locks.owned_mode(2, &inst), Some(LockMode::Exclusive));
    }

    #[tokio::test]
    async fn timed_out_waiter_is_removed() {
        let locks = LockManager::new();
        let inst = ResourceName::instance("foo");
        locks
            .acquire(1, &inst, LockMode::Exclusive, 0, LockWait::Try)
            .await
            .unwrap();
        let outcome = locks
            .acquire(2, &inst, LockMode::Exclusive, 0, WAIT)
            .await
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::Timeout);
        assert!(locks.info()[0].pending.is_empty());
    }

    #[tokio::test]
    async fn pending_exclusive_holds_back_new_shared() {
        let locks = Arc::new(LockManager::new());
        let node = ResourceName::node("n1");
        locks
            .acquire(1, &node, LockMode::Shared, 0, LockWait::Try)
            .await
            .unwrap();

        let writer = {
            let locks = locks.clone();
            let node = node.clone();
            tokio::spawn(async move {
                locks
                    .acquire(
                        2,
                        &node,
                        LockMode::Exclusive,
                        0,
                        LockWait::For(Duration::from_secs(5)),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reader = locks
            .acquire(3, &node, LockMode::Shared, 0, LockWait::Try)
            .await
            .unwrap();
        assert_eq!(reader, AcquireOutcome::Timeout, "reader must not overtake writer");

        locks.release(1, &node).unwrap();
        assert_eq!(writer.await.unwrap().unwrap(), AcquireOutcome::Granted);
    }

    #[tokio::test]
    async fn higher_priority_waiter_goes_first() {
        let locks = Arc::new(LockManager::new());
        let inst = ResourceName::instance("foo");
        locks
            .acquire(1, &inst, LockMode::Exclusive, 0, LockWait::Try)
            .await
            .unwrap();

        let low = {
            let locks = locks.clone();
            let inst = inst.clone();
            tokio::spawn(async move {
                locks
                    .acquire(2, &inst, LockMode::Exclusive, 10, LockWait::For(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let high = {
            let locks = locks.clone();
            let inst = inst.clone();
            tokio::spawn(async move {
                locks
                    .acquire(3, &inst, LockMode::Exclusive, -10, LockWait::For(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pending: Vec<JobId> = locks.info()[0].pending.iter().map(|p| p.job_id).collect();
        assert_eq!(pending, vec![3, 2]);

        locks.release(1, &inst).unwrap();
        assert_eq!(high.await.unwrap().unwrap(), AcquireOutcome::Granted);
        assert_eq!(locks.owned_mode(2, &inst), None);
        locks.release(3, &inst).unwrap();
        assert_eq!(low.await.unwrap().unwrap(), AcquireOutcome::Granted);
    }

    #[tokio::test]
    async fn double_acquire_is_an_error() {
        let locks = LockManager::new();
        let node = ResourceName::node("n1");
        locks
            .acquire(1, &node, LockMode::Shared, 0, LockWait::Try)
            .await
            .unwrap();
        let err = locks
            .acquire(1, &node, LockMode::Shared, 0, LockWait::Try)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::AlreadyHeld { job_id: 1, .. }));
    }

    #[tokio::test]
    async fn acquiring_lower_level_is_an_order_violation() {
        let locks = LockManager::new();
        locks
            .acquire(1, &ResourceName::instance("foo"), LockMode::Shared, 0, LockWait::Try)
            .await
            .unwrap();
        let err = locks
            .acquire(1, &ResourceName::node("n1"), LockMode::Shared, 0, LockWait::Try)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::OrderViolation { .. }));
    }

    #[tokio::test]
    async fn acquire_all_rolls_back_on_timeout() {
        let locks = LockManager::new();
        locks
            .acquire(9, &ResourceName::instance("b"), LockMode::Exclusive, 0, LockWait::Try)
            .await
            .unwrap();

        let requests = vec![
            LockRequest::exclusive(ResourceName::instance("b")),
            LockRequest::shared(ResourceName::node("n1")),
            LockRequest::exclusive(ResourceName::instance("a")),
        ];
        let outcome = locks
            .acquire_all(1, &requests, 0, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::Timeout);
        assert!(locks.list_owned(1).is_empty());
        assert_eq!(locks.info().len(), 1, "only job 9's lock remains");
    }

    #[tokio::test]
    async fn release_all_frees_locks_and_wakes_waiters() {
        let locks = Arc::new(LockManager::new());
        let requests = vec![
            LockRequest::shared(ResourceName::bgl()),
            LockRequest::exclusive(ResourceName::node("n1")),
        ];
        locks
            .acquire_all(1, &requests, 0, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(
            locks.list_owned(1),
            vec![ResourceName::bgl(), ResourceName::node("n1")]
        );

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire(
                        2,
                        &ResourceName::node("n1"),
                        LockMode::Exclusive,
                        0,
                        LockWait::For(Duration::from_secs(5)),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.release_all(1), 2);
        assert_eq!(waiter.await.unwrap().unwrap(), AcquireOutcome::Granted);
    }

    #[test]
    fn release_of_unheld_lock_fails() {
        let locks = LockManager::new();
        let err = locks.release(1, &ResourceName::node("n1")).unwrap_err();
        assert!(matches!(err, LockError::NotHeld { .. }));
    }
}
