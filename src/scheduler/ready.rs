use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::scheduler::job::JobId;

#[derive(Debug, Default)]
struct Entries {
    heap: BinaryHeap<Reverse<(i32, JobId)>>,
    /// Jobs currently queued with the priority they were pushed with.
    queued: HashMap<JobId, i32>,
}

/// Jobs ready to be picked up by a worker.
///
/// Lower priority values come first; among equal priorities the older job
/// (lower id) wins. A job is in the queue at most once.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: Mutex<Entries>,
    notify: Notify,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a job. A job already queued keeps its place unless `priority`
    /// is more urgent.
    pub fn push(&self, job_id: JobId, priority: i32) {
        {
            let mut entries = self.lock();
            match entries.queued.get(&job_id) {
                Some(current) if *current <= priority => return,
                _ => {}
            }
            entries.queued.insert(job_id, priority);
            entries.heap.push(Reverse((priority, job_id)));
        }
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<(JobId, bool)> {
        let mut entries = self.lock();
        while let Some(Reverse((priority, job_id))) = entries.heap.pop() {
            // Stale entries are left behind by remove() and re-prioritization.
            if entries.queued.get(&job_id) == Some(&priority) {
                entries.queued.remove(&job_id);
                return Some((job_id, !entries.queued.is_empty()));
            }
        }
        None
    }

    /// Wait for the most urgent job.
    pub async fn pop(&self) -> JobId {
        loop {
            let notified = self.notify.notified();
            if let Some((job_id, more)) = self.try_pop() {
                if more {
                    self.notify.notify_one();
                }
                return job_id;
            }
            notified.await;
        }
    }

    /// Take a job out of the queue. Returns false if it was not queued.
    pub fn remove(&self, job_id: JobId) -> bool {
        self.lock().queued.remove(&job_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn pops_by_priority_then_age() {
        let queue = ReadyQueue::new();
        queue.push(3, 10);
        queue.push(2, 0);
        queue.push(4, -10);
        queue.push(1, 0);
        assert_eq!(queue.pop().await, 4);
        assert_eq!(queue.pop().await, 1);
        assert_eq!(queue.pop().await, 2);
        assert_eq!(queue.pop().await, 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn duplicate_push_keeps_one_entry() {
        let queue = ReadyQueue::new();
        queue.push(1, 0);
        queue.push(1, 0);
        assert_eq!(queue.len(), 1);
        queue.push(1, -10);
        queue.push(2, -5);
        assert_eq!(queue.pop().await, 1);
        assert_eq!(queue.pop().await, 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn removed_jobs_are_skipped() {
        let queue = ReadyQueue::new();
        queue.push(1, 0);
        queue.push(2, 0);
        assert!(queue.remove(1));
        assert!(!queue.remove(1));
        assert_eq!(queue.pop().await, 2);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(ReadyQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(9, 0);
        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, 9);
    }

    #[tokio::test]
    async fn every_waiting_worker_gets_a_job() {
        let queue = Arc::new(ReadyQueue::new());
        queue.push(1, 0);
        queue.push(2, 0);
        queue.push(3, 0);
        let mut handles = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move { queue.pop().await }));
        }
        let mut got = Vec::new();
        for handle in handles {
            got.push(
                tokio::time::timeout(Duration::from_secs(1), handle)
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        got.sort();
        assert_eq!(got, vec![1, 2, 3]);
    }
}
