//! Resource locks shared by all jobs of the master.
//!
//! Locks are reader/writer locks over named cluster resources. They live
//! only in memory; a restarted master starts with every lock free.
//!
//! # Levels
//!
//! Resources are grouped in levels that must be acquired in order:
//!
//! 1. the big global lock (`BGL`)
//! 2. the `cluster` object
//! 3. node groups
//! 4. nodes
//! 5. instances
//!
//! Inside a level names are acquired sorted. [`LockManager::acquire_all`]
//! sorts a request set into this order before acquiring it.
//!
//! # Components
//!
//! - [`LockManager`]: holders, priority-ordered waiters, grants and timeouts
//! - [`LockAttemptTimeoutStrategy`]: growing, priority-scaled attempt windows

pub mod manager;
pub mod timeout;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::job::JobId;

pub use manager::{AcquireOutcome, LockManager, LockWait};
pub use timeout::LockAttemptTimeoutStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockLevel {
    Bgl,
    Cluster,
    NodeGroup,
    Node,
    Instance,
}

impl std::fmt::Display for LockLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockLevel::Bgl => write!(f, "BGL"),
            LockLevel::Cluster => write!(f, "cluster"),
            LockLevel::NodeGroup => write!(f, "node-group"),
            LockLevel::Node => write!(f, "node"),
            LockLevel::Instance => write!(f, "instance"),
        }
    }
}

/// A lockable resource. Ordering follows the canonical acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceName {
    pub level: LockLevel,
    pub name: String,
}

impl ResourceName {
    pub fn bgl() -> Self {
        Self {
            level: LockLevel::Bgl,
            name: String::new(),
        }
    }

    pub fn cluster() -> Self {
        Self {
            level: LockLevel::Cluster,
            name: String::new(),
        }
    }

    pub fn node_group(name: impl Into<String>) -> Self {
        Self {
            level: LockLevel::NodeGroup,
            name: name.into(),
        }
    }

    pub fn node(name: impl Into<String>) -> Self {
        Self {
            level: LockLevel::Node,
            name: name.into(),
        }
    }

    pub fn instance(name: impl Into<String>) -> Self {
        Self {
            level: LockLevel::Instance,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.level {
            LockLevel::Bgl | LockLevel::Cluster => write!(f, "{}", self.level),
            _ => write!(f, "{}:{}", self.level, self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub resource: ResourceName,
    pub mode: LockMode,
}

impl LockRequest {
    pub fn new(resource: ResourceName, mode: LockMode) -> Self {
        Self { resource, mode }
    }

    pub fn shared(resource: ResourceName) -> Self {
        Self::new(resource, LockMode::Shared)
    }

    pub fn exclusive(resource: ResourceName) -> Self {
        Self::new(resource, LockMode::Exclusive)
    }
}

/// Sort requests into acquisition order, merging duplicates.
///
/// A resource requested both shared and exclusive is acquired exclusively.
pub fn canonical_order(requests: &[LockRequest]) -> Vec<LockRequest> {
    let mut sorted: Vec<LockRequest> = requests.to_vec();
    sorted.sort_by(|a, b| a.resource.cmp(&b.resource));
    let mut merged: Vec<LockRequest> = Vec::with_capacity(sorted.len());
    for request in sorted {
        match merged.last_mut() {
            Some(last) if last.resource == request.resource => {
                if request.mode == LockMode::Exclusive {
                    last.mode = LockMode::Exclusive;
                }
            }
            _ => merged.push(request),
        }
    }
    merged
}

/// Diagnostic view of one lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub name: String,
    pub mode: Option<LockMode>,
    pub owners: Vec<JobId>,
    pub pending: Vec<PendingLock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingLock {
    pub job_id: JobId,
    pub mode: LockMode,
    pub priority: i32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Job {job_id} already holds or waits for {resource}")]
    AlreadyHeld { job_id: JobId, resource: String },

    #[error("Job {job_id} does not hold {resource}")]
    NotHeld { job_id: JobId, resource: String },

    #[error("Job {job_id} cannot acquire {resource} while holding {held}")]
    OrderViolation {
        job_id: JobId,
        resource: String,
        held: String,
    },
}
