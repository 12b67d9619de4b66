//! Job bookkeeping: job records, the persistent queue, ready ordering and
//! inter-job dependencies.

pub mod deps;
pub mod job;
pub mod queue;
pub mod ready;

pub use job::{CancelOutcome, Job, JobFilter, JobId, JobStatus, OpStatus};
pub use queue::{JobChange, JobQueue, QueueInfo, MAX_WAIT_TIMEOUT};
