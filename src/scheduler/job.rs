use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::opcodes::{OpInput, OP_PRIO_DEFAULT};
use crate::processor::OpError;

pub type JobId = u64;

/// Result message of opcodes canceled on request.
pub const CANCELED_MESSAGE: &str = "Job canceled by request";

/// Error message of opcodes following a failed one.
pub const PRECEDING_FAILED_MESSAGE: &str = "Preceding opcode failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Queued,
    #[serde(rename = "waitlock")]
    WaitLock,
    Canceling,
    Running,
    Canceled,
    Success,
    Error,
}

impl OpStatus {
    pub fn is_finalized(self) -> bool {
        matches!(self, OpStatus::Canceled | OpStatus::Success | OpStatus::Error)
    }
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpStatus::Queued => write!(f, "queued"),
            OpStatus::WaitLock => write!(f, "waitlock"),
            OpStatus::Canceling => write!(f, "canceling"),
            OpStatus::Running => write!(f, "running"),
            OpStatus::Canceled => write!(f, "canceled"),
            OpStatus::Success => write!(f, "success"),
            OpStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    #[serde(rename = "waitlock")]
    WaitLock,
    Canceling,
    Running,
    Canceled,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_finalized(self) -> bool {
        matches!(
            self,
            JobStatus::Canceled | JobStatus::Success | JobStatus::Error
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::WaitLock => write!(f, "waitlock"),
            JobStatus::Canceling => write!(f, "canceling"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Canceled => write!(f, "canceled"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "waitlock" => Ok(JobStatus::WaitLock),
            "canceling" => Ok(JobStatus::Canceling),
            "running" => Ok(JobStatus::Running),
            "canceled" => Ok(JobStatus::Canceled),
            "success" => Ok(JobStatus::Success),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogKind {
    Message,
    JqueueTest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub serial: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: LogKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum OpResult {
    Value(Value),
    Error(OpError),
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOpCode {
    pub input: OpInput,
    pub status: OpStatus,
    pub result: Option<OpResult>,
    /// Current priority; raised while the opcode waits for locks.
    pub priority: i32,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub exec_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
}

impl QueuedOpCode {
    pub fn new(input: OpInput) -> Self {
        Self {
            priority: input.priority.unwrap_or(OP_PRIO_DEFAULT),
            input,
            status: OpStatus::Queued,
            result: None,
            log: Vec::new(),
            start_timestamp: None,
            exec_timestamp: None,
            end_timestamp: None,
        }
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub success: bool,
    pub message: String,
}

/// A job: an ordered list of opcodes executed one after the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub ops: Vec<QueuedOpCode>,
    /// Last serial handed out to a log entry of this job.
    #[serde(default)]
    pub log_serial: u64,
    pub received_timestamp: DateTime<Utc>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub end_timestamp: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, inputs: Vec<OpInput>) -> Self {
        Self {
            id,
            ops: inputs.into_iter().map(QueuedOpCode::new).collect(),
            log_serial: 0,
            received_timestamp: Utc::now(),
            start_timestamp: None,
            end_timestamp: None,
        }
    }

    /// Job status derived from its opcodes.
    ///
    /// Successful opcodes are skipped. A canceling, failed or canceled opcode
    /// decides the status; otherwise the last waiting or running opcode does.
    pub fn calc_status(&self) -> JobStatus {
        let mut status = JobStatus::Queued;
        let mut all_success = true;

        for op in &self.ops {
            if op.status == OpStatus::Success {
                continue;
            }
            all_success = false;
            match op.status {
                OpStatus::Queued | OpStatus::Success => {}
                OpStatus::WaitLock => status = JobStatus::WaitLock,
                OpStatus::Running => status = JobStatus::Running,
                OpStatus::Canceling => {
                    status = JobStatus::Canceling;
                    break;
                }
                OpStatus::Error => {
                    status = JobStatus::Error;
                    break;
                }
                OpStatus::Canceled => {
                    status = JobStatus::Canceled;
                    break;
                }
            }
        }

        if all_success {
            JobStatus::Success
        } else {
            status
        }
    }

    /// Most urgent priority among unfinished opcodes.
    pub fn calc_priority(&self) -> i32 {
        self.ops
            .iter()
            .filter(|op| !op.status.is_finalized())
            .map(|op| op.priority)
            .min()
            .unwrap_or(OP_PRIO_DEFAULT)
    }

    pub fn is_finalized(&self) -> bool {
        self.calc_status().is_finalized()
    }

    /// Index of the first opcode not yet finalized.
    pub fn current_op_index(&self) -> Option<usize> {
        self.ops.iter().position(|op| !op.status.is_finalized())
    }

    pub fn summary(&self) -> Vec<String> {
        self.ops.iter().map(|op| op.input.summary()).collect()
    }

    /// Append a log entry to an opcode and return its serial.
    pub fn add_log(&mut self, op_index: usize, kind: LogKind, message: impl Into<String>) -> u64 {
        self.log_serial += 1;
        let entry = LogEntry {
            serial: self.log_serial,
            timestamp: Utc::now(),
            kind,
            message: message.into(),
        };
        if let Some(op) = self.ops.get_mut(op_index) {
            op.log.push(entry);
        }
        self.log_serial
    }

    /// Log entries with a serial above `serial`, in order.
    pub fn log_entries_after(&self, serial: u64) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = self
            .ops
            .iter()
            .flat_map(|op| op.log.iter())
            .filter(|entry| entry.serial > serial)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.serial);
        entries
    }

    /// Set every unfinished opcode to `status` with `result`.
    pub fn mark_unfinished(&mut self, status: OpStatus, result: Option<OpResult>) {
        let now = Utc::now();
        for op in self.ops.iter_mut().filter(|op| !op.status.is_finalized()) {
            op.status = status;
            op.result = result.clone();
            if status.is_finalized() {
                op.end_timestamp = Some(now);
            }
        }
    }

    pub fn finalize(&mut self) {
        self.end_timestamp = Some(Utc::now());
    }

    /// Cancel the job.
    ///
    /// A queued job is canceled at once. A job waiting for locks or running
    /// is marked canceling and stops at its next checkpoint. Anything else is
    /// left alone.
    pub fn cancel(&mut self) -> CancelOutcome {
        match self.calc_status() {
            JobStatus::Queued => {
                self.mark_unfinished(
                    OpStatus::Canceled,
                    Some(OpResult::Message(CANCELED_MESSAGE.to_string())),
                );
                self.finalize();
                CancelOutcome {
                    success: true,
                    message: format!("Job {} canceled", self.id),
                }
            }
            JobStatus::WaitLock | JobStatus::Running => {
                self.mark_unfinished(OpStatus::Canceling, None);
                CancelOutcome {
                    success: true,
                    message: format!("Job {} will be canceled", self.id),
                }
            }
            _ => CancelOutcome {
                success: false,
                message: format!("Job {} is no longer waiting in the queue", self.id),
            },
        }
    }

    /// Put interrupted opcodes back into the queued state after a restart.
    ///
    /// Returns true if anything changed. Successful opcodes are kept.
    pub fn requeue_interrupted(&mut self) -> bool {
        let mut changed = false;
        for op in self.ops.iter_mut() {
            if matches!(op.status, OpStatus::WaitLock | OpStatus::Running) {
                op.status = OpStatus::Queued;
                op.result = None;
                op.exec_timestamp = None;
                changed = true;
            }
        }
        changed
    }
}

/// Predicate over jobs used by listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub ids: Option<Vec<JobId>>,
    #[serde(default)]
    pub statuses: Option<Vec<JobStatus>>,
    /// Substring matched against opcode summaries.
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&job.id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&job.calc_status()) {
                return false;
            }
        }
        if let Some(needle) = &self.summary {
            if !job.summary().iter().any(|s| s.contains(needle.as_str())) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::OpCode;

    fn job_with(statuses: &[OpStatus]) -> Job {
        let inputs = statuses
            .iter()
            .map(|_| OpInput::from(OpCode::ClusterQuery {}))
            .collect();
        let mut job = Job::new(1, inputs);
        for (op, status) in job.ops.iter_mut().zip(statuses) {
            op.status = *status;
        }
        job
    }

    #[test]
    fn status_all_success() {
        use OpStatus::*;
        assert_eq!(job_with(&[Success, Success]).calc_status(), JobStatus::Success);
    }

    #[test]
    fn status_skips_successful_ops() {
        use OpStatus::*;
        assert_eq!(job_with(&[Success, Queued]).calc_status(), JobStatus::Queued);
        assert_eq!(job_with(&[Success, WaitLock, Queued]).calc_status(), JobStatus::WaitLock);
        assert_eq!(job_with(&[Success, Running, Queued]).calc_status(), JobStatus::Running);
    }

    #[test]
    fn status_final_ops_stop_the_scan() {
        use OpStatus::*;
        assert_eq!(job_with(&[Success, Error, Error]).calc_status(), JobStatus::Error);
        assert_eq!(job_with(&[Canceled, Canceled]).calc_status(), JobStatus::Canceled);
        assert_eq!(job_with(&[Success, Canceling, Canceling]).calc_status(), JobStatus::Canceling);
    }

    #[test]
    fn priority_is_minimum_of_unfinished_ops() {
        use OpStatus::*;
        let mut job = job_with(&[Success, Queued, Queued]);
        job.ops[0].priority = -20;
        job.ops[1].priority = 10;
        job.ops[2].priority = 0;
        assert_eq!(job.calc_priority(), 0);

        job.ops[1].status = Success;
        job.ops[2].status = Success;
        assert_eq!(job.calc_priority(), OP_PRIO_DEFAULT);
    }

    #[test]
    fn cancel_queued_job_cancels_all_ops() {
        use OpStatus::*;
        let mut job = job_with(&[Queued, Queued]);
        let outcome = job.cancel();
        assert!(outcome.success);
        assert_eq!(job.calc_status(), JobStatus::Canceled);
        assert!(job.end_timestamp.is_some());
        for op in &job.ops {
            assert_eq!(op.status, Canceled);
            assert_eq!(op.result, Some(OpResult::Message(CANCELED_MESSAGE.into())));
        }
    }

    #[test]
    fn cancel_waiting_job_marks_canceling() {
        use OpStatus::*;
        let mut job = job_with(&[Success, WaitLock, Queued]);
        assert!(job.cancel().success);
        assert_eq!(job.ops[0].status, Success);
        assert_eq!(job.ops[1].status, Canceling);
        assert_eq!(job.ops[2].status, Canceling);
        assert!(job.end_timestamp.is_none());
    }

    #[test]
    fn cancel_finished_job_is_refused_without_change() {
        use OpStatus::*;
        let mut job = job_with(&[Success, Error]);
        let before = job.clone();
        assert!(!job.cancel().success);
        assert!(!job.cancel().success);
        assert_eq!(job, before);
    }

    #[test]
    fn log_serials_increase_across_ops() {
        use OpStatus::*;
        let mut job = job_with(&[Running, Queued]);
        assert_eq!(job.add_log(0, LogKind::Message, "one"), 1);
        assert_eq!(job.add_log(1, LogKind::JqueueTest, "two"), 2);
        let after_first: Vec<u64> = job.log_entries_after(1).iter().map(|e| e.serial).collect();
        assert_eq!(after_first, vec![2]);
    }

    #[test]
    fn requeue_interrupted_keeps_successful_ops() {
        use OpStatus::*;
        let mut job = job_with(&[Success, Running, Queued]);
        assert!(job.requeue_interrupted());
        assert_eq!(job.ops[0].status, Success);
        assert_eq!(job.ops[1].status, Queued);
        assert_eq!(job.current_op_index(), Some(1));
        assert!(!job.requeue_interrupted());
    }

    #[test]
    fn filter_matches_status_and_summary() {
        use OpStatus::*;
        let job = job_with(&[Queued]);
        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::default().with_status(JobStatus::Queued).matches(&job));
        assert!(!JobFilter::default().with_status(JobStatus::Error).matches(&job));
        let by_summary = JobFilter {
            summary: Some("CLUSTER".into()),
            ..Default::default()
        };
        assert!(by_summary.matches(&job));
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::WaitLock).unwrap(), "\"waitlock\"");
        assert_eq!("canceled".parse::<JobStatus>().unwrap(), JobStatus::Canceled);
    }
}
