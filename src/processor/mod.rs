//! Opcode processor: runs a single opcode under its locks.
//!
//! For every opcode the processor
//!
//! 1. acquires the BGL in the mode the opcode's lock template asks for,
//! 2. expands the rest of the template against a configuration snapshot and
//!    acquires it in canonical order,
//! 3. tells the job queue the opcode started (where cancellation is seen),
//! 4. checks prerequisites, runs pre-hooks, executes, runs post-hooks,
//! 5. releases every lock, whatever happened before.
//!
//! A lock timeout is not a failure: the opcode keeps waiting and the job
//! queue retries it with the next attempt window.

pub mod hooks;
pub mod units;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterConfig, ConfigError, ConfigStore};
use crate::config::HookFailurePolicy;
use crate::locking::{AcquireOutcome, LockError, LockManager, LockRequest, ResourceName};
use crate::opcodes::{LockSpec, LockTemplate, OpInput};
use crate::rpc::{NodeRpc, RpcError};
use crate::scheduler::job::{JobId, LogKind};

use hooks::{HookPhase, HookRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpErrorKind {
    /// Prerequisites not met; nothing was changed.
    Prereq,
    /// Execution failed; earlier side effects remain.
    Exec,
    Hooks,
    Dependency,
    Lock,
    Internal,
}

impl std::fmt::Display for OpErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpErrorKind::Prereq => write!(f, "prerequisites not met"),
            OpErrorKind::Exec => write!(f, "execution failed"),
            OpErrorKind::Hooks => write!(f, "hooks failed"),
            OpErrorKind::Dependency => write!(f, "dependency failed"),
            OpErrorKind::Lock => write!(f, "locking failed"),
            OpErrorKind::Internal => write!(f, "internal error"),
        }
    }
}

/// Error stored as an opcode's result.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct OpError {
    pub kind: OpErrorKind,
    pub message: String,
}

impl OpError {
    pub fn new(kind: OpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn prereq(message: impl Into<String>) -> Self {
        Self::new(OpErrorKind::Prereq, message)
    }

    pub fn exec(message: impl Into<String>) -> Self {
        Self::new(OpErrorKind::Exec, message)
    }
}

impl From<RpcError> for OpError {
    fn from(e: RpcError) -> Self {
        OpError::exec(e.to_string())
    }
}

impl From<ConfigError> for OpError {
    fn from(e: ConfigError) -> Self {
        OpError::exec(format!("configuration update failed: {}", e))
    }
}

impl From<LockError> for OpError {
    fn from(e: LockError) -> Self {
        OpError::new(OpErrorKind::Lock, e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("lock attempt timed out")]
    LockTimeout,

    #[error("opcode canceled")]
    Cancelled,

    #[error(transparent)]
    Op(#[from] OpError),
}

/// How the processor reports back to the job owning the opcode.
pub trait OpCallbacks: Send + Sync {
    /// Called once all locks are held, before prerequisites are checked.
    /// Returns [`ExecError::Cancelled`] if the job was asked to cancel.
    fn notify_start(&self) -> Result<(), ExecError>;

    /// Append a log entry to the opcode.
    fn feedback(&self, kind: LogKind, message: String);
}

/// What a logical unit may use while executing.
pub struct ExecContext<'a> {
    pub job_id: JobId,
    config: &'a Arc<dyn ConfigStore>,
    rpc: &'a Arc<dyn NodeRpc>,
    rpc_timeout: Duration,
    callbacks: &'a dyn OpCallbacks,
}

impl ExecContext<'_> {
    pub fn config(&self) -> &dyn ConfigStore {
        self.config.as_ref()
    }

    pub fn snapshot(&self) -> Arc<ClusterConfig> {
        self.config.snapshot()
    }

    pub fn feedback(&self, message: impl Into<String>) {
        self.callbacks.feedback(LogKind::Message, message.into());
    }

    pub fn log(&self, kind: LogKind, message: impl Into<String>) {
        self.callbacks.feedback(kind, message.into());
    }

    pub async fn call(&self, node: &str, method: &str, params: Value) -> Result<Value, OpError> {
        self.call_with_timeout(node, method, params, self.rpc_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        node: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, OpError> {
        Ok(self.rpc.call(node, method, params, timeout).await?)
    }

    pub async fn call_many(
        &self,
        nodes: &[String],
        method: &str,
        params: Value,
    ) -> Vec<(String, Result<Value, RpcError>)> {
        crate::rpc::call_many(self.rpc, nodes, method, params, self.rpc_timeout).await
    }
}

/// Turn a lock template into concrete lock requests (BGL excluded).
///
/// Names are resolved against `config`; objects that do not exist yet (for
/// example a node being added) are locked by name all the same.
pub fn expand_locks(template: &LockTemplate, config: &ClusterConfig) -> Vec<LockRequest> {
    let mut requests = Vec::new();
    if let Some(mode) = template.cluster {
        requests.push(LockRequest::new(ResourceName::cluster(), mode));
    }
    expand_level(
        &template.node_groups,
        config,
        || config.node_groups.keys().cloned().collect(),
        |n| ResourceName::node_group(n),
        &mut requests,
    );
    expand_level(
        &template.nodes,
        config,
        || config.nodes.keys().cloned().collect(),
        |n| ResourceName::node(n),
        &mut requests,
    );
    expand_level(
        &template.instances,
        config,
        || config.instances.keys().cloned().collect(),
        |n| ResourceName::instance(n),
        &mut requests,
    );
    requests
}

fn expand_level(
    spec: &LockSpec,
    config: &ClusterConfig,
    all: impl FnOnce() -> Vec<String>,
    resource: fn(String) -> ResourceName,
    out: &mut Vec<LockRequest>,
) {
    match spec {
        LockSpec::None => {}
        LockSpec::Named(names, mode) => {
            out.extend(names.iter().map(|n| LockRequest::new(resource(n.clone()), *mode)));
        }
        LockSpec::All(mode) => {
            out.extend(all().into_iter().map(|n| LockRequest::new(resource(n), *mode)));
        }
        LockSpec::InstanceNodes {
            instances,
            extra,
            mode,
        } => {
            let nodes = instances
                .iter()
                .filter_map(|name| config.instances.get(name))
                .flat_map(|inst| inst.nodes())
                .chain(extra.iter().cloned());
            out.extend(nodes.map(|n| LockRequest::new(resource(n), *mode)));
        }
    }
}

pub struct Processor {
    locks: Arc<LockManager>,
    config: Arc<dyn ConfigStore>,
    rpc: Arc<dyn NodeRpc>,
    hooks: HookRunner,
    rpc_timeout: Duration,
}

impl Processor {
    pub fn new(
        locks: Arc<LockManager>,
        config: Arc<dyn ConfigStore>,
        rpc: Arc<dyn NodeRpc>,
        rpc_timeout: Duration,
        hook_policy: HookFailurePolicy,
    ) -> Self {
        let hooks = HookRunner::new(rpc.clone(), hook_policy, rpc_timeout);
        Self {
            locks,
            config,
            rpc,
            hooks,
            rpc_timeout,
        }
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn config(&self) -> &Arc<dyn ConfigStore> {
        &self.config
    }

    /// Run one opcode. Locks are always released before returning.
    pub async fn exec_opcode(
        &self,
        job_id: JobId,
        input: &OpInput,
        priority: i32,
        lock_timeout: Duration,
        callbacks: &dyn OpCallbacks,
        shutdown: &CancellationToken,
    ) -> Result<Value, ExecError> {
        let result = self
            .run_locked(job_id, input, priority, lock_timeout, callbacks, shutdown)
            .await;
        let released = self.locks.release_all(job_id);
        tracing::debug!(job_id, released, "Released opcode locks");
        result
    }

    async fn acquire(
        &self,
        job_id: JobId,
        requests: &[LockRequest],
        priority: i32,
        deadline: Instant,
        shutdown: &CancellationToken,
    ) -> Result<(), ExecError> {
        if requests.is_empty() {
            return Ok(());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = tokio::select! {
            outcome = self.locks.acquire_all(job_id, requests, priority, remaining) => {
                outcome.map_err(OpError::from)?
            }
            _ = shutdown.cancelled() => AcquireOutcome::Timeout,
        };
        match outcome {
            AcquireOutcome::Granted => Ok(()),
            AcquireOutcome::Timeout => Err(ExecError::LockTimeout),
        }
    }

    async fn run_locked(
        &self,
        job_id: JobId,
        input: &OpInput,
        priority: i32,
        lock_timeout: Duration,
        callbacks: &dyn OpCallbacks,
        shutdown: &CancellationToken,
    ) -> Result<Value, ExecError> {
        let summary = input.summary();
        let template = input.op.lock_template();
        let deadline = Instant::now() + lock_timeout;

        let bgl = [LockRequest::new(ResourceName::bgl(), template.bgl)];
        self.acquire(job_id, &bgl, priority, deadline, shutdown)
            .await?;

        let requests = expand_locks(&template, &self.config.snapshot());
        self.acquire(job_id, &requests, priority, deadline, shutdown)
            .await?;

        callbacks.notify_start()?;
        tracing::info!(job_id, op = %summary, "Opcode started");

        let config = self.config.snapshot();
        let owned = self.locks.list_owned(job_id);
        let unit = units::logical_unit(&input.op);
        unit.check_prereq(&config, &owned)?;

        if input.dry_run {
            callbacks.feedback(
                LogKind::Message,
                "Dry run: prerequisites passed, nothing executed".to_string(),
            );
            return Ok(Value::Null);
        }

        let hook_spec = unit.hooks(&config);
        if let Some(spec) = &hook_spec {
            let failures = self
                .hooks
                .run(HookPhase::Pre, input.op.op_id(), spec, &config)
                .await;
            if !failures.is_empty() {
                return Err(OpError::new(OpErrorKind::Hooks, hooks::describe(&failures)).into());
            }
        }

        let ctx = ExecContext {
            job_id,
            config: &self.config,
            rpc: &self.rpc,
            rpc_timeout: self.rpc_timeout,
            callbacks,
        };
        let result = unit.exec(&ctx).await?;

        if let Some(spec) = &hook_spec {
            let config = self.config.snapshot();
            let failures = self
                .hooks
                .run(HookPhase::Post, input.op.op_id(), spec, &config)
                .await;
            if !failures.is_empty() {
                let message = hooks::describe(&failures);
                callbacks.feedback(LogKind::Message, format!("Post hooks failed: {}", message));
                tracing::warn!(job_id, op = %summary, failures = %message, "Post hooks failed");
                if self.hooks.policy() == HookFailurePolicy::Fatal {
                    return Err(OpError::new(OpErrorKind::Hooks, message).into());
                }
            }
        }

        Ok(result)
    }
}
