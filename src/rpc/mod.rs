//! Calls from the master to node daemons.
//!
//! The processor only sees [`NodeRpc`]. [`HttpNodeRpc`] is the production
//! transport; [`RetryingRpc`] wraps any transport with bounded retries for
//! transient failures.

mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;

pub use http::HttpNodeRpc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("call {method} to {node} timed out after {timeout:?}")]
    Timeout {
        node: String,
        method: String,
        timeout: Duration,
    },

    #[error("cannot reach {node}: {message}")]
    Transport { node: String, message: String },

    #[error("{node} failed {method}: {message}")]
    Remote {
        node: String,
        method: String,
        message: String,
    },
}

impl RpcError {
    /// Failures worth retrying: the node may not have seen the call at all.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Timeout { .. } | RpcError::Transport { .. })
    }
}

#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn call(
        &self,
        node: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError>;
}

/// Retry transient failures with exponential backoff.
pub struct RetryingRpc<R> {
    inner: R,
    max_attempts: u32,
    backoff: Duration,
}

impl<R: NodeRpc> RetryingRpc<R> {
    pub fn new(inner: R, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

#[async_trait]
impl<R: NodeRpc> NodeRpc for RetryingRpc<R> {
    async fn call(
        &self,
        node: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match self.inner.call(node, method, params.clone(), timeout).await {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    tracing::warn!(
                        node,
                        method,
                        attempt,
                        error = %e,
                        "RPC failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_backoff(delay, timeout);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Double the retry delay, never beyond the call timeout.
fn next_backoff(delay: Duration, timeout: Duration) -> Duration {
    delay.saturating_mul(2).min(timeout)
}

/// Call the same method on several nodes concurrently.
///
/// Results come back in the order of `nodes`.
pub async fn call_many(
    rpc: &Arc<dyn NodeRpc>,
    nodes: &[String],
    method: &str,
    params: Value,
    timeout: Duration,
) -> Vec<(String, Result<Value, RpcError>)> {
    let mut calls = JoinSet::new();
    for (index, node) in nodes.iter().enumerate() {
        let rpc = rpc.clone();
        let node = node.clone();
        let method = method.to_string();
        let params = params.clone();
        calls.spawn(async move {
            let result = rpc.call(&node, &method, params, timeout).await;
            (index, node, result)
        });
    }

    let mut results: Vec<(usize, String, Result<Value, RpcError>)> = Vec::with_capacity(nodes.len());
    while let Some(joined) = calls.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => tracing::error!(method, error = %e, "RPC task failed"),
        }
    }
    results.sort_by_key(|(index, _, _)| *index);
    results
        .into_iter()
        .map(|(_, node, result)| (node, result))
        .collect()
}
