use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{NodeRpc, RpcError};
use crate::cluster::ConfigStore;

/// JSON over HTTP: `POST http://<node>:<port>/rpc/<method>` with the
/// parameters as body. A 2xx response carries the result, anything else the
/// node's error message.
pub struct HttpNodeRpc {
    client: reqwest::Client,
    port: u16,
    config: Arc<dyn ConfigStore>,
}

impl HttpNodeRpc {
    pub fn new(port: u16, config: Arc<dyn ConfigStore>) -> Self {
        Self {
            client: reqwest::Client::new(),
            port,
            config,
        }
    }

    /// Primary IP from the configuration, else the node name itself.
    fn address(&self, node: &str) -> String {
        self.config
            .snapshot()
            .nodes
            .get(node)
            .and_then(|n| n.primary_ip.clone())
            .unwrap_or_else(|| node.to_string())
    }
}

#[async_trait]
impl NodeRpc for HttpNodeRpc {
    async fn call(
        &self,
        node: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let url = format!("http://{}:{}/rpc/{}", self.address(node), self.port, method);
        tracing::debug!(node, method, url = %url, "Sending node RPC");

        let response = self
            .client
            .post(&url)
            .json(&params)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(node, method, timeout, e))?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<Value>()
                .await
                .map_err(|e| classify(node, method, timeout, e))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(RpcError::Remote {
                node: node.to_string(),
                method: method.to_string(),
                message: if body.is_empty() {
                    status.to_string()
                } else {
                    body
                },
            })
        }
    }
}

fn classify(node: &str, method: &str, timeout: Duration, e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::Timeout {
            node: node.to_string(),
            method: method.to_string(),
            timeout,
        }
    } else if e.is_decode() {
        RpcError::Remote {
            node: node.to_string(),
            method: method.to_string(),
            message: format!("invalid response: {}", e),
        }
    } else {
        RpcError::Transport {
            node: node.to_string(),
            message: e.to_string(),
        }
    }
}
