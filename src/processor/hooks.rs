use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::cluster::ClusterConfig;
use crate::config::HookFailurePolicy;
use crate::rpc::{call_many, NodeRpc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    fn as_str(self) -> &'static str {
        match self {
            HookPhase::Pre => "pre",
            HookPhase::Post => "post",
        }
    }
}

/// Hooks a logical unit wants run around its execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    /// Hook directory name, e.g. `instance-start`.
    pub path: String,
    /// Extra environment, without the `GANETI_` prefix.
    pub env: BTreeMap<String, String>,
    /// Nodes the hooks run on.
    pub nodes: Vec<String>,
}

impl HookSpec {
    pub fn new(path: impl Into<String>, nodes: Vec<String>) -> Self {
        Self {
            path: path.into(),
            env: BTreeMap::new(),
            nodes,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub node: String,
    pub message: String,
}

/// One script result as reported by a node.
#[derive(Debug, Deserialize)]
struct ScriptResult {
    script: String,
    status: String,
    #[serde(default)]
    output: String,
}

pub struct HookRunner {
    rpc: Arc<dyn NodeRpc>,
    policy: HookFailurePolicy,
    timeout: Duration,
}

impl HookRunner {
    pub fn new(rpc: Arc<dyn NodeRpc>, policy: HookFailurePolicy, timeout: Duration) -> Self {
        Self {
            rpc,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> HookFailurePolicy {
        self.policy
    }

    /// Run the hooks of one phase on every node of `spec`.
    ///
    /// Offline nodes are skipped. Returns the failures, empty on success.
    pub async fn run(
        &self,
        phase: HookPhase,
        op_id: &str,
        spec: &HookSpec,
        config: &ClusterConfig,
    ) -> Vec<HookFailure> {
        let nodes: Vec<String> = spec
            .nodes
            .iter()
            .filter(|n| config.nodes.get(n.as_str()).map_or(true, |node| !node.offline))
            .cloned()
            .collect();
        if nodes.is_empty() {
            return Vec::new();
        }

        let params = json!({
            "hpath": spec.path,
            "phase": phase.as_str(),
            "env": environment(phase, op_id, spec, config),
        });
        tracing::debug!(
            hook = %spec.path,
            phase = phase.as_str(),
            nodes = nodes.len(),
            "Running hooks"
        );

        let mut failures = Vec::new();
        for (node, result) in call_many(&self.rpc, &nodes, "hooks_runner", params, self.timeout).await
        {
            match result {
                Ok(value) => failures.extend(script_failures(&node, value)),
                Err(e) => failures.push(HookFailure {
                    node,
                    message: e.to_string(),
                }),
            }
        }
        failures
    }
}

fn environment(
    phase: HookPhase,
    op_id: &str,
    spec: &HookSpec,
    config: &ClusterConfig,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = spec
        .env
        .iter()
        .map(|(k, v)| (format!("GANETI_{}", k), v.clone()))
        .collect();
    env.insert("GANETI_HOOKS_VERSION".into(), "2".into());
    env.insert("GANETI_HOOKS_PATH".into(), spec.path.clone());
    env.insert("GANETI_HOOKS_PHASE".into(), phase.as_str().into());
    env.insert("GANETI_OP_CODE".into(), op_id.into());
    env.insert("GANETI_CLUSTER".into(), config.cluster.name.clone());
    env.insert("GANETI_MASTER".into(), config.cluster.master_node.clone());
    env
}

fn script_failures(node: &str, value: Value) -> Vec<HookFailure> {
    let scripts: Vec<ScriptResult> = match serde_json::from_value(value) {
        Ok(scripts) => scripts,
        Err(e) => {
            return vec![HookFailure {
                node: node.to_string(),
                message: format!("invalid hook result: {}", e),
            }]
        }
    };
    scripts
        .into_iter()
        .filter(|s| s.status == "fail")
        .map(|s| HookFailure {
            node: node.to_string(),
            message: format!("{} failed: {}", s.script, s.output.trim()),
        })
        .collect()
}

pub fn describe(failures: &[HookFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.node, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_scripts_are_reported() {
        let value = json!([
            {"script": "00-ok", "status": "success", "output": ""},
            {"script": "10-check", "status": "fail", "output": "disk full\n"},
            {"script": "20-skip", "status": "skip"},
        ]);
        let failures = script_failures("node1", value);
        assert_eq!(
            failures,
            vec![HookFailure {
                node: "node1".into(),
                message: "10-check failed: disk full".into(),
            }]
        );
    }

    #[test]
    fn malformed_result_is_a_failure() {
        let failures = script_failures("node1", json!({"oops": true}));
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn environment_is_prefixed() {
        let cfg = ClusterConfig::new("c1", "node1");
        let spec = HookSpec::new("instance-start", vec!["node1".into()])
            .with_env("INSTANCE_NAME", "web1");
        let env = environment(HookPhase::Pre, "OP_INSTANCE_STARTUP", &spec, &cfg);
        assert_eq!(env["GANETI_INSTANCE_NAME"], "web1");
        assert_eq!(env["GANETI_HOOKS_PHASE"], "pre");
        assert_eq!(env["GANETI_OP_CODE"], "OP_INSTANCE_STARTUP");
        assert_eq!(env["GANETI_MASTER"], "node1");
    }
}
