//! Opcodes: the typed operations a job is made of.
//!
//! An opcode travels as JSON tagged by `OP_ID`, for example
//! `{"OP_ID": "OP_INSTANCE_STARTUP", "instance_name": "web1"}`. Generic
//! fields (`priority`, `depends`, `dry_run`, `comment`) sit next to the
//! opcode's own parameters and are carried by [`OpInput`].
//!
//! Each variant also declares which locks it needs ([`OpCode::lock_template`]).
//! The processor expands the template against the cluster configuration and
//! acquires the result in canonical order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cluster::{ObjectKind, DEFAULT_NODE_GROUP};
use crate::locking::LockMode;
use crate::scheduler::job::JobStatus;

pub const OP_PRIO_HIGHEST: i32 = -20;
pub const OP_PRIO_HIGH: i32 = -10;
pub const OP_PRIO_NORMAL: i32 = 0;
pub const OP_PRIO_LOW: i32 = 10;
pub const OP_PRIO_LOWEST: i32 = 19;
pub const OP_PRIO_DEFAULT: i32 = OP_PRIO_NORMAL;

/// Priorities clients may submit with.
pub const OP_PRIO_SUBMIT_VALID: [i32; 3] = [OP_PRIO_HIGH, OP_PRIO_NORMAL, OP_PRIO_LOW];

/// Longest delay an `OP_TEST_DELAY` may ask for, in seconds.
pub const MAX_TEST_DELAY_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebootType {
    Soft,
    Hard,
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "OP_ID")]
pub enum OpCode {
    #[serde(rename = "OP_CLUSTER_VERIFY")]
    ClusterVerify {
        #[serde(default)]
        skip_checks: Vec<String>,
    },
    #[serde(rename = "OP_CLUSTER_QUERY")]
    ClusterQuery {},
    #[serde(rename = "OP_CLUSTER_RENAME")]
    ClusterRename { name: String },
    #[serde(rename = "OP_CLUSTER_SET_PARAMS")]
    ClusterSetParams {
        #[serde(default)]
        hvparams: BTreeMap<String, String>,
    },

    #[serde(rename = "OP_NODE_ADD")]
    NodeAdd {
        node_name: String,
        #[serde(default)]
        primary_ip: Option<String>,
        #[serde(default)]
        group_name: Option<String>,
    },
    #[serde(rename = "OP_NODE_REMOVE")]
    NodeRemove { node_name: String },
    #[serde(rename = "OP_NODE_SET_PARAMS")]
    NodeSetParams {
        node_name: String,
        #[serde(default)]
        offline: Option<bool>,
        #[serde(default)]
        drained: Option<bool>,
    },

    #[serde(rename = "OP_GROUP_ADD")]
    GroupAdd { group_name: String },
    #[serde(rename = "OP_GROUP_ASSIGN_NODES")]
    GroupAssignNodes {
        group_name: String,
        nodes: Vec<String>,
    },
    #[serde(rename = "OP_GROUP_REMOVE")]
    GroupRemove { group_name: String },

    #[serde(rename = "OP_INSTANCE_CREATE")]
    InstanceCreate {
        instance_name: String,
        primary_node: String,
        #[serde(default)]
        secondary_node: Option<String>,
        memory_mb: u64,
        #[serde(default = "default_vcpus")]
        vcpus: u32,
        disks: Vec<u64>,
        #[serde(default = "default_true")]
        start: bool,
    },
    #[serde(rename = "OP_INSTANCE_STARTUP")]
    InstanceStartup {
        instance_name: String,
        #[serde(default)]
        force: bool,
    },
    #[serde(rename = "OP_INSTANCE_SHUTDOWN")]
    InstanceShutdown {
        instance_name: String,
        #[serde(default = "default_shutdown_timeout")]
        timeout_secs: u64,
    },
    #[serde(rename = "OP_INSTANCE_REBOOT")]
    InstanceReboot {
        instance_name: String,
        #[serde(default = "default_reboot_type")]
        reboot_type: RebootType,
    },
    #[serde(rename = "OP_INSTANCE_REMOVE")]
    InstanceRemove {
        instance_name: String,
        #[serde(default)]
        ignore_failures: bool,
    },
    #[serde(rename = "OP_INSTANCE_MIGRATE")]
    InstanceMigrate {
        instance_name: String,
        target_node: String,
        #[serde(default = "default_true")]
        live: bool,
    },
    #[serde(rename = "OP_INSTANCE_QUERY")]
    InstanceQuery {
        #[serde(default)]
        names: Vec<String>,
    },

    #[serde(rename = "OP_TAGS_SET")]
    TagsSet {
        kind: ObjectKind,
        #[serde(default)]
        name: String,
        tags: Vec<String>,
    },
    #[serde(rename = "OP_TAGS_DEL")]
    TagsDel {
        kind: ObjectKind,
        #[serde(default)]
        name: String,
        tags: Vec<String>,
    },

    #[serde(rename = "OP_TEST_DELAY")]
    TestDelay {
        duration: f64,
        #[serde(default = "default_true")]
        on_master: bool,
        #[serde(default)]
        on_nodes: Vec<String>,
        #[serde(default)]
        repeat: u32,
    },
    #[serde(rename = "OP_TEST_JQUEUE")]
    TestJqueue {
        #[serde(default)]
        log_messages: Vec<String>,
        #[serde(default)]
        fail: bool,
    },
}

fn default_true() -> bool {
    true
}

fn default_vcpus() -> u32 {
    1
}

fn default_shutdown_timeout() -> u64 {
    120
}

fn default_reboot_type() -> RebootType {
    RebootType::Hard
}

/// Locks wanted at one level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockSpec {
    None,
    Named(Vec<String>, LockMode),
    /// Every object at the level known to the configuration.
    All(LockMode),
    /// The nodes of the named instances, plus `extra` nodes.
    InstanceNodes {
        instances: Vec<String>,
        extra: Vec<String>,
        mode: LockMode,
    },
}

/// Declarative lock requirements of one opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTemplate {
    pub bgl: LockMode,
    pub cluster: Option<LockMode>,
    pub node_groups: LockSpec,
    pub nodes: LockSpec,
    pub instances: LockSpec,
}

impl Default for LockTemplate {
    fn default() -> Self {
        Self {
            bgl: LockMode::Shared,
            cluster: None,
            node_groups: LockSpec::None,
            nodes: LockSpec::None,
            instances: LockSpec::None,
        }
    }
}

fn one(name: &str, mode: LockMode) -> LockSpec {
    LockSpec::Named(vec![name.to_string()], mode)
}

impl OpCode {
    pub fn op_id(&self) -> &'static str {
        match self {
            OpCode::ClusterVerify { .. } => "OP_CLUSTER_VERIFY",
            OpCode::ClusterQuery {} => "OP_CLUSTER_QUERY",
            OpCode::ClusterRename { .. } => "OP_CLUSTER_RENAME",
            OpCode::ClusterSetParams { .. } => "OP_CLUSTER_SET_PARAMS",
            OpCode::NodeAdd { .. } => "OP_NODE_ADD",
            OpCode::NodeRemove { .. } => "OP_NODE_REMOVE",
            OpCode::NodeSetParams { .. } => "OP_NODE_SET_PARAMS",
            OpCode::GroupAdd { .. } => "OP_GROUP_ADD",
            OpCode::GroupAssignNodes { .. } => "OP_GROUP_ASSIGN_NODES",
            OpCode::GroupRemove { .. } => "OP_GROUP_REMOVE",
            OpCode::InstanceCreate { .. } => "OP_INSTANCE_CREATE",
            OpCode::InstanceStartup { .. } => "OP_INSTANCE_STARTUP",
            OpCode::InstanceShutdown { .. } => "OP_INSTANCE_SHUTDOWN",
            OpCode::InstanceReboot { .. } => "OP_INSTANCE_REBOOT",
            OpCode::InstanceRemove { .. } => "OP_INSTANCE_REMOVE",
            OpCode::InstanceMigrate { .. } => "OP_INSTANCE_MIGRATE",
            OpCode::InstanceQuery { .. } => "OP_INSTANCE_QUERY",
            OpCode::TagsSet { .. } => "OP_TAGS_SET",
            OpCode::TagsDel { .. } => "OP_TAGS_DEL",
            OpCode::TestDelay { .. } => "OP_TEST_DELAY",
            OpCode::TestJqueue { .. } => "OP_TEST_JQUEUE",
        }
    }

    /// Short description such as `INSTANCE_STARTUP(web1)`.
    pub fn summary(&self) -> String {
        let id = self.op_id().trim_start_matches("OP_");
        let detail = match self {
            OpCode::ClusterRename { name } => Some(name.clone()),
            OpCode::NodeAdd { node_name, .. }
            | OpCode::NodeRemove { node_name }
            | OpCode::NodeSetParams { node_name, .. } => Some(node_name.clone()),
            OpCode::GroupAdd { group_name }
            | OpCode::GroupAssignNodes { group_name, .. }
            | OpCode::GroupRemove { group_name } => Some(group_name.clone()),
            OpCode::InstanceCreate { instance_name, .. }
            | OpCode::InstanceStartup { instance_name, .. }
            | OpCode::InstanceShutdown { instance_name, .. }
            | OpCode::InstanceReboot { instance_name, .. }
            | OpCode::InstanceRemove { instance_name, .. }
            | OpCode::InstanceMigrate { instance_name, .. } => Some(instance_name.clone()),
            OpCode::TagsSet { kind, name, .. } | OpCode::TagsDel { kind, name, .. } => {
                Some(if name.is_empty() {
                    kind.to_string()
                } else {
                    format!("{}/{}", kind, name)
                })
            }
            OpCode::TestDelay { duration, .. } => Some(format!("{}", duration)),
            _ => None,
        };
        match detail {
            Some(detail) => format!("{}({})", id, detail),
            None => id.to_string(),
        }
    }

    /// Lock requirements, consumed uniformly by the processor.
    pub fn lock_template(&self) -> LockTemplate {
        use LockMode::{Exclusive, Shared};

        match self {
            OpCode::ClusterVerify { .. } => LockTemplate {
                nodes: LockSpec::All(Shared),
                instances: LockSpec::All(Shared),
                ..Default::default()
            },
            OpCode::ClusterQuery {} | OpCode::InstanceQuery { .. } | OpCode::TestJqueue { .. } => {
                LockTemplate::default()
            }
            OpCode::ClusterRename { .. } => LockTemplate {
                bgl: Exclusive,
                ..Default::default()
            },
            OpCode::ClusterSetParams { .. } => LockTemplate {
                cluster: Some(Exclusive),
                ..Default::default()
            },
            OpCode::NodeAdd {
                node_name,
                group_name,
                ..
            } => LockTemplate {
                node_groups: one(group_name.as_deref().unwrap_or(DEFAULT_NODE_GROUP), Shared),
                nodes: one(node_name, Exclusive),
                ..Default::default()
            },
            OpCode::NodeRemove { node_name } | OpCode::NodeSetParams { node_name, .. } => {
                LockTemplate {
                    nodes: one(node_name, Exclusive),
                    ..Default::default()
                }
            }
            OpCode::GroupAdd { group_name } | OpCode::GroupRemove { group_name } => LockTemplate {
                node_groups: one(group_name, Exclusive),
                ..Default::default()
            },
            OpCode::GroupAssignNodes { group_name, nodes } => LockTemplate {
                node_groups: one(group_name, Exclusive),
                nodes: LockSpec::Named(nodes.clone(), Exclusive),
                ..Default::default()
            },
            OpCode::InstanceCreate {
                instance_name,
                primary_node,
                secondary_node,
                ..
            } => {
                let mut nodes = vec![primary_node.clone()];
                nodes.extend(secondary_node.iter().cloned());
                LockTemplate {
                    nodes: LockSpec::Named(nodes, Exclusive),
                    instances: one(instance_name, Exclusive),
                    ..Default::default()
                }
            }
            OpCode::InstanceStartup { instance_name, .. }
            | OpCode::InstanceShutdown { instance_name, .. }
            | OpCode::InstanceReboot { instance_name, .. } => LockTemplate {
                nodes: LockSpec::InstanceNodes {
                    instances: vec![instance_name.clone()],
                    extra: Vec::new(),
                    mode: Shared,
                },
                instances: one(instance_name, Exclusive),
                ..Default::default()
            },
            OpCode::InstanceRemove { instance_name, .. } => LockTemplate {
                nodes: LockSpec::InstanceNodes {
                    instances: vec![instance_name.clone()],
                    extra: Vec::new(),
                    mode: Exclusive,
                },
                instances: one(instance_name, Exclusive),
                ..Default::default()
            },
            OpCode::InstanceMigrate {
                instance_name,
                target_node,
                ..
            } => LockTemplate {
                nodes: LockSpec::InstanceNodes {
                    instances: vec![instance_name.clone()],
                    extra: vec![target_node.clone()],
                    mode: Exclusive,
                },
                instances: one(instance_name, Exclusive),
                ..Default::default()
            },
            OpCode::TagsSet { kind, name, .. } | OpCode::TagsDel { kind, name, .. } => {
                let mut template = LockTemplate::default();
                match kind {
                    ObjectKind::Cluster => template.cluster = Some(Exclusive),
                    ObjectKind::NodeGroup => template.node_groups = one(name, Exclusive),
                    ObjectKind::Node => template.nodes = one(name, Exclusive),
                    ObjectKind::Instance => template.instances = one(name, Exclusive),
                }
                template
            }
            OpCode::TestDelay { on_nodes, .. } => LockTemplate {
                nodes: if on_nodes.is_empty() {
                    LockSpec::None
                } else {
                    LockSpec::Named(on_nodes.clone(), Shared)
                },
                ..Default::default()
            },
        }
    }

    fn validate_params(&self) -> Result<(), String> {
        match self {
            OpCode::ClusterVerify { .. }
            | OpCode::ClusterQuery {}
            | OpCode::ClusterSetParams { .. }
            | OpCode::InstanceQuery { .. }
            | OpCode::TestJqueue { .. } => Ok(()),
            OpCode::ClusterRename { name } => check_name("name", name),
            OpCode::NodeAdd {
                node_name,
                group_name,
                ..
            } => {
                check_name("node_name", node_name)?;
                match group_name {
                    Some(group) => check_name("group_name", group),
                    None => Ok(()),
                }
            }
            OpCode::NodeRemove { node_name } => check_name("node_name", node_name),
            OpCode::NodeSetParams {
                node_name,
                offline,
                drained,
            } => {
                check_name("node_name", node_name)?;
                if offline.is_none() && drained.is_none() {
                    return Err("no parameters to change".to_string());
                }
                Ok(())
            }
            OpCode::GroupAdd { group_name } | OpCode::GroupRemove { group_name } => {
                check_name("group_name", group_name)
            }
            OpCode::GroupAssignNodes { group_name, nodes } => {
                check_name("group_name", group_name)?;
                if nodes.is_empty() {
                    return Err("nodes must not be empty".to_string());
                }
                nodes.iter().try_for_each(|n| check_name("nodes", n))
            }
            OpCode::InstanceCreate {
                instance_name,
                primary_node,
                secondary_node,
                memory_mb,
                vcpus,
                disks,
                ..
            } => {
                check_name("instance_name", instance_name)?;
                check_name("primary_node", primary_node)?;
                if let Some(secondary) = secondary_node {
                    check_name("secondary_node", secondary)?;
                    if secondary == primary_node {
                        return Err("secondary_node must differ from primary_node".to_string());
                    }
                }
                if *memory_mb == 0 {
                    return Err("memory_mb must be positive".to_string());
                }
                if *vcpus == 0 {
                    return Err("vcpus must be positive".to_string());
                }
                if disks.is_empty() || disks.contains(&0) {
                    return Err("disks must list positive sizes".to_string());
                }
                Ok(())
            }
            OpCode::InstanceStartup { instance_name, .. }
            | OpCode::InstanceShutdown { instance_name, .. }
            | OpCode::InstanceReboot { instance_name, .. }
            | OpCode::InstanceRemove { instance_name, .. } => {
                check_name("instance_name", instance_name)
            }
            OpCode::InstanceMigrate {
                instance_name,
                target_node,
                ..
            } => {
                check_name("instance_name", instance_name)?;
                check_name("target_node", target_node)
            }
            OpCode::TagsSet { kind, name, tags } | OpCode::TagsDel { kind, name, tags } => {
                if *kind != ObjectKind::Cluster {
                    check_name("name", name)?;
                }
                if tags.is_empty() {
                    return Err("tags must not be empty".to_string());
                }
                tags.iter().try_for_each(|t| check_name("tags", t))
            }
            OpCode::TestDelay {
                duration, on_nodes, ..
            } => {
                if !duration.is_finite() || *duration < 0.0 || *duration > MAX_TEST_DELAY_SECS {
                    return Err(format!("invalid delay duration {}", duration));
                }
                on_nodes.iter().try_for_each(|n| check_name("on_nodes", n))
            }
        }
    }
}

fn check_name(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} must not be empty", field));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("{} contains whitespace: {:?}", field, value));
    }
    Ok(())
}

/// Dependency of an opcode on another job reaching a final status.
///
/// A negative `job_id` is relative to the submitted batch: `-1` is the job
/// submitted just before this one. Relative ids are resolved at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDependency {
    pub job_id: i64,
    /// Accepted final statuses; empty accepts any.
    #[serde(default)]
    pub statuses: Vec<JobStatus>,
}

/// An opcode with the parameters every opcode accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpInput {
    #[serde(flatten)]
    pub op: OpCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<JobDependency>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl From<OpCode> for OpInput {
    fn from(op: OpCode) -> Self {
        Self {
            op,
            priority: None,
            depends: Vec::new(),
            dry_run: false,
            comment: None,
        }
    }
}

/// Why an opcode was refused at submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidOp {
    Priority(i32),
    Params(String),
}

impl OpInput {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_dependency(mut self, job_id: i64, statuses: Vec<JobStatus>) -> Self {
        self.depends.push(JobDependency { job_id, statuses });
        self
    }

    pub fn summary(&self) -> String {
        self.op.summary()
    }

    pub fn validate(&self) -> Result<(), InvalidOp> {
        if let Some(priority) = self.priority {
            if !OP_PRIO_SUBMIT_VALID.contains(&priority) {
                return Err(InvalidOp::Priority(priority));
            }
        }
        for dep in &self.depends {
            if dep.job_id == 0 {
                return Err(InvalidOp::Params("dependency on job 0".to_string()));
            }
            if let Some(status) = dep.statuses.iter().find(|s| !s.is_finalized()) {
                return Err(InvalidOp::Params(format!(
                    "dependency status {} is not a final status",
                    status
                )));
            }
        }
        self.op
            .validate_params()
            .map_err(|e| InvalidOp::Params(format!("{}: {}", self.op.op_id(), e)))
    }
}
