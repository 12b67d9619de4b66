//! Logical units: the per-opcode prerequisite checks and execution.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::hooks::HookSpec;
use super::{ExecContext, OpError};
use crate::cluster::{
    ClusterConfig, ConfigObject, Instance, Node, NodeGroup, ObjectKind, DEFAULT_NODE_GROUP,
};
use crate::locking::ResourceName;
use crate::opcodes::{OpCode, RebootType};
use crate::scheduler::job::LogKind;

#[async_trait]
pub trait LogicalUnit: Send + Sync {
    /// Verify the opcode can run against `config` with the `owned` locks.
    /// Must not change anything.
    fn check_prereq(&self, _config: &ClusterConfig, _owned: &[ResourceName]) -> Result<(), OpError> {
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError>;

    /// Hooks to run around [`LogicalUnit::exec`], if any.
    fn hooks(&self, _config: &ClusterConfig) -> Option<HookSpec> {
        None
    }
}

pub fn logical_unit(op: &OpCode) -> Box<dyn LogicalUnit> {
    match op.clone() {
        OpCode::ClusterVerify { skip_checks } => Box::new(ClusterVerify { skip_checks }),
        OpCode::ClusterQuery {} => Box::new(ClusterQuery),
        OpCode::ClusterRename { name } => Box::new(ClusterRename { name }),
        OpCode::ClusterSetParams { hvparams } => Box::new(ClusterSetParams { hvparams }),
        OpCode::NodeAdd {
            node_name,
            primary_ip,
            group_name,
        } => Box::new(NodeAdd {
            node_name,
            primary_ip,
            group_name: group_name.unwrap_or_else(|| DEFAULT_NODE_GROUP.to_string()),
        }),
        OpCode::NodeRemove { node_name } => Box::new(NodeRemove { node_name }),
        OpCode::NodeSetParams {
            node_name,
            offline,
            drained,
        } => Box::new(NodeSetParams {
            node_name,
            offline,
            drained,
        }),
        OpCode::GroupAdd { group_name } => Box::new(GroupAdd { group_name }),
        OpCode::GroupAssignNodes { group_name, nodes } => {
            Box::new(GroupAssignNodes { group_name, nodes })
        }
        OpCode::GroupRemove { group_name } => Box::new(GroupRemove { group_name }),
        OpCode::InstanceCreate {
            instance_name,
            primary_node,
            secondary_node,
            memory_mb,
            vcpus,
            disks,
            start,
        } => Box::new(InstanceCreate {
            instance: Instance {
                name: instance_name,
                primary_node,
                secondary_node,
                memory_mb,
                vcpus,
                disks,
                admin_up: false,
                tags: Default::default(),
                serial: 0,
            },
            start,
        }),
        OpCode::InstanceStartup {
            instance_name,
            force,
        } => Box::new(InstanceStartup {
            name: instance_name,
            force,
        }),
        OpCode::InstanceShutdown {
            instance_name,
            timeout_secs,
        } => Box::new(InstanceShutdown {
            name: instance_name,
            timeout_secs,
        }),
        OpCode::InstanceReboot {
            instance_name,
            reboot_type,
        } => Box::new(InstanceReboot {
            name: instance_name,
            reboot_type,
        }),
        OpCode::InstanceRemove {
            instance_name,
            ignore_failures,
        } => Box::new(InstanceRemove {
            name: instance_name,
            ignore_failures,
        }),
        OpCode::InstanceMigrate {
            instance_name,
            target_node,
            live,
        } => Box::new(InstanceMigrate {
            name: instance_name,
            target: target_node,
            live,
        }),
        OpCode::InstanceQuery { names } => Box::new(InstanceQuery { names }),
        OpCode::TagsSet { kind, name, tags } => Box::new(Tags {
            kind,
            name,
            tags,
            add: true,
        }),
        OpCode::TagsDel { kind, name, tags } => Box::new(Tags {
            kind,
            name,
            tags,
            add: false,
        }),
        OpCode::TestDelay {
            duration,
            on_master,
            on_nodes,
            repeat,
        } => Box::new(TestDelay {
            duration,
            on_master,
            on_nodes,
            repeat,
        }),
        OpCode::TestJqueue { log_messages, fail } => {
            Box::new(TestJqueue { log_messages, fail })
        }
    }
}

// ---------------------------------------------------------------------------
// Shared checks
// ---------------------------------------------------------------------------

fn instance<'c>(config: &'c ClusterConfig, name: &str) -> Result<&'c Instance, OpError> {
    config
        .instances
        .get(name)
        .ok_or_else(|| OpError::prereq(format!("instance {} does not exist", name)))
}

fn node<'c>(config: &'c ClusterConfig, name: &str) -> Result<&'c Node, OpError> {
    config
        .nodes
        .get(name)
        .ok_or_else(|| OpError::prereq(format!("node {} does not exist", name)))
}

fn online_node<'c>(config: &'c ClusterConfig, name: &str) -> Result<&'c Node, OpError> {
    let node = node(config, name)?;
    if node.offline {
        return Err(OpError::prereq(format!("node {} is offline", name)));
    }
    Ok(node)
}

/// Locks are computed before the configuration is read again; fail if the
/// set of objects changed in between.
fn ensure_locked(owned: &[ResourceName], resource: ResourceName) -> Result<(), OpError> {
    if owned.contains(&resource) {
        Ok(())
    } else {
        Err(OpError::prereq(format!(
            "lock {} is not held, configuration changed while acquiring locks",
            resource
        )))
    }
}

fn ensure_nodes_locked(owned: &[ResourceName], instance: &Instance) -> Result<(), OpError> {
    instance
        .nodes()
        .into_iter()
        .try_for_each(|n| ensure_locked(owned, ResourceName::node(n)))
}

fn instance_hooks(path: &str, config: &ClusterConfig, instance: &Instance) -> HookSpec {
    let mut nodes = vec![config.cluster.master_node.clone()];
    nodes.extend(
        instance
            .nodes()
            .into_iter()
            .filter(|n| *n != config.cluster.master_node),
    );
    HookSpec::new(path, nodes)
        .with_env("INSTANCE_NAME", instance.name.clone())
        .with_env("INSTANCE_PRIMARY", instance.primary_node.clone())
        .with_env(
            "INSTANCE_SECONDARY",
            instance.secondary_node.clone().unwrap_or_default(),
        )
}

fn master_hooks(path: &str, config: &ClusterConfig) -> HookSpec {
    HookSpec::new(path, vec![config.cluster.master_node.clone()])
}

/// Set `admin_up` on an instance in the configuration.
fn set_admin_state(ctx: &ExecContext<'_>, name: &str, up: bool) -> Result<(), OpError> {
    let snapshot = ctx.snapshot();
    let mut inst = instance(&snapshot, name)?.clone();
    if inst.admin_up == up {
        return Ok(());
    }
    let serial = inst.serial;
    inst.admin_up = up;
    ctx.config().update(ConfigObject::Instance(inst), serial)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

struct ClusterVerify {
    skip_checks: Vec<String>,
}

#[async_trait]
impl LogicalUnit for ClusterVerify {
    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let config = ctx.snapshot();
        let (offline, online): (Vec<&Node>, Vec<&Node>) =
            config.nodes.values().partition(|n| n.offline);
        let online: Vec<String> = online.iter().map(|n| n.name.clone()).collect();
        let offline: Vec<String> = offline.iter().map(|n| n.name.clone()).collect();

        ctx.feedback(format!("Verifying {} nodes", online.len()));
        let params = json!({
            "cluster_name": config.cluster.name,
            "skip_checks": self.skip_checks,
        });
        let mut failed = Vec::new();
        for (node, result) in ctx.call_many(&online, "node_verify", params).await {
            if let Err(e) = result {
                ctx.feedback(format!("Node {} failed verification: {}", node, e));
                failed.push(node);
            }
        }
        for node in &offline {
            ctx.feedback(format!("Skipping offline node {}", node));
        }

        let mut missing = Vec::new();
        for inst in config.instances.values() {
            for n in inst.nodes() {
                if !config.nodes.contains_key(&n) {
                    missing.push(format!("{}: unknown node {}", inst.name, n));
                }
            }
        }
        for problem in &missing {
            ctx.feedback(format!("Instance {}", problem));
        }

        Ok(json!({
            "ok": failed.is_empty() && missing.is_empty(),
            "failed_nodes": failed,
            "offline_nodes": offline,
            "instance_problems": missing,
        }))
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        Some(master_hooks("cluster-verify", config))
    }
}

struct ClusterQuery;

#[async_trait]
impl LogicalUnit for ClusterQuery {
    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let config = ctx.snapshot();
        Ok(json!({
            "name": config.cluster.name,
            "master": config.cluster.master_node,
            "serial": config.serial,
            "tags": config.cluster.tags,
            "hvparams": config.cluster.hvparams,
            "node_groups": config.node_groups.len(),
            "nodes": config.nodes.len(),
            "instances": config.instances.len(),
        }))
    }
}

struct ClusterRename {
    name: String,
}

#[async_trait]
impl LogicalUnit for ClusterRename {
    fn check_prereq(&self, config: &ClusterConfig, _owned: &[ResourceName]) -> Result<(), OpError> {
        if config.cluster.name == self.name {
            return Err(OpError::prereq(format!(
                "cluster is already named {}",
                self.name
            )));
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let mut cluster = ctx.snapshot().cluster.clone();
        let serial = cluster.serial;
        let old = std::mem::replace(&mut cluster.name, self.name.clone());
        ctx.config().update(ConfigObject::Cluster(cluster), serial)?;
        ctx.feedback(format!("Cluster renamed from {} to {}", old, self.name));
        Ok(Value::String(self.name.clone()))
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        Some(master_hooks("cluster-rename", config).with_env("NEW_NAME", self.name.clone()))
    }
}

struct ClusterSetParams {
    hvparams: BTreeMap<String, String>,
}

#[async_trait]
impl LogicalUnit for ClusterSetParams {
    fn check_prereq(&self, _config: &ClusterConfig, _owned: &[ResourceName]) -> Result<(), OpError> {
        if self.hvparams.is_empty() {
            return Err(OpError::prereq("no parameters to change"));
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let mut cluster = ctx.snapshot().cluster.clone();
        let serial = cluster.serial;
        for (key, value) in &self.hvparams {
            // An empty value resets the parameter to its default.
            if value.is_empty() {
                cluster.hvparams.remove(key);
            } else {
                cluster.hvparams.insert(key.clone(), value.clone());
            }
        }
        let hvparams = cluster.hvparams.clone();
        ctx.config().update(ConfigObject::Cluster(cluster), serial)?;
        Ok(json!(hvparams))
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        Some(master_hooks("cluster-modify", config))
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

struct NodeAdd {
    node_name: String,
    primary_ip: Option<String>,
    group_name: String,
}

#[async_trait]
impl LogicalUnit for NodeAdd {
    fn check_prereq(&self, config: &ClusterConfig, _owned: &[ResourceName]) -> Result<(), OpError> {
        if config.nodes.contains_key(&self.node_name) {
            return Err(OpError::prereq(format!(
                "node {} is already in the cluster",
                self.node_name
            )));
        }
        if !config.node_groups.contains_key(&self.group_name) {
            return Err(OpError::prereq(format!(
                "node group {} does not exist",
                self.group_name
            )));
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let target = self.primary_ip.as_deref().unwrap_or(&self.node_name);
        let info = ctx
            .call(target, "node_info", json!({ "node": self.node_name }))
            .await?;
        ctx.feedback(format!("Node {} is reachable", self.node_name));

        let mut node = Node::new(self.node_name.clone(), self.group_name.clone());
        node.primary_ip = self.primary_ip.clone();
        ctx.config().add(ConfigObject::Node(node))?;
        Ok(info)
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        Some(
            master_hooks("node-add", config)
                .with_env("NODE_NAME", self.node_name.clone())
                .with_env("NODE_GROUP", self.group_name.clone()),
        )
    }
}

struct NodeRemove {
    node_name: String,
}

#[async_trait]
impl LogicalUnit for NodeRemove {
    fn check_prereq(&self, config: &ClusterConfig, _owned: &[ResourceName]) -> Result<(), OpError> {
        node(config, &self.node_name)?;
        if config.cluster.master_node == self.node_name {
            return Err(OpError::prereq("the master node cannot be removed"));
        }
        let instances = config.instances_on_node(&self.node_name);
        if !instances.is_empty() {
            let names: Vec<&str> = instances.iter().map(|i| i.name.as_str()).collect();
            return Err(OpError::prereq(format!(
                "node {} still hosts instances: {}",
                self.node_name,
                names.join(", ")
            )));
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let snapshot = ctx.snapshot();
        let serial = node(&snapshot, &self.node_name)?.serial;
        ctx.config()
            .remove(ObjectKind::Node, &self.node_name, serial)?;
        // The node may already be gone; removal from the configuration stands.
        if let Err(e) = ctx
            .call(&self.node_name, "node_leave_cluster", json!({}))
            .await
        {
            ctx.feedback(format!("Node {} did not leave cleanly: {}", self.node_name, e));
        }
        Ok(Value::Null)
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        Some(master_hooks("node-remove", config).with_env("NODE_NAME", self.node_name.clone()))
    }
}

struct NodeSetParams {
    node_name: String,
    offline: Option<bool>,
    drained: Option<bool>,
}

#[async_trait]
impl LogicalUnit for NodeSetParams {
    fn check_prereq(&self, config: &ClusterConfig, _owned: &[ResourceName]) -> Result<(), OpError> {
        node(config, &self.node_name)?;
        if self.offline == Some(true) {
            if config.cluster.master_node == self.node_name {
                return Err(OpError::prereq("the master node cannot be set offline"));
            }
            if let Some(inst) = config
                .instances_on_node(&self.node_name)
                .into_iter()
                .find(|i| i.admin_up && i.primary_node == self.node_name)
            {
                return Err(OpError::prereq(format!(
                    "instance {} is running on node {}",
                    inst.name, self.node_name
                )));
            }
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let snapshot = ctx.snapshot();
        let mut node = node(&snapshot, &self.node_name)?.clone();
        let serial = node.serial;
        let mut changes = serde_json::Map::new();
        if let Some(offline) = self.offline {
            node.offline = offline;
            changes.insert("offline".into(), Value::Bool(offline));
        }
        if let Some(drained) = self.drained {
            node.drained = drained;
            changes.insert("drained".into(), Value::Bool(drained));
        }
        ctx.config().update(ConfigObject::Node(node), serial)?;
        Ok(Value::Object(changes))
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        Some(master_hooks("node-modify", config).with_env("NODE_NAME", self.node_name.clone()))
    }
}

// ---------------------------------------------------------------------------
// Node groups
// ---------------------------------------------------------------------------

struct GroupAdd {
    group_name: String,
}

#[async_trait]
impl LogicalUnit for GroupAdd {
    fn check_prereq(&self, config: &ClusterConfig, _owned: &[ResourceName]) -> Result<(), OpError> {
        if config.node_groups.contains_key(&self.group_name) {
            return Err(OpError::prereq(format!(
                "node group {} already exists",
                self.group_name
            )));
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        ctx.config()
            .add(ConfigObject::NodeGroup(NodeGroup::new(self.group_name.clone())))?;
        Ok(Value::Null)
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        Some(master_hooks("group-add", config).with_env("GROUP_NAME", self.group_name.clone()))
    }
}

struct GroupAssignNodes {
    group_name: String,
    nodes: Vec<String>,
}

#[async_trait]
impl LogicalUnit for GroupAssignNodes {
    fn check_prereq(&self, config: &ClusterConfig, owned: &[ResourceName]) -> Result<(), OpError> {
        if !config.node_groups.contains_key(&self.group_name) {
            return Err(OpError::prereq(format!(
                "node group {} does not exist",
                self.group_name
            )));
        }
        for name in &self.nodes {
            node(config, name)?;
            ensure_locked(owned, ResourceName::node(name.clone()))?;
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let snapshot = ctx.snapshot();
        let mut moved = Vec::new();
        for name in &self.nodes {
            let mut node = node(&snapshot, name)?.clone();
            if node.group == self.group_name {
                continue;
            }
            let serial = node.serial;
            ctx.feedback(format!(
                "Moving node {} from {} to {}",
                name, node.group, self.group_name
            ));
            node.group = self.group_name.clone();
            ctx.config().update(ConfigObject::Node(node), serial)?;
            moved.push(name.clone());
        }
        Ok(json!({ "moved": moved }))
    }
}

struct GroupRemove {
    group_name: String,
}

#[async_trait]
impl LogicalUnit for GroupRemove {
    fn check_prereq(&self, config: &ClusterConfig, _owned: &[ResourceName]) -> Result<(), OpError> {
        if !config.node_groups.contains_key(&self.group_name) {
            return Err(OpError::prereq(format!(
                "node group {} does not exist",
                self.group_name
            )));
        }
        if config.node_groups.len() == 1 {
            return Err(OpError::prereq("the last node group cannot be removed"));
        }
        let members = config.nodes_in_group(&self.group_name);
        if !members.is_empty() {
            return Err(OpError::prereq(format!(
                "node group {} still has {} nodes",
                self.group_name,
                members.len()
            )));
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let serial = ctx
            .snapshot()
            .object_serial(ObjectKind::NodeGroup, &self.group_name)
            .ok_or_else(|| OpError::exec(format!("node group {} vanished", self.group_name)))?;
        ctx.config()
            .remove(ObjectKind::NodeGroup, &self.group_name, serial)?;
        Ok(Value::Null)
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        Some(master_hooks("group-remove", config).with_env("GROUP_NAME", self.group_name.clone()))
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

struct InstanceCreate {
    instance: Instance,
    start: bool,
}

#[async_trait]
impl LogicalUnit for InstanceCreate {
    fn check_prereq(&self, config: &ClusterConfig, _owned: &[ResourceName]) -> Result<(), OpError> {
        if config.instances.contains_key(&self.instance.name) {
            return Err(OpError::prereq(format!(
                "instance {} already exists",
                self.instance.name
            )));
        }
        for name in self.instance.nodes() {
            let node = online_node(config, &name)?;
            if node.drained {
                return Err(OpError::prereq(format!(
                    "node {} is drained, no new instances allowed",
                    name
                )));
            }
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let inst = &self.instance;
        let disks = json!({ "instance": inst.name, "disks": inst.disks });
        if let Some(secondary) = &inst.secondary_node {
            ctx.call(secondary, "blockdev_create", disks.clone()).await?;
        }
        ctx.call(&inst.primary_node, "blockdev_create", disks).await?;
        ctx.call(
            &inst.primary_node,
            "instance_os_add",
            json!({ "instance": inst.name, "memory_mb": inst.memory_mb, "vcpus": inst.vcpus }),
        )
        .await?;
        ctx.config().add(ConfigObject::Instance(inst.clone()))?;
        ctx.feedback(format!("Instance {} created on {}", inst.name, inst.primary_node));

        if self.start {
            ctx.call(
                &inst.primary_node,
                "instance_start",
                json!({ "instance": inst.name, "memory_mb": inst.memory_mb }),
            )
            .await?;
            set_admin_state(ctx, &inst.name, true)?;
            ctx.feedback(format!("Instance {} started", inst.name));
        }
        Ok(json!({ "instance": inst.name, "started": self.start }))
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        Some(instance_hooks("instance-add", config, &self.instance))
    }
}

struct InstanceStartup {
    name: String,
    force: bool,
}

#[async_trait]
impl LogicalUnit for InstanceStartup {
    fn check_prereq(&self, config: &ClusterConfig, owned: &[ResourceName]) -> Result<(), OpError> {
        let inst = instance(config, &self.name)?;
        ensure_nodes_locked(owned, inst)?;
        let primary = online_node(config, &inst.primary_node)?;
        if primary.drained && !self.force {
            return Err(OpError::prereq(format!(
                "primary node {} is drained",
                primary.name
            )));
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let snapshot = ctx.snapshot();
        let inst = instance(&snapshot, &self.name)?;
        ctx.call(
            &inst.primary_node,
            "instance_start",
            json!({ "instance": inst.name, "memory_mb": inst.memory_mb }),
        )
        .await?;
        set_admin_state(ctx, &self.name, true)?;
        Ok(Value::Null)
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        let inst = config.instances.get(&self.name)?;
        Some(instance_hooks("instance-start", config, inst))
    }
}

struct InstanceShutdown {
    name: String,
    timeout_secs: u64,
}

#[async_trait]
impl LogicalUnit for InstanceShutdown {
    fn check_prereq(&self, config: &ClusterConfig, owned: &[ResourceName]) -> Result<(), OpError> {
        let inst = instance(config, &self.name)?;
        ensure_nodes_locked(owned, inst)?;
        online_node(config, &inst.primary_node)?;
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let snapshot = ctx.snapshot();
        let inst = instance(&snapshot, &self.name)?;
        // Leave the node the full shutdown timeout plus some slack to answer.
        let timeout = Duration::from_secs(self.timeout_secs.saturating_add(10));
        ctx.call_with_timeout(
            &inst.primary_node,
            "instance_shutdown",
            json!({ "instance": inst.name, "timeout": self.timeout_secs }),
            timeout,
        )
        .await?;
        set_admin_state(ctx, &self.name, false)?;
        Ok(Value::Null)
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        let inst = config.instances.get(&self.name)?;
        Some(instance_hooks("instance-stop", config, inst))
    }
}

struct InstanceReboot {
    name: String,
    reboot_type: RebootType,
}

#[async_trait]
impl LogicalUnit for InstanceReboot {
    fn check_prereq(&self, config: &ClusterConfig, owned: &[ResourceName]) -> Result<(), OpError> {
        let inst = instance(config, &self.name)?;
        ensure_nodes_locked(owned, inst)?;
        online_node(config, &inst.primary_node)?;
        if !inst.admin_up {
            return Err(OpError::prereq(format!(
                "instance {} is not running",
                self.name
            )));
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let snapshot = ctx.snapshot();
        let inst = instance(&snapshot, &self.name)?;
        let target = json!({ "instance": inst.name });
        match self.reboot_type {
            RebootType::Soft | RebootType::Hard => {
                let kind = if self.reboot_type == RebootType::Soft {
                    "soft"
                } else {
                    "hard"
                };
                ctx.call(
                    &inst.primary_node,
                    "instance_reboot",
                    json!({ "instance": inst.name, "type": kind }),
                )
                .await?;
            }
            RebootType::Full => {
                ctx.call(&inst.primary_node, "instance_shutdown", target.clone())
                    .await?;
                ctx.feedback(format!("Instance {} stopped, starting again", inst.name));
                ctx.call(
                    &inst.primary_node,
                    "instance_start",
                    json!({ "instance": inst.name, "memory_mb": inst.memory_mb }),
                )
                .await?;
            }
        }
        Ok(Value::Null)
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        let inst = config.instances.get(&self.name)?;
        Some(instance_hooks("instance-reboot", config, inst))
    }
}

struct InstanceRemove {
    name: String,
    ignore_failures: bool,
}

#[async_trait]
impl LogicalUnit for InstanceRemove {
    fn check_prereq(&self, config: &ClusterConfig, owned: &[ResourceName]) -> Result<(), OpError> {
        let inst = instance(config, &self.name)?;
        ensure_nodes_locked(owned, inst)
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let snapshot = ctx.snapshot();
        let inst = instance(&snapshot, &self.name)?;
        let target = json!({ "instance": inst.name });

        if inst.admin_up {
            match ctx
                .call(&inst.primary_node, "instance_shutdown", target.clone())
                .await
            {
                Ok(_) => {}
                Err(e) if self.ignore_failures => {
                    ctx.feedback(format!("Ignoring shutdown failure: {}", e.message));
                }
                Err(e) => return Err(e),
            }
        }
        for (node, result) in ctx
            .call_many(&inst.nodes(), "blockdev_remove", target.clone())
            .await
        {
            match result {
                Ok(_) => {}
                Err(e) if self.ignore_failures => {
                    ctx.feedback(format!("Ignoring disk removal failure on {}: {}", node, e));
                }
                Err(e) => return Err(e.into()),
            }
        }
        ctx.config()
            .remove(ObjectKind::Instance, &inst.name, inst.serial)?;
        Ok(Value::Null)
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        let inst = config.instances.get(&self.name)?;
        Some(instance_hooks("instance-remove", config, inst))
    }
}

struct InstanceMigrate {
    name: String,
    target: String,
    live: bool,
}

#[async_trait]
impl LogicalUnit for InstanceMigrate {
    fn check_prereq(&self, config: &ClusterConfig, owned: &[ResourceName]) -> Result<(), OpError> {
        let inst = instance(config, &self.name)?;
        ensure_nodes_locked(owned, inst)?;
        ensure_locked(owned, ResourceName::node(self.target.clone()))?;
        if inst.primary_node == self.target {
            return Err(OpError::prereq(format!(
                "instance {} is already on node {}",
                self.name, self.target
            )));
        }
        online_node(config, &inst.primary_node)?;
        online_node(config, &self.target)?;
        if !inst.admin_up {
            return Err(OpError::prereq(format!(
                "instance {} is not running, cannot migrate",
                self.name
            )));
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let snapshot = ctx.snapshot();
        let inst = instance(&snapshot, &self.name)?.clone();
        let source = inst.primary_node.clone();
        let params = json!({
            "instance": inst.name,
            "source": source,
            "target": self.target,
            "live": self.live,
        });

        ctx.feedback(format!("Migrating {} from {} to {}", inst.name, source, self.target));
        ctx.call(&self.target, "migration_prepare", params.clone())
            .await?;
        if let Err(e) = ctx.call(&source, "migration_start", params.clone()).await {
            if let Err(abort) = ctx
                .call(&self.target, "migration_abort", params.clone())
                .await
            {
                ctx.feedback(format!("Aborting migration on {} failed: {}", self.target, abort));
            }
            return Err(e);
        }
        ctx.call(&self.target, "migration_finalize", params).await?;

        let serial = inst.serial;
        let mut moved = inst;
        if moved.secondary_node.as_deref() == Some(self.target.as_str()) {
            moved.secondary_node = Some(source.clone());
        }
        moved.primary_node = self.target.clone();
        ctx.config().update(ConfigObject::Instance(moved), serial)?;
        Ok(json!({ "source": source, "target": self.target }))
    }

    fn hooks(&self, config: &ClusterConfig) -> Option<HookSpec> {
        let inst = config.instances.get(&self.name)?;
        Some(
            instance_hooks("instance-migrate", config, inst)
                .with_env("MIGRATE_TARGET", self.target.clone())
                .with_env("MIGRATE_LIVE", self.live.to_string()),
        )
    }
}

struct InstanceQuery {
    names: Vec<String>,
}

#[async_trait]
impl LogicalUnit for InstanceQuery {
    fn check_prereq(&self, config: &ClusterConfig, _owned: &[ResourceName]) -> Result<(), OpError> {
        self.names
            .iter()
            .try_for_each(|name| instance(config, name).map(|_| ()))
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let config = ctx.snapshot();
        let rows: Vec<Value> = config
            .instances
            .values()
            .filter(|i| self.names.is_empty() || self.names.contains(&i.name))
            .map(|i| {
                json!({
                    "name": i.name,
                    "primary_node": i.primary_node,
                    "secondary_node": i.secondary_node,
                    "admin_up": i.admin_up,
                    "memory_mb": i.memory_mb,
                    "vcpus": i.vcpus,
                    "disks": i.disks,
                    "tags": i.tags,
                })
            })
            .collect();
        Ok(Value::Array(rows))
    }
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

struct Tags {
    kind: ObjectKind,
    name: String,
    tags: Vec<String>,
    add: bool,
}

#[async_trait]
impl LogicalUnit for Tags {
    fn check_prereq(&self, config: &ClusterConfig, _owned: &[ResourceName]) -> Result<(), OpError> {
        let current = config
            .tags(self.kind, &self.name)
            .ok_or_else(|| OpError::prereq(format!("{} {} does not exist", self.kind, self.name)))?;
        if !self.add {
            let missing: Vec<&str> = self
                .tags
                .iter()
                .filter(|t| !current.contains(t.as_str()))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(OpError::prereq(format!(
                    "tags not present: {}",
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let mut object = ctx
            .snapshot()
            .object(self.kind, &self.name)
            .ok_or_else(|| OpError::exec(format!("{} {} vanished", self.kind, self.name)))?;
        let serial = object.serial();
        let tags = object.tags_mut();
        for tag in &self.tags {
            if self.add {
                tags.insert(tag.clone());
            } else {
                tags.remove(tag);
            }
        }
        let result = json!(tags);
        ctx.config().update(object, serial)?;
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Test opcodes
// ---------------------------------------------------------------------------

struct TestDelay {
    duration: f64,
    on_master: bool,
    on_nodes: Vec<String>,
    repeat: u32,
}

#[async_trait]
impl LogicalUnit for TestDelay {
    fn check_prereq(&self, config: &ClusterConfig, _owned: &[ResourceName]) -> Result<(), OpError> {
        self.on_nodes
            .iter()
            .try_for_each(|n| online_node(config, n).map(|_| ()))
    }

    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        let delay = Duration::try_from_secs_f64(self.duration)
            .map_err(|e| OpError::prereq(format!("invalid delay duration {}: {}", self.duration, e)))?;
        let rounds = self.repeat.max(1);
        for round in 0..rounds {
            if self.repeat > 0 {
                ctx.feedback(format!("Test delay iteration {}/{}", round, self.repeat));
            }
            if self.on_master {
                tokio::time::sleep(delay).await;
            }
            if !self.on_nodes.is_empty() {
                let timeout = delay.saturating_add(Duration::from_secs(5));
                for node in &self.on_nodes {
                    ctx.call_with_timeout(
                        node,
                        "test_delay",
                        json!({ "duration": self.duration }),
                        timeout,
                    )
                    .await?;
                }
            }
        }
        Ok(Value::Null)
    }
}

struct TestJqueue {
    log_messages: Vec<String>,
    fail: bool,
}

#[async_trait]
impl LogicalUnit for TestJqueue {
    async fn exec(&self, ctx: &ExecContext<'_>) -> Result<Value, OpError> {
        for message in &self.log_messages {
            ctx.log(LogKind::JqueueTest, message.clone());
        }
        if self.fail {
            return Err(OpError::exec("Opcode failure was requested"));
        }
        Ok(Value::Bool(true))
    }
}
