//! Cluster configuration: the objects opcodes read and modify.
//!
//! Every object carries a serial number. Writers pass the serial they read
//! and the store refuses the write when the object changed in between.

pub mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

pub use store::JsonConfigStore;

/// Group new nodes join when none is given.
pub const DEFAULT_NODE_GROUP: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Cluster,
    #[serde(rename = "nodegroup")]
    NodeGroup,
    Node,
    Instance,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Cluster => write!(f, "cluster"),
            ObjectKind::NodeGroup => write!(f, "nodegroup"),
            ObjectKind::Node => write!(f, "node"),
            ObjectKind::Instance => write!(f, "instance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    pub master_node: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub hvparams: BTreeMap<String, String>,
    #[serde(default)]
    pub serial: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub primary_ip: Option<String>,
    pub group: String,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub drained: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub serial: u64,
}

impl Node {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_ip: None,
            group: group.into(),
            offline: false,
            drained: false,
            tags: BTreeSet::new(),
            serial: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub serial: u64,
}

impl NodeGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeSet::new(),
            serial: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub primary_node: String,
    #[serde(default)]
    pub secondary_node: Option<String>,
    pub memory_mb: u64,
    pub vcpus: u32,
    #[serde(default)]
    pub disks: Vec<u64>,
    #[serde(default)]
    pub admin_up: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub serial: u64,
}

impl Instance {
    /// Primary node first, then the secondary if any.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes = vec![self.primary_node.clone()];
        if let Some(secondary) = &self.secondary_node {
            if secondary != &self.primary_node {
                nodes.push(secondary.clone());
            }
        }
        nodes
    }
}

/// A consistent view of the whole cluster configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Bumped on every change to any object.
    #[serde(default)]
    pub serial: u64,
    pub cluster: ClusterInfo,
    #[serde(default)]
    pub node_groups: BTreeMap<String, NodeGroup>,
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
}

impl ClusterConfig {
    /// A cluster with its master node in the default group.
    pub fn new(name: impl Into<String>, master_node: impl Into<String>) -> Self {
        let master_node = master_node.into();
        let mut config = Self {
            serial: 1,
            cluster: ClusterInfo {
                name: name.into(),
                master_node: master_node.clone(),
                tags: BTreeSet::new(),
                hvparams: BTreeMap::new(),
                serial: 1,
            },
            node_groups: BTreeMap::new(),
            nodes: BTreeMap::new(),
            instances: BTreeMap::new(),
        };
        let mut group = NodeGroup::new(DEFAULT_NODE_GROUP);
        group.serial = 1;
        config.node_groups.insert(group.name.clone(), group);
        let mut master = Node::new(master_node, DEFAULT_NODE_GROUP);
        master.serial = 1;
        config.nodes.insert(master.name.clone(), master);
        config
    }

    pub fn instances_on_node(&self, node: &str) -> Vec<&Instance> {
        self.instances
            .values()
            .filter(|inst| inst.nodes().iter().any(|n| n == node))
            .collect()
    }

    pub fn nodes_in_group(&self, group: &str) -> Vec<&Node> {
        self.nodes.values().filter(|n| n.group == group).collect()
    }

    /// Current serial of an object, `None` if it does not exist.
    pub fn object_serial(&self, kind: ObjectKind, name: &str) -> Option<u64> {
        match kind {
            ObjectKind::Cluster => Some(self.cluster.serial),
            ObjectKind::NodeGroup => self.node_groups.get(name).map(|g| g.serial),
            ObjectKind::Node => self.nodes.get(name).map(|n| n.serial),
            ObjectKind::Instance => self.instances.get(name).map(|i| i.serial),
        }
    }

    pub fn tags(&self, kind: ObjectKind, name: &str) -> Option<&BTreeSet<String>> {
        match kind {
            ObjectKind::Cluster => Some(&self.cluster.tags),
            ObjectKind::NodeGroup => self.node_groups.get(name).map(|g| &g.tags),
            ObjectKind::Node => self.nodes.get(name).map(|n| &n.tags),
            ObjectKind::Instance => self.instances.get(name).map(|i| &i.tags),
        }
    }

    /// Owned copy of an object, for read-modify-write updates.
    pub fn object(&self, kind: ObjectKind, name: &str) -> Option<ConfigObject> {
        match kind {
            ObjectKind::Cluster => Some(ConfigObject::Cluster(self.cluster.clone())),
            ObjectKind::NodeGroup => self.node_groups.get(name).cloned().map(ConfigObject::NodeGroup),
            ObjectKind::Node => self.nodes.get(name).cloned().map(ConfigObject::Node),
            ObjectKind::Instance => self.instances.get(name).cloned().map(ConfigObject::Instance),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConfigObject {
    Cluster(ClusterInfo),
    #[serde(rename = "nodegroup")]
    NodeGroup(NodeGroup),
    Node(Node),
    Instance(Instance),
}

impl ConfigObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ConfigObject::Cluster(_) => ObjectKind::Cluster,
            ConfigObject::NodeGroup(_) => ObjectKind::NodeGroup,
            ConfigObject::Node(_) => ObjectKind::Node,
            ConfigObject::Instance(_) => ObjectKind::Instance,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ConfigObject::Cluster(c) => &c.name,
            ConfigObject::NodeGroup(g) => &g.name,
            ConfigObject::Node(n) => &n.name,
            ConfigObject::Instance(i) => &i.name,
        }
    }

    pub fn serial(&self) -> u64 {
        match self {
            ConfigObject::Cluster(c) => c.serial,
            ConfigObject::NodeGroup(g) => g.serial,
            ConfigObject::Node(n) => n.serial,
            ConfigObject::Instance(i) => i.serial,
        }
    }

    pub fn tags_mut(&mut self) -> &mut BTreeSet<String> {
        match self {
            ConfigObject::Cluster(c) => &mut c.tags,
            ConfigObject::NodeGroup(g) => &mut g.tags,
            ConfigObject::Node(n) => &mut n.tags,
            ConfigObject::Instance(i) => &mut i.tags,
        }
    }

    fn set_serial(&mut self, serial: u64) {
        match self {
            ConfigObject::Cluster(c) => c.serial = serial,
            ConfigObject::NodeGroup(g) => g.serial = serial,
            ConfigObject::Node(n) => n.serial = serial,
            ConfigObject::Instance(i) => i.serial = serial,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{kind} {name} was modified concurrently (expected serial {expected}, found {actual})")]
    Conflict {
        kind: ObjectKind,
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("{kind} {name} does not exist")]
    NotFound { kind: ObjectKind, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: ObjectKind, name: String },

    #[error("the cluster object cannot be added or removed")]
    ClusterObject,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Access to the cluster configuration.
///
/// Reads return an immutable snapshot. Writes are compare-and-swap on the
/// object's serial and bump both the object and the configuration serial.
pub trait ConfigStore: Send + Sync {
    fn snapshot(&self) -> Arc<ClusterConfig>;

    /// Replace an existing object. Returns its new serial.
    fn update(&self, object: ConfigObject, expected_serial: u64) -> Result<u64, ConfigError>;

    /// Insert a new object. Returns its serial.
    fn add(&self, object: ConfigObject) -> Result<u64, ConfigError>;

    fn remove(&self, kind: ObjectKind, name: &str, expected_serial: u64) -> Result<(), ConfigError>;

    /// Receives the configuration serial after every change.
    fn subscribe(&self) -> watch::Receiver<u64>;
}
