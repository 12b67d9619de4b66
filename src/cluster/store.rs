use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use super::{ClusterConfig, ConfigError, ConfigObject, ConfigStore, ObjectKind};
use crate::storage::write_atomic;

/// Configuration store kept in memory, optionally mirrored to a JSON file.
///
/// Every change is written to the file (temp file, fsync, rename) before it
/// becomes visible to readers.
pub struct JsonConfigStore {
    path: Option<PathBuf>,
    current: Mutex<Arc<ClusterConfig>>,
    changes: watch::Sender<u64>,
}

impl JsonConfigStore {
    pub fn in_memory(config: ClusterConfig) -> Self {
        let (changes, _) = watch::channel(config.serial);
        Self {
            path: None,
            current: Mutex::new(Arc::new(config)),
            changes,
        }
    }

    /// Load the configuration from `path`, writing `initial` there if the
    /// file does not exist yet.
    pub fn open(
        path: impl AsRef<Path>,
        initial: impl FnOnce() -> ClusterConfig,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = initial();
                write_atomic(&path, &serde_json::to_vec_pretty(&config)?)?;
                tracing::info!(path = %path.display(), "Initialized cluster configuration");
                config
            }
            Err(e) => return Err(e.into()),
        };
        let (changes, _) = watch::channel(config.serial);
        Ok(Self {
            path: Some(path),
            current: Mutex::new(Arc::new(config)),
            changes,
        })
    }

    fn lock_current(&self) -> MutexGuard<'_, Arc<ClusterConfig>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit<T>(
        &self,
        change: impl FnOnce(&mut ClusterConfig) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        let mut current = self.lock_current();
        let mut next = (**current).clone();
        let out = change(&mut next)?;
        next.serial += 1;
        if let Some(path) = &self.path {
            write_atomic(path, &serde_json::to_vec_pretty(&next)?)?;
        }
        let serial = next.serial;
        *current = Arc::new(next);
        drop(current);
        self.changes.send_replace(serial);
        Ok(out)
    }
}

fn check_serial(
    config: &ClusterConfig,
    kind: ObjectKind,
    name: &str,
    expected: u64,
) -> Result<u64, ConfigError> {
    let actual = config
        .object_serial(kind, name)
        .ok_or_else(|| ConfigError::NotFound {
            kind,
            name: name.to_string(),
        })?;
    if actual != expected {
        return Err(ConfigError::Conflict {
            kind,
            name: name.to_string(),
            expected,
            actual,
        });
    }
    Ok(actual)
}

fn insert(config: &mut ClusterConfig, object: ConfigObject) {
    match object {
        ConfigObject::Cluster(c) => config.cluster = c,
        ConfigObject::NodeGroup(g) => {
            config.node_groups.insert(g.name.clone(), g);
        }
        ConfigObject::Node(n) => {
            config.nodes.insert(n.name.clone(), n);
        }
        ConfigObject::Instance(i) => {
            config.instances.insert(i.name.clone(), i);
        }
    }
}

impl ConfigStore for JsonConfigStore {
    fn snapshot(&self) -> Arc<ClusterConfig> {
        self.lock_current().clone()
    }

    fn update(&self, mut object: ConfigObject, expected_serial: u64) -> Result<u64, ConfigError> {
        self.commit(|config| {
            let actual = check_serial(config, object.kind(), object.name(), expected_serial)?;
            let serial = actual + 1;
            object.set_serial(serial);
            insert(config, object);
            Ok(serial)
        })
    }

    fn add(&self, mut object: ConfigObject) -> Result<u64, ConfigError> {
        if object.kind() == ObjectKind::Cluster {
            return Err(ConfigError::ClusterObject);
        }
        self.commit(|config| {
            if config.object_serial(object.kind(), object.name()).is_some() {
                return Err(ConfigError::AlreadyExists {
                    kind: object.kind(),
                    name: object.name().to_string(),
                });
            }
            object.set_serial(1);
            insert(config, object);
            Ok(1)
        })
    }

    fn remove(&self, kind: ObjectKind, name: &str, expected_serial: u64) -> Result<(), ConfigError> {
        self.commit(|config| {
            check_serial(config, kind, name, expected_serial)?;
            match kind {
                ObjectKind::Cluster => return Err(ConfigError::ClusterObject),
                ObjectKind::NodeGroup => {
                    config.node_groups.remove(name);
                }
                ObjectKind::Node => {
                    config.nodes.remove(name);
                }
                ObjectKind::Instance => {
                    config.instances.remove(name);
                }
            }
            Ok(())
        })
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
