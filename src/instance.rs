//! Server instance definitions and their JSON store.
//!
//! An [`Instance`] describes how to launch one server; it is distinct from a
//! running process. The supervisor only reads instances.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// A configured, launchable server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier, e.g. `server-1`.
    pub id: String,
    /// Display name used to prefix output lines.
    pub name: String,
    #[serde(default)]
    pub server_type: String,
    #[serde(default)]
    pub mc_version: String,
    #[serde(default)]
    pub core_version: String,
    /// Path to the server jar. Its parent is the working directory.
    pub path: PathBuf,
    /// Runtime for this instance; empty means the global default.
    #[serde(default)]
    pub java_path: String,
    /// Heap size in MB, used for both `-Xms` and `-Xmx`.
    pub memory: u32,
    /// Extra arguments appended after `nogui`, space separated.
    #[serde(default)]
    pub jvm_args: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Instance {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<PathBuf>, memory: u32) -> Self {
        let now = now_rfc3339();
        Self {
            id: id.into(),
            name: name.into(),
            server_type: String::new(),
            mc_version: String::new(),
            core_version: String::new(),
            path: path.into(),
            java_path: String::new(),
            memory,
            jvm_args: String::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Directory the server runs in: the jar's parent, or `.` for a bare file name.
    pub fn working_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Marks the instance as modified now.
    pub fn touch(&mut self) {
        self.updated_at = now_rfc3339();
    }
}

/// Instances keyed by id, optionally persisted to a JSON file.
#[derive(Debug, Default)]
pub struct InstanceStore {
    path: Option<PathBuf>,
    instances: BTreeMap<String, Instance>,
}

impl InstanceStore {
    /// Loads the store from `path`; a missing file is an empty store.
    pub fn open(path: &Path) -> Result<Self> {
        let instances = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read instances file {}", path.display()))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw).with_context(|| {
                    format!("failed to parse instances file {}", path.display())
                })?
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            instances,
        })
    }

    /// A store that is never written to disk.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    /// Inserts or replaces an instance and persists the store.
    pub fn put(&mut self, instance: Instance) -> Result<()> {
        self.instances.insert(instance.id.clone(), instance);
        self.save()
    }

    /// Removes an instance and persists the store.
    pub fn delete(&mut self, id: &str) -> Result<Option<Instance>> {
        let removed = self.instances.remove(id);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    /// All instances ordered by id.
    pub fn list_all(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// The lowest free `server-N` id.
    pub fn next_id(&self) -> String {
        (1..)
            .map(|n| format!("server-{}", n))
            .find(|id| !self.instances.contains_key(id))
            .unwrap_or_else(|| "server-0".to_string())
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(&self.instances)
            .context("failed to serialize instances")?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write instances file {}", path.display()))
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TempDir;

    #[test]
    fn working_dir_is_parent_of_jar() {
        let instance = Instance::new("server-1", "lobby", "/srv/lobby/paper.jar", 1024);
        assert_eq!(instance.working_dir(), PathBuf::from("/srv/lobby"));
        let bare = Instance::new("server-2", "bare", "paper.jar", 1024);
        assert_eq!(bare.working_dir(), PathBuf::from("."));
    }

    #[test]
    fn next_id_fills_gaps() {
        let mut store = InstanceStore::in_memory();
        assert_eq!(store.next_id(), "server-1");
        store.put(Instance::new("server-1", "a", "a.jar", 512)).unwrap();
        store.put(Instance::new("server-3", "c", "c.jar", 512)).unwrap();
        assert_eq!(store.next_id(), "server-2");
    }

    #[test]
    fn persists_put_and_delete() {
        let dir = TempDir::new("instances");
        let path = dir.join("data/servers.json");
        let mut store = InstanceStore::open(&path).unwrap();
        assert!(store.is_empty());

        let mut instance = Instance::new("server-1", "lobby", "/srv/lobby/paper.jar", 2048);
        instance.jvm_args = "--port 25566".into();
        store.put(instance.clone()).unwrap();
        store.put(Instance::new("server-2", "survival", "/srv/s/paper.jar", 4096)).unwrap();

        let reopened = InstanceStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("server-1"), Some(&instance));
        let ids: Vec<&str> = reopened.list_all().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["server-1", "server-2"]);

        let mut store = reopened;
        assert!(store.delete("server-1").unwrap().is_some());
        assert!(store.delete("server-1").unwrap().is_none());
        assert_eq!(InstanceStore::open(&path).unwrap().len(), 1);
    }

    #[test]
    fn missing_optional_fields_default() {
        let raw = r#"{"server-1": {"id": "server-1", "name": "lobby", "path": "/srv/paper.jar", "memory": 1024}}"#;
        let instances: BTreeMap<String, Instance> = serde_json::from_str(raw).unwrap();
        let instance = &instances["server-1"];
        assert_eq!(instance.java_path, "");
        assert_eq!(instance.jvm_args, "");
    }
}
