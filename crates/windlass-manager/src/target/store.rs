//! Persisted target store.
//!
//! One record per target id: the target's properties plus its association,
//! usage and hint records, written as flat key/value property sets. The
//! encoding (TOML here) is treated as opaque by everything above the store
//! trait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use windlass_model::AgentContext;

use crate::error::{ManagerError, ManagerResult};

use super::{AssociationKey, TargetProperties};

/// Everything persisted about one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRecord {
    /// The target definition.
    pub properties: TargetProperties,
    /// Association records (configured mappings).
    #[serde(default)]
    pub associations: Vec<AssociationKey>,
    /// Usage records (agent contexts currently holding the target).
    #[serde(default)]
    pub usage: Vec<AgentContext>,
    /// Hint records: applications the target is scoped to for selection.
    #[serde(default)]
    pub hints: Vec<String>,
}

impl TargetRecord {
    /// A record with no associations, usage or hints.
    #[must_use]
    pub fn new(properties: TargetProperties) -> Self {
        Self {
            properties,
            associations: Vec::new(),
            usage: Vec::new(),
            hints: Vec::new(),
        }
    }
}

/// Backend persisting target records.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Write (or overwrite) the record for a target id.
    async fn save(&self, record: &TargetRecord) -> ManagerResult<()>;

    /// Load every persisted record.
    async fn load_all(&self) -> ManagerResult<Vec<TargetRecord>>;

    /// Delete the record for a target id.
    async fn delete(&self, target_id: &str) -> ManagerResult<()>;
}

/// In-memory target store for testing.
#[derive(Debug, Default)]
pub struct MemoryTargetStore {
    records: RwLock<HashMap<String, TargetRecord>>,
}

impl MemoryTargetStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn save(&self, record: &TargetRecord) -> ManagerResult<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| ManagerError::internal("lock poisoned"))?;
        records.insert(record.properties.id.clone(), record.clone());
        Ok(())
    }

    async fn load_all(&self) -> ManagerResult<Vec<TargetRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| ManagerError::internal("lock poisoned"))?;
        Ok(records.values().cloned().collect())
    }

    async fn delete(&self, target_id: &str) -> ManagerResult<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| ManagerError::internal("lock poisoned"))?;
        records.remove(target_id);
        Ok(())
    }
}

/// File-backed target store: one directory per target id under a root
/// directory, each holding `properties.toml`, `associations.toml`,
/// `usage.toml` and `hints.toml`.
#[derive(Debug)]
pub struct FileTargetStore {
    root: PathBuf,
}

/// Wrapper types so each file is a well-formed TOML document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct AssociationsFile {
    #[serde(default)]
    associations: Vec<AssociationKey>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsageFile {
    #[serde(default)]
    usage: Vec<AgentContext>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HintsFile {
    #[serde(default)]
    hints: Vec<String>,
}

impl FileTargetStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_dir(&self, target_id: &str) -> PathBuf {
        self.root.join(target_id)
    }

    async fn write_toml<T: Serialize>(path: &Path, value: &T) -> ManagerResult<()> {
        let text = toml::to_string_pretty(value)
            .map_err(|e| ManagerError::store(format!("encode {}: {e}", path.display())))?;
        tokio::fs::write(path, text)
            .await
            .map_err(|e| ManagerError::store(format!("write {}: {e}", path.display())))
    }

    async fn read_toml<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> ManagerResult<T> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| ManagerError::store(format!("parse {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(ManagerError::store(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn read_record(&self, dir: &Path) -> ManagerResult<Option<TargetRecord>> {
        let properties_path = dir.join("properties.toml");
        let properties: TargetProperties = match tokio::fs::read_to_string(&properties_path).await {
            Ok(text) => toml::from_str(&text).map_err(|e| {
                ManagerError::store(format!("parse {}: {e}", properties_path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ManagerError::store(format!(
                    "read {}: {e}",
                    properties_path.display()
                )))
            }
        };

        let associations: AssociationsFile = Self::read_toml(&dir.join("associations.toml")).await?;
        let usage: UsageFile = Self::read_toml(&dir.join("usage.toml")).await?;
        let hints: HintsFile = Self::read_toml(&dir.join("hints.toml")).await?;

        Ok(Some(TargetRecord {
            properties,
            associations: associations.associations,
            usage: usage.usage,
            hints: hints.hints,
        }))
    }
}

#[async_trait]
impl TargetStore for FileTargetStore {
    async fn save(&self, record: &TargetRecord) -> ManagerResult<()> {
        let dir = self.record_dir(&record.properties.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ManagerError::store(format!("create {}: {e}", dir.display())))?;

        Self::write_toml(&dir.join("properties.toml"), &record.properties).await?;
        Self::write_toml(
            &dir.join("associations.toml"),
            &AssociationsFile {
                associations: record.associations.clone(),
            },
        )
        .await?;
        Self::write_toml(
            &dir.join("usage.toml"),
            &UsageFile {
                usage: record.usage.clone(),
            },
        )
        .await?;
        Self::write_toml(
            &dir.join("hints.toml"),
            &HintsFile {
                hints: record.hints.clone(),
            },
        )
        .await?;

        Ok(())
    }

    async fn load_all(&self) -> ManagerResult<Vec<TargetRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ManagerError::store(format!(
                    "read {}: {e}",
                    self.root.display()
                )))
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ManagerError::store(e.to_string()))?
        {
            let path = entry.path();
            if path.is_dir() {
                if let Some(record) = self.read_record(&path).await? {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    async fn delete(&self, target_id: &str) -> ManagerResult<()> {
        let dir = self.record_dir(target_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ManagerError::store(format!(
                "delete {}: {e}",
                dir.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::AssociationScope;
    use windlass_model::InstancePath;

    fn sample_record() -> TargetRecord {
        let mut record = TargetRecord::new(
            TargetProperties::new("ec2-eu", "mock", "EU cloud")
                .with_property("region", "eu-west-1"),
        );
        record.associations.push(AssociationKey::new(
            "demo",
            AssociationScope::ApplicationDefault,
        ));
        record.usage.push(AgentContext::new(
            "demo",
            InstancePath::root("vm1"),
        ));
        record.hints.push("demo".to_owned());
        record
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryTargetStore::new();
        let record = sample_record();

        store.save(&record).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].properties.id, "ec2-eu");

        store.delete("ec2-eu").await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTargetStore::new(dir.path());
        let record = sample_record();

        store.save(&record).await.unwrap();

        // The record is a directory of flat key/value files.
        assert!(dir.path().join("ec2-eu/properties.toml").is_file());
        assert!(dir.path().join("ec2-eu/usage.toml").is_file());

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].properties.properties["region"], "eu-west-1");
        assert_eq!(loaded[0].associations, record.associations);
        assert_eq!(loaded[0].usage, record.usage);
        assert_eq!(loaded[0].hints, record.hints);

        store.delete("ec2-eu").await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_rejects_malformed_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTargetStore::new(dir.path());
        store.save(&sample_record()).await.unwrap();

        // A hand-edited usage record with a path missing its leading slash
        // must not make it past loading.
        tokio::fs::write(
            dir.path().join("ec2-eu/usage.toml"),
            "[[usage]]\napplication = \"demo\"\nscoped_path = \"vm1\"\n",
        )
        .await
        .unwrap();

        let err = store.load_all().await.unwrap_err();
        assert!(matches!(err, ManagerError::Store(_)));
    }

    #[tokio::test]
    async fn file_store_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTargetStore::new(dir.path().join("does-not-exist-yet"));
        assert!(store.load_all().await.unwrap().is_empty());
        // Deleting a missing record is not an error.
        store.delete("nope").await.unwrap();
    }
}
