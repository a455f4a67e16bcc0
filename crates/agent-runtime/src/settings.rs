//! Persisted per-tool permission memory.
//!
//! The permission gate only needs four async operations, expressed by
//! [`SettingsStore`]. Two stores ship here: an in-memory one for tests and
//! embedding, and a JSON-file one that survives restarts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Allow/deny memory. The two lists are kept disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRecord {
    #[serde(default)]
    pub allow_list: BTreeSet<String>,
    #[serde(default)]
    pub deny_list: BTreeSet<String>,
}

impl PermissionRecord {
    pub fn allow(&mut self, tool: &str) {
        self.deny_list.remove(tool);
        self.allow_list.insert(tool.to_string());
    }

    pub fn deny(&mut self, tool: &str) {
        self.allow_list.remove(tool);
        self.deny_list.insert(tool.to_string());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Backend for persisted tool permissions.
///
/// Implementations shared between concurrent runs must serialise their own
/// read-modify-write cycles.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn is_allowed(&self, tool: &str) -> Result<bool, SettingsError>;
    async fn is_denied(&self, tool: &str) -> Result<bool, SettingsError>;
    async fn add_allowed(&self, tool: &str) -> Result<(), SettingsError>;
    async fn add_denied(&self, tool: &str) -> Result<(), SettingsError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    record: RwLock<PermissionRecord>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: PermissionRecord) -> Self {
        Self {
            record: RwLock::new(record),
        }
    }

    pub async fn snapshot(&self) -> PermissionRecord {
        self.record.read().await.clone()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn is_allowed(&self, tool: &str) -> Result<bool, SettingsError> {
        Ok(self.record.read().await.allow_list.contains(tool))
    }

    async fn is_denied(&self, tool: &str) -> Result<bool, SettingsError> {
        Ok(self.record.read().await.deny_list.contains(tool))
    }

    async fn add_allowed(&self, tool: &str) -> Result<(), SettingsError> {
        self.record.write().await.allow(tool);
        Ok(())
    }

    async fn add_denied(&self, tool: &str) -> Result<(), SettingsError> {
        self.record.write().await.deny(tool);
        Ok(())
    }
}

/// JSON-file store. The file is created on first write; a missing file reads
/// as an empty record.
///
/// Every store opened on the same path within one process shares a write
/// lock, so their read-modify-write cycles never interleave. Paths are
/// compared as given. Writers in other processes are not coordinated.
pub struct FileSettingsStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

/// The write lock for `path`, shared process-wide.
fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    locks.entry(path.to_path_buf()).or_default().clone()
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let write_lock = path_lock(&path);
        Self { path, write_lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<PermissionRecord, SettingsError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(PermissionRecord::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PermissionRecord::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, apply: impl FnOnce(&mut PermissionRecord)) -> Result<(), SettingsError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load().await?;
        apply(&mut record);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Write to a sibling then rename, so readers never see a torn file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&record)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "permission record saved");
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn is_allowed(&self, tool: &str) -> Result<bool, SettingsError> {
        Ok(self.load().await?.allow_list.contains(tool))
    }

    async fn is_denied(&self, tool: &str) -> Result<bool, SettingsError> {
        Ok(self.load().await?.deny_list.contains(tool))
    }

    async fn add_allowed(&self, tool: &str) -> Result<(), SettingsError> {
        self.update(|record| record.allow(tool)).await
    }

    async fn add_denied(&self, tool: &str) -> Result<(), SettingsError> {
        self.update(|record| record.deny(tool)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_lists_stay_disjoint() {
        let store = MemorySettingsStore::new();
        store.add_denied("bash").await.unwrap();
        assert!(store.is_denied("bash").await.unwrap());

        store.add_allowed("bash").await.unwrap();
        assert!(store.is_allowed("bash").await.unwrap());
        assert!(!store.is_denied("bash").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::new(dir.path().join("settings.json"));
        assert!(!store.is_allowed("echo").await.unwrap());
        assert!(!store.is_denied("echo").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let store = FileSettingsStore::new(&path);
        store.add_allowed("file_read").await.unwrap();
        store.add_denied("bash").await.unwrap();

        let reopened = FileSettingsStore::new(&path);
        assert!(reopened.is_allowed("file_read").await.unwrap());
        assert!(reopened.is_denied("bash").await.unwrap());
        assert!(!reopened.is_allowed("bash").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_serialises_concurrent_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSettingsStore::new(dir.path().join("settings.json")));

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.add_allowed(&format!("tool_{i}")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = store.load().await.unwrap();
        assert_eq!(record.allow_list.len(), 16);
    }

    #[tokio::test]
    async fn test_stores_on_one_path_share_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let first = Arc::new(FileSettingsStore::new(&path));
        let second = Arc::new(FileSettingsStore::new(&path));

        let mut handles = Vec::new();
        for i in 0..12 {
            let store = if i % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move {
                store.add_allowed(&format!("tool_{i}")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = FileSettingsStore::new(&path).load().await.unwrap();
        assert_eq!(record.allow_list.len(), 12);
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let store = FileSettingsStore::new(&path);
        assert!(matches!(
            store.is_allowed("x").await,
            Err(SettingsError::Json(_))
        ));
    }
}
