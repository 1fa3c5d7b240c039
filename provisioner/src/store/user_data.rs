//! Named user-data (cloud-init) blobs, referenced from options by id.

use super::{write_atomically, StoreError};
use async_trait::async_trait;
use cumulus_rs::util::to_unix_eols;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait UserDataStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<String>, StoreError>;
    /// Store `content` (with LF line endings) under `id`, replacing any previous entry.
    async fn put(&self, id: &str, content: &str) -> Result<(), StoreError>;
    /// Returns whether there was an entry to remove.
    async fn remove(&self, id: &str) -> Result<bool, StoreError>;
    /// All ids, sorted.
    async fn ids(&self) -> Result<Vec<String>, StoreError>;
}

/// Ids become file names, so they must not be able to address anything outside the store.
fn check_id(id: &str) -> Result<(), StoreError> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.ends_with(".tmp")
        || id.contains(['/', '\\', '\0']);
    if bad {
        Err(StoreError::InvalidId(id.to_string()))
    } else {
        Ok(())
    }
}

/// One file per entry, named by id.
#[derive(Debug, Clone)]
pub struct DirUserDataStore {
    dir: PathBuf,
}

impl DirUserDataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        check_id(id)?;
        Ok(self.dir.join(id))
    }
}

#[async_trait]
impl UserDataStore for DirUserDataStore {
    async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
        let path = self.entry_path(id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn put(&self, id: &str, content: &str) -> Result<(), StoreError> {
        let path = self.entry_path(id)?;
        write_atomically(&path, to_unix_eols(content).as_bytes()).await?;
        tracing::debug!("Stored user data '{id}'");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.entry_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn ids(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };
        let mut ids = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if check_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserDataStore {
    entries: DashMap<String, String>,
}

impl MemoryUserDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserDataStore for MemoryUserDataStore {
    async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(id).map(|e| e.value().clone()))
    }

    async fn put(&self, id: &str, content: &str) -> Result<(), StoreError> {
        check_id(id)?;
        self.entries.insert(id.to_string(), to_unix_eols(content));
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(id).is_some())
    }

    async fn ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn dir_store_normalizes_line_endings() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirUserDataStore::new(dir.path().join("user-data"));

        store.put("boot", "#!/bin/sh\r\necho hi\r\n").await.unwrap();
        assert_eq!(
            store.get("boot").await.unwrap().as_deref(),
            Some("#!/bin/sh\necho hi\n")
        );
        assert_eq!(store.ids().await.unwrap(), vec!["boot".to_string()]);
        assert!(store.remove("boot").await.unwrap());
        assert!(!store.remove("boot").await.unwrap());
        assert_eq!(store.get("boot").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirUserDataStore::new(dir.path().join("absent"));
        assert!(store.ids().await.unwrap().is_empty());
        assert_eq!(store.get("anything").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ids_cannot_escape_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirUserDataStore::new(dir.path());
        for id in ["", ".", "..", "../etc/passwd", "a/b", "x.tmp"] {
            assert!(
                matches!(store.put(id, "x").await, Err(StoreError::InvalidId(_))),
                "{id:?} was accepted"
            );
        }
    }

    #[tokio::test]
    async fn memory_store() {
        let store = MemoryUserDataStore::new();
        store.put("b", "two\r\n").await.unwrap();
        store.put("a", "one").await.unwrap();
        assert_eq!(store.ids().await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("two\n"));
    }
}
