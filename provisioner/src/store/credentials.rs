//! SSH credentials records, referenced from launchers by id.

use super::{write_private, StoreError};
use async_trait::async_trait;
use cumulus_rs::util::to_unix_eols;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshCredential {
    pub id: String,
    pub username: String,
    pub private_key: String,
}
impl Debug for SshCredential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCredential")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait CredentialsStore: Send + Sync {
    /// Record a new username/private key pair and return its id.
    async fn add_ssh_private_key(
        &self,
        username: &str,
        private_key: &str,
    ) -> Result<String, StoreError>;

    async fn lookup(&self, id: &str) -> Result<Option<SshCredential>, StoreError>;
}

fn new_credential(username: &str, private_key: &str) -> SshCredential {
    SshCredential {
        id: Uuid::new_v4().to_string(),
        username: username.to_string(),
        private_key: to_unix_eols(private_key),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    credentials: Vec<SshCredential>,
}

/// All records in one JSON file.
#[derive(Debug)]
pub struct FileCredentialsStore {
    path: PathBuf,
    // Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl FileCredentialsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<CredentialsFile, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CredentialsFile::default()),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }
}

#[async_trait]
impl CredentialsStore for FileCredentialsStore {
    async fn add_ssh_private_key(
        &self,
        username: &str,
        private_key: &str,
    ) -> Result<String, StoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        let credential = new_credential(username, private_key);
        let id = credential.id.clone();
        file.credentials.push(credential);

        let mut text = serde_json::to_string_pretty(&file)?;
        text.push('\n');
        write_private(&self.path, text.as_bytes()).await?;
        tracing::info!("Added SSH credentials {id} for user '{username}'");
        Ok(id)
    }

    async fn lookup(&self, id: &str) -> Result<Option<SshCredential>, StoreError> {
        let file = self.read().await?;
        Ok(file.credentials.into_iter().find(|c| c.id == id))
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialsStore {
    records: DashMap<String, SshCredential>,
}

impl MemoryCredentialsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CredentialsStore for MemoryCredentialsStore {
    async fn add_ssh_private_key(
        &self,
        username: &str,
        private_key: &str,
    ) -> Result<String, StoreError> {
        let credential = new_credential(username, private_key);
        let id = credential.id.clone();
        self.records.insert(id.clone(), credential);
        Ok(id)
    }

    async fn lookup(&self, id: &str) -> Result<Option<SshCredential>, StoreError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }
}
