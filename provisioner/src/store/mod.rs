//! Persistence of the cloud configuration and its collaborators.

use cumulus_rs::cloud::{Configuration, ModelError};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

pub mod credentials;
pub mod document;
pub mod legacy;
pub mod user_data;

use document::{Document, CURRENT_VERSION};
use legacy::{LegacyDocument, MigrationContext};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported document version {0}")]
    UnsupportedVersion(u64),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ModelError),
    #[error("invalid identifier '{0}'")]
    InvalidId(String),
}
impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write `bytes` to a sibling temporary file, then rename it over `path`.
pub(crate) async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    write_through_tmp(path, bytes, None).await
}

/// Like [`write_atomically`], but on Unix the file is readable and writable by its owner only.
pub(crate) async fn write_private(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    write_through_tmp(path, bytes, Some(0o600)).await
}

async fn write_through_tmp(
    path: &Path,
    bytes: &[u8],
    mode: Option<u32>,
) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    // A leftover temporary file would keep its old permissions.
    match tokio::fs::remove_file(&tmp).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(StoreError::io(&tmp, e)),
        _ => (),
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    if let Some(mode) = mode {
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options
        .open(&tmp)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    file.flush().await.map_err(|e| StoreError::io(&tmp, e))?;
    mem::drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

/// A decoded document, before any migration.
#[derive(Debug)]
pub enum Decoded {
    Current(Configuration),
    Legacy(LegacyDocument),
}

/// Serialize in the current layout: pretty JSON with a trailing newline.
pub fn encode(configuration: &Configuration) -> Result<String, StoreError> {
    let mut text = serde_json::to_string_pretty(&Document::from_configuration(configuration))?;
    text.push('\n');
    Ok(text)
}

/// The text `configuration` is persisted as, and the configuration that text reads back as.
fn persisted(configuration: &Configuration) -> Result<(String, Configuration), StoreError> {
    let document = Document::from_configuration(configuration);
    let mut text = serde_json::to_string_pretty(&document)?;
    text.push('\n');
    Ok((text, document.into_configuration()?))
}

/// Parse either layout. A missing `version` means version 1.
pub fn decode(text: &str) -> Result<Decoded, StoreError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let version = match value.get("version") {
        None | Some(serde_json::Value::Null) => 1,
        Some(v) => v.as_u64().ok_or_else(|| {
            StoreError::Malformed(serde::de::Error::custom(format!("bad version {v}")))
        })?,
    };
    match version {
        1 => Ok(Decoded::Legacy(serde_json::from_value(value)?)),
        CURRENT_VERSION => {
            let document: Document = serde_json::from_value(value)?;
            Ok(Decoded::Current(document.into_configuration()?))
        }
        other => Err(StoreError::UnsupportedVersion(other)),
    }
}

/// The persisted set of clouds.
///
/// Readers get an immutable [`Configuration`] snapshot; [`ConfigStore::save`] is the only way to
/// change it.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Configuration>>,
}

impl ConfigStore {
    /// Load the document at `path`. A missing file is an empty configuration; a version 1
    /// document is migrated and written back in the current layout right away.
    #[tracing::instrument(skip(ctx))]
    pub async fn open(path: PathBuf, ctx: &MigrationContext<'_>) -> Result<Self, StoreError> {
        let configuration = match tokio::fs::read_to_string(&path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No configuration at '{}', starting empty", path.display());
                Configuration::default()
            }
            Err(e) => return Err(StoreError::io(&path, e)),
            Ok(text) => match decode(&text)? {
                Decoded::Current(configuration) => configuration,
                Decoded::Legacy(legacy) => {
                    let (text, configuration) = persisted(&legacy::migrate(legacy, ctx).await?)?;
                    write_atomically(&path, text.as_bytes()).await?;
                    tracing::info!("Rewrote '{}' in the current layout", path.display());
                    configuration
                }
            },
        };
        tracing::info!("Loaded {} clouds", configuration.clouds.len());
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(configuration)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> Arc<Configuration> {
        Arc::clone(&*self.current.read().await)
    }

    /// Validate, persist and publish `configuration`. Nothing changes if any step fails.
    ///
    /// What gets published is the configuration as it reads back from disk, so snapshots taken
    /// before and after a restart are equal.
    pub async fn save(&self, configuration: Configuration) -> Result<(), StoreError> {
        configuration.validate()?;
        let (text, configuration) = persisted(&configuration)?;
        let mut current = self.current.write().await;
        write_atomically(&self.path, text.as_bytes()).await?;
        *current = Arc::new(configuration);
        tracing::info!("Saved {} clouds to '{}'", current.clouds.len(), self.path.display());
        Ok(())
    }
}
