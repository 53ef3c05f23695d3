use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{BypassRecord, BypassStore, StoreError};
use crate::directory::Domain;

/// On-disk layout: bypass records keyed by domain plus the blocking switch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    #[serde(default)]
    bypasses: BTreeMap<Domain, BypassRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blocking_enabled: Option<bool>,
}

/// Bypass store persisted as a single JSON document.
///
/// Every write serializes the whole state to a sibling temporary file, syncs
/// it, and renames it over the target, so a crash leaves either the old or
/// the new state on disk. The in-memory copy is only updated once the rename
/// has succeeded.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: RwLock<StateFile>,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be read and
    /// [`StoreError::Corrupt`] if it does not contain a bypass state.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let state: StateFile = match fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => StateFile::default(),
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StateFile::default(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        tracing::info!(
            path = ?path,
            records = state.bypasses.len(),
            blocking_enabled = ?state.blocking_enabled,
            "opened bypass store"
        );

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map_or_else(|| OsString::from("bypasses"), ToOwned::to_owned);
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn persist(&self, state: &StateFile) -> Result<(), StoreError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { path, source }
        };

        let content = serde_json::to_vec_pretty(state).map_err(StoreError::Encode)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }

        let temp = self.temp_path();
        let mut file = File::create(&temp).await.map_err(io_err(&temp))?;
        file.write_all(&content).await.map_err(io_err(&temp))?;
        file.sync_all().await.map_err(io_err(&temp))?;
        drop(file);

        fs::rename(&temp, &self.path)
            .await
            .map_err(io_err(&self.path))?;

        tracing::debug!(
            path = ?self.path,
            records = state.bypasses.len(),
            "persisted bypass store"
        );
        Ok(())
    }

    /// Apply `change` to a copy of the state and persist it if `change`
    /// reports a modification. The live state is replaced only after the
    /// write succeeds.
    async fn update(&self, change: impl FnOnce(&mut StateFile) -> bool) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        if !change(&mut next) {
            return Ok(());
        }
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }
}

impl BypassStore for JsonFileStore {
    async fn get(&self, domain: &Domain) -> Result<Option<BypassRecord>, StoreError> {
        Ok(self.state.read().await.bypasses.get(domain).cloned())
    }

    async fn put(&self, domain: Domain, record: BypassRecord) -> Result<(), StoreError> {
        self.update(|state| {
            state.bypasses.insert(domain, record);
            true
        })
        .await
    }

    async fn delete(&self, domain: &Domain) -> Result<(), StoreError> {
        self.update(|state| state.bypasses.remove(domain).is_some()).await
    }

    async fn all_entries(&self) -> Result<Vec<(Domain, BypassRecord)>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .bypasses
            .iter()
            .map(|(d, r)| (d.clone(), r.clone()))
            .collect())
    }

    async fn blocking_enabled(&self) -> Result<Option<bool>, StoreError> {
        Ok(self.state.read().await.blocking_enabled)
    }

    async fn set_blocking_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.update(|state| state.blocking_enabled.replace(enabled) != Some(enabled)).await
    }
}
