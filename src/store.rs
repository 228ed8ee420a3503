//! Durable lease storage.
//!
//! The engine only needs [`LeaseStore::load_all`], [`LeaseStore::upsert`]
//! and [`LeaseStore::close`]; opening is left to each implementation.
//!
//! [`JsonLeaseStore`] keeps the whole lease set in one JSON document. Every
//! upsert rewrites the document through a temporary sibling file that is
//! fsynced and renamed over the target, so a successful upsert is durable
//! when it returns and a crash mid-write leaves the previous document intact.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lease::Lease;

/// Persistent record of client identity → lease.
pub trait LeaseStore: Send {
    /// Returns every persisted lease, keyed by client identity.
    fn load_all(&mut self) -> impl Future<Output = Result<HashMap<String, Lease>>> + Send;

    /// Inserts or replaces the lease for `lease.client_id`.
    ///
    /// Must not return `Ok` before the record is durable.
    fn upsert(&mut self, lease: &Lease) -> impl Future<Output = Result<()>> + Send;

    /// Releases the store.
    fn close(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized;
}

/// On-disk document format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LeaseFile {
    /// Leases indexed by client ID.
    leases: BTreeMap<String, Lease>,
}

/// JSON-file backed [`LeaseStore`].
#[derive(Debug)]
pub struct JsonLeaseStore {
    path: PathBuf,
    file: LeaseFile,
}

impl JsonLeaseStore {
    /// Opens the lease file at `path`, creating an empty one if needed.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed, or if a new
    /// file cannot be created.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "lease store path cannot be empty".to_string(),
            ));
        }

        if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let file: LeaseFile = if content.trim().is_empty() {
                LeaseFile::default()
            } else {
                serde_json::from_str(&content)?
            };
            debug!("Opened lease file {} ({} leases)", path.display(), file.leases.len());
            return Ok(Self { path, file });
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let store = Self {
            path,
            file: LeaseFile::default(),
        };
        store.persist().await?;
        debug!("Created lease file {}", store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.file)?;
        let temp_path = self.temp_path();

        let mut temp = tokio::fs::File::create(&temp_path).await?;
        temp.write_all(content.as_bytes()).await?;
        temp.flush().await?;
        temp.sync_all().await?;
        drop(temp);

        if let Err(error) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(error.into());
        }

        #[cfg(unix)]
        {
            let dir = match self.path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            tokio::fs::File::open(dir).await?.sync_all().await?;
        }

        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl LeaseStore for JsonLeaseStore {
    async fn load_all(&mut self) -> Result<HashMap<String, Lease>> {
        Ok(self
            .file
            .leases
            .iter()
            .map(|(client_id, lease)| (client_id.clone(), lease.clone()))
            .collect())
    }

    async fn upsert(&mut self, lease: &Lease) -> Result<()> {
        self.file
            .leases
            .insert(lease.client_id.clone(), lease.clone());
        self.persist().await
    }

    async fn close(self) -> Result<()> {
        debug!("Closed lease file {}", self.path.display());
        Ok(())
    }
}
