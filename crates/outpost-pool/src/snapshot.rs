use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::registry::Registry;

/// Durable home for registry snapshots. The blob format is owned by
/// [`Registry::serialize_all`]; stores treat it as opaque bytes.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<Option<Vec<u8>>>;
    async fn save(&self, blob: Vec<u8>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading snapshot {}", self.path.display())),
        }
    }

    async fn save(&self, blob: Vec<u8>) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &blob)
            .await
            .with_context(|| format!("writing snapshot {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    inner: RwLock<Option<Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, blob: Vec<u8>) -> Result<()> {
        *self.inner.write().await = Some(blob);
        Ok(())
    }
}

/// Write the registry to `store`. Returns the number of endpoints saved.
pub async fn persist(registry: &Registry, store: &dyn SnapshotStore) -> Result<usize> {
    let count = registry.len();
    let blob = registry.serialize_all()?;
    store.save(blob).await?;
    tracing::debug!(count, "registry snapshot saved");
    Ok(count)
}

/// Load a previously persisted snapshot into the registry, if one exists.
pub async fn restore(registry: &Registry, store: &dyn SnapshotStore) -> Result<usize> {
    let Some(blob) = store.load().await? else {
        return Ok(0);
    };
    let restored = registry.restore_all(&blob)?;
    tracing::info!(restored, "registry snapshot restored");
    Ok(restored)
}
