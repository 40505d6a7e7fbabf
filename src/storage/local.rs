// campus-backup/src/storage/local.rs
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{ArchiveDescriptor, ObjectStore, Tier, object_key, sort_newest_first, verify_package};
use crate::config::LocalStorageConfig;
use crate::errors::{AppError, Result};

/// Archive store backed by a directory, e.g. a mounted NAS share.
#[derive(Debug, Clone)]
pub struct LocalArchiveStore {
    root: PathBuf,
    prefix: String,
}

impl LocalArchiveStore {
    pub fn new(config: &LocalStorageConfig) -> Self {
        Self {
            root: config.root.clone(),
            prefix: config.folder_prefix.clone(),
        }
    }

    fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.root.join(object_key(&self.prefix, tier, ""))
    }

    fn object_path(&self, archive: &ArchiveDescriptor) -> PathBuf {
        self.root.join(archive.key(&self.prefix))
    }
}

#[async_trait]
impl ObjectStore for LocalArchiveStore {
    async fn list(&self, tier: Tier) -> Result<Vec<ArchiveDescriptor>> {
        let dir = self.tier_dir(tier);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut archives = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(descriptor) = ArchiveDescriptor::parse(&name) else {
                continue;
            };
            if descriptor.tier != tier {
                continue;
            }
            let size = entry.metadata().await?.len();
            archives.push(descriptor.with_size(size));
        }
        sort_newest_first(&mut archives);
        Ok(archives)
    }

    async fn upload(&self, local_path: &Path, tier: Tier) -> Result<ArchiveDescriptor> {
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let descriptor = ArchiveDescriptor::parse(&name)
            .filter(|d| d.tier == tier)
            .ok_or_else(|| {
                AppError::Transfer(format!("{} is not a {} archive name", name, tier))
            })?;

        let dest = self.object_path(&descriptor);
        let partial = dest.with_extension("gz.partial");
        let transfer = async {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            let size = fs::copy(local_path, &partial).await?;
            fs::rename(&partial, &dest).await?;
            Ok::<u64, std::io::Error>(size)
        };
        let size = transfer.await.map_err(|e| {
            AppError::Transfer(format!(
                "copy of {} to {} failed: {}",
                local_path.display(),
                dest.display(),
                e
            ))
        })?;
        tracing::info!("✅ Stored {} at {}", name, dest.display());
        Ok(descriptor.with_size(size))
    }

    async fn download(&self, archive: &ArchiveDescriptor, dest_dir: &Path) -> Result<PathBuf> {
        let source = self.object_path(archive);
        fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(&archive.name);
        fs::copy(&source, &dest).await.map_err(|e| {
            AppError::Transfer(format!("copy of {} failed: {}", source.display(), e))
        })?;

        let check = dest.clone();
        tokio::task::spawn_blocking(move || verify_package(&check))
            .await
            .map_err(|e| anyhow::anyhow!("verification task failed: {}", e))??;
        Ok(dest)
    }

    async fn delete(&self, archive: &ArchiveDescriptor) -> Result<()> {
        fs::remove_file(self.object_path(archive)).await?;
        Ok(())
    }
}
