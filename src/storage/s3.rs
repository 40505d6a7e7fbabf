// campus-backup/src/storage/s3.rs
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::{ByteStream, Length};
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{ArchiveDescriptor, ObjectStore, Tier, object_key, sort_newest_first, verify_package};
use crate::config::SpacesConfig;
use crate::errors::{AppError, Result};
use crate::utils::with_retries;

const MIB: u64 = 1024 * 1024;

/// One part of a multipart upload, or one range of a parallel download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk {
    /// 1-based, as S3 numbers parts.
    number: i32,
    offset: u64,
    length: u64,
}

impl Chunk {
    /// Inclusive last byte.
    fn end(&self) -> u64 {
        self.offset + self.length - 1
    }

    fn range_header(&self) -> String {
        format!("bytes={}-{}", self.offset, self.end())
    }
}

/// Splits `[0, size)` into consecutive chunks of `part_size`; only the last
/// may be shorter.
fn plan_chunks(size: u64, part_size: u64) -> Vec<Chunk> {
    let part_size = part_size.max(1);
    (0..size.div_ceil(part_size))
        .map(|index| {
            let offset = index * part_size;
            Chunk {
                number: index as i32 + 1,
                offset,
                length: part_size.min(size - offset),
            }
        })
        .collect()
}

/// Archive store on an S3-compatible service (AWS, DigitalOcean Spaces, MinIO).
#[derive(Clone)]
pub struct S3ArchiveStore {
    client: s3::Client,
    bucket: String,
    prefix: String,
    part_size: u64,
    concurrency: usize,
    retries: u32,
}

impl S3ArchiveStore {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        if let Some(endpoint) = spaces_config.endpoint_url.as_deref() {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        Self {
            client: s3::Client::new(&sdk_config),
            bucket: spaces_config.bucket_name.clone(),
            prefix: spaces_config.folder_prefix.clone(),
            part_size: spaces_config.part_size_mb * MIB,
            concurrency: spaces_config.concurrency.max(1),
            retries: spaces_config.retries,
        }
    }

    async fn put_single(&self, local_path: &Path, key: &str) -> anyhow::Result<()> {
        with_retries(self.retries, &format!("upload of {}", key), || async {
            let body = ByteStream::from_path(local_path)
                .await
                .with_context(|| format!("Failed to create ByteStream from file: {}", local_path.display()))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .with_context(|| format!("Failed to upload to s3://{}/{}", self.bucket, key))?;
            Ok(())
        })
        .await
    }

    async fn put_multipart(&self, local_path: &Path, key: &str, size: u64) -> anyhow::Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to start multipart upload of s3://{}/{}", self.bucket, key))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| anyhow!("S3 returned no upload id for {}", key))?
            .to_string();

        match self.upload_parts(local_path, key, &upload_id, size).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .with_context(|| format!("Failed to complete multipart upload of {}", key))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!("Failed to abort multipart upload {}: {}", upload_id, abort_err);
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        local_path: &Path,
        key: &str,
        upload_id: &str,
        size: u64,
    ) -> anyhow::Result<Vec<CompletedPart>> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for chunk in plan_chunks(size, self.part_size) {
            let Chunk {
                number: part_number,
                offset,
                length,
            } = chunk;
            let store = self.clone();
            let permits = permits.clone();
            let path = local_path.to_path_buf();
            let key = key.to_string();
            let upload_id = upload_id.to_string();

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await?;
                let what = format!("part {} of {}", part_number, key);
                let e_tag = with_retries(store.retries, &what, || async {
                    let body = ByteStream::read_from()
                        .path(&path)
                        .offset(offset)
                        .length(Length::Exact(length))
                        .build()
                        .await
                        .with_context(|| format!("Failed to read {} at offset {}", path.display(), offset))?;
                    let out = store
                        .client
                        .upload_part()
                        .bucket(&store.bucket)
                        .key(&key)
                        .upload_id(&upload_id)
                        .part_number(part_number)
                        .body(body)
                        .send()
                        .await
                        .with_context(|| format!("Failed to upload {}", what))?;
                    out.e_tag()
                        .map(str::to_string)
                        .ok_or_else(|| anyhow!("S3 returned no ETag for {}", what))
                })
                .await?;
                Ok::<CompletedPart, anyhow::Error>(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .e_tag(e_tag)
                        .build(),
                )
            });
        }

        let mut parts = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            // First failure aborts the rest; JoinSet cancels them on drop.
            parts.push(joined.context("Upload task panicked")??);
        }
        parts.sort_by_key(|p| p.part_number());
        Ok(parts)
    }

    async fn fetch_ranges(&self, key: &str, dest: &Path, size: u64) -> anyhow::Result<()> {
        let file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create destination file: {}", dest.display()))?;
        file.set_len(size).await?;
        drop(file);

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for chunk in plan_chunks(size, self.part_size) {
            let store = self.clone();
            let permits = permits.clone();
            let key = key.to_string();
            let dest = dest.to_path_buf();

            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await?;
                let range = chunk.range_header();
                let bytes = with_retries(store.retries, &format!("{} of {}", range, key), || async {
                    let object = store
                        .client
                        .get_object()
                        .bucket(&store.bucket)
                        .key(&key)
                        .range(&range)
                        .send()
                        .await
                        .with_context(|| format!("Failed to get {} of s3://{}/{}", range, store.bucket, key))?;
                    let data = object
                        .body
                        .collect()
                        .await
                        .with_context(|| format!("Failed to read {} of {}", range, key))?
                        .into_bytes();
                    if data.len() as u64 != chunk.length {
                        anyhow::bail!("short read for {} of {}: {} bytes", range, key, data.len());
                    }
                    Ok(data)
                })
                .await?;

                let mut out = tokio::fs::OpenOptions::new().write(true).open(&dest).await?;
                out.seek(SeekFrom::Start(chunk.offset)).await?;
                out.write_all(&bytes).await?;
                out.flush().await?;
                Ok::<(), anyhow::Error>(())
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.context("Download task panicked")??;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ArchiveStore {
    async fn list(&self, tier: Tier) -> Result<Vec<ArchiveDescriptor>> {
        let prefix = object_key(&self.prefix, tier, "");
        let mut archives = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .with_context(|| format!("Failed to list s3://{}/{}", self.bucket, prefix))
                .map_err(|e| AppError::Transfer(format!("{:#}", e)))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let name = key.rsplit('/').next().unwrap_or(key);
                if let Some(descriptor) = ArchiveDescriptor::parse(name).filter(|d| d.tier == tier) {
                    let size = object.size().unwrap_or_default().max(0) as u64;
                    archives.push(descriptor.with_size(size));
                }
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
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
            .ok_or_else(|| AppError::Transfer(format!("{} is not a {} archive name", name, tier)))?;
        let key = descriptor.key(&self.prefix);
        let size = tokio::fs::metadata(local_path).await?.len();

        tracing::info!(
            "Uploading {} ({}) to s3://{}/{}",
            local_path.display(),
            crate::utils::system::human_bytes(size),
            self.bucket,
            key
        );
        let result = if size <= self.part_size {
            self.put_single(local_path, &key).await
        } else {
            self.put_multipart(local_path, &key, size).await
        };
        result.map_err(|e| AppError::Transfer(format!("{:#}", e)))?;

        tracing::info!("✅ Successfully uploaded {} to s3://{}/{}", name, self.bucket, key);
        Ok(descriptor.with_size(size))
    }

    async fn download(&self, archive: &ArchiveDescriptor, dest_dir: &Path) -> Result<PathBuf> {
        let key = archive.key(&self.prefix);
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(&archive.name);

        let transfer = async {
            let head = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .with_context(|| format!("Failed to stat s3://{}/{}", self.bucket, key))?;
            let size = head.content_length().unwrap_or_default().max(0) as u64;
            if size == 0 {
                anyhow::bail!("s3://{}/{} is empty", self.bucket, key);
            }
            tracing::info!(
                "Downloading s3://{}/{} ({}) to {}",
                self.bucket,
                key,
                crate::utils::system::human_bytes(size),
                dest.display()
            );
            self.fetch_ranges(&key, &dest, size).await
        };
        transfer
            .await
            .map_err(|e| AppError::Transfer(format!("{:#}", e)))?;

        let check = dest.clone();
        tokio::task::spawn_blocking(move || verify_package(&check))
            .await
            .map_err(|e| anyhow!("verification task failed: {}", e))??;
        tracing::info!("✅ Downloaded and verified {}", archive.name);
        Ok(dest)
    }

    async fn delete(&self, archive: &ArchiveDescriptor) -> Result<()> {
        let key = archive.key(&self.prefix);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("Failed to delete s3://{}/{}", self.bucket, key))
            .map_err(|e| AppError::Transfer(format!("{:#}", e)))?;
        Ok(())
    }
}
