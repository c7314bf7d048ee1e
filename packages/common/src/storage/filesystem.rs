use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use super::error::StorageError;
use super::hash::ContentHasher;
use super::traits::{BlobInfo, BlobStore, BoxReader};
use crate::model::{BlobId, FileName, Format};

/// Filesystem-backed blob store.
///
/// Blobs are spread over shard directories named after the last two
/// characters of their id, with a JSON sidecar holding [`BlobInfo`]:
/// `{base_path}/{shard}/{id}` and `{base_path}/{shard}/{id}.json`.
pub struct FilesystemBlobStore {
    base_path: PathBuf,
    max_size: u64,
}

impl FilesystemBlobStore {
    /// Create a new filesystem blob store.
    pub async fn new(base_path: PathBuf, max_size: u64) -> Result<Self, StorageError> {
        fs::create_dir_all(&base_path).await?;
        fs::create_dir_all(base_path.join(".tmp")).await?;
        Ok(Self {
            base_path,
            max_size,
        })
    }

    fn shard_dir(&self, id: &BlobId) -> Result<PathBuf, StorageError> {
        let raw = id.as_str();
        let valid = raw.len() >= 2
            && !raw.starts_with('.')
            && !raw.contains("..")
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(StorageError::InvalidBlobId(raw.to_string()));
        }
        Ok(self.base_path.join(&raw[raw.len() - 2..]))
    }

    fn blob_path(&self, id: &BlobId) -> Result<PathBuf, StorageError> {
        Ok(self.shard_dir(id)?.join(id.as_str()))
    }

    fn info_path(&self, id: &BlobId) -> Result<PathBuf, StorageError> {
        Ok(self.shard_dir(id)?.join(format!("{id}.json")))
    }

    /// Path for a temporary file during writes.
    fn temp_path(&self) -> PathBuf {
        self.base_path
            .join(".tmp")
            .join(uuid::Uuid::new_v4().to_string())
    }

    async fn write_info(&self, info: &BlobInfo) -> Result<(), StorageError> {
        let temp_path = self.temp_path();
        let body = serde_json::to_vec_pretty(info)?;
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, self.info_path(&info.id)?).await?;
            Ok::<_, StorageError>(())
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put_stream(
        &self,
        format: &Format,
        file_name: &FileName,
        mut reader: BoxReader,
    ) -> Result<BlobInfo, StorageError> {
        let id = BlobId::generate(format);
        let temp_path = self.temp_path();
        let mut hasher = ContentHasher::new();

        let mut buf = vec![0u8; 64 * 1024]; // 64KB read buffer
        let mut temp_file = fs::File::create(&temp_path).await?;

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    drop(temp_file);
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }

            hasher.update(&buf[..n]);
            if hasher.len() > self.max_size {
                drop(temp_file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(StorageError::SizeLimitExceeded {
                    actual: hasher.len(),
                    limit: self.max_size,
                });
            }

            temp_file.write_all(&buf[..n]).await?;
        }

        temp_file.flush().await?;
        temp_file.sync_all().await?;
        drop(temp_file);

        let size = hasher.len();
        let info = BlobInfo {
            id: id.clone(),
            format: format.clone(),
            file_name: file_name.clone(),
            content_type: mime_guess::from_path(file_name.as_str())
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
            size,
            hash: hasher.finalize(),
            created_at: Utc::now(),
        };

        let blob_path = self.blob_path(&id)?;
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if let Err(e) = fs::rename(&temp_path, &blob_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        if let Err(e) = self.write_info(&info).await {
            let _ = fs::remove_file(&blob_path).await;
            return Err(e);
        }

        debug!(blob_id = %id, format = %format, size, "Stored blob");
        Ok(info)
    }

    async fn get_stream(&self, id: &BlobId) -> Result<BoxReader, StorageError> {
        let blob_path = self.blob_path(id)?;
        match fs::File::open(&blob_path).await {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn info(&self, id: &BlobId) -> Result<BlobInfo, StorageError> {
        let info_path = self.info_path(id)?;
        match fs::read(&info_path).await {
            Ok(body) => Ok(serde_json::from_slice(&body)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, id: &BlobId) -> Result<bool, StorageError> {
        let info_path = self.info_path(id)?;
        Ok(fs::try_exists(&info_path).await? && fs::try_exists(self.blob_path(id)?).await?)
    }

    async fn delete(&self, id: &BlobId) -> Result<bool, StorageError> {
        let had_info = remove_if_exists(&self.info_path(id)?).await?;
        let had_blob = remove_if_exists(&self.blob_path(id)?).await?;
        Ok(had_info || had_blob)
    }
}
