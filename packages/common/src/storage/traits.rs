use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};

use super::error::StorageError;
use super::hash::{ContentHash, ContentHasher};
use crate::model::{BlobId, FileName, Format};

/// Type alias for a boxed async reader.
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;

/// Metadata recorded alongside every stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub id: BlobId,
    pub format: Format,
    pub file_name: FileName,
    /// MIME type guessed from the file name.
    pub content_type: String,
    pub size: u64,
    pub hash: ContentHash,
    pub created_at: DateTime<Utc>,
}

/// Binary storage addressed by [`BlobId`].
///
/// Every `put` allocates a new id; deduplication of identical content happens
/// above this layer, through the content hash returned in [`BlobInfo`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes and return the metadata of the new blob.
    async fn put(
        &self,
        format: &Format,
        file_name: &FileName,
        data: &[u8],
    ) -> Result<BlobInfo, StorageError> {
        let reader: BoxReader = Box::new(Cursor::new(data.to_vec()));
        self.put_stream(format, file_name, reader).await
    }

    /// Store data from an async reader. The blob is durable once this returns.
    async fn put_stream(
        &self,
        format: &Format,
        file_name: &FileName,
        reader: BoxReader,
    ) -> Result<BlobInfo, StorageError>;

    /// Store a local file, keeping its file name.
    async fn upload_file(&self, format: &Format, path: &Path) -> Result<BlobInfo, StorageError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(FileName::from)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("no usable file name in {}", path.display()),
                )
            })?;
        let file = fs::File::open(path).await?;
        self.put_stream(format, &file_name, Box::new(BufReader::new(file)))
            .await
    }

    /// Retrieve all bytes of a blob.
    async fn get(&self, id: &BlobId) -> Result<Vec<u8>, StorageError> {
        let mut reader = self.get_stream(id).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Retrieve a blob as a streaming async reader. Unknown ids yield `NotFound`.
    async fn get_stream(&self, id: &BlobId) -> Result<BoxReader, StorageError>;

    /// Metadata of a stored blob.
    async fn info(&self, id: &BlobId) -> Result<BlobInfo, StorageError>;

    async fn exists(&self, id: &BlobId) -> Result<bool, StorageError>;

    /// Delete a blob.
    ///
    /// Returns `true` if the blob was deleted, `false` if it did not exist.
    async fn delete(&self, id: &BlobId) -> Result<bool, StorageError>;

    /// Copy a blob into `folder` under its recorded file name.
    async fn download(&self, id: &BlobId, folder: &Path) -> Result<PathBuf, StorageError> {
        let info = self.info(id).await?;
        fs::create_dir_all(folder).await?;
        let target = folder.join(info.file_name.sanitized().as_str());

        let mut reader = self.get_stream(id).await?;
        let mut file = fs::File::create(&target).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;

        Ok(target)
    }

    /// Recompute the digest of an original-format blob and compare it with the
    /// one recorded at upload.
    async fn verify_integrity(&self, id: &BlobId) -> Result<bool, StorageError> {
        let info = self.info(id).await?;
        if !info.format.is_original() {
            return Err(StorageError::IntegrityUndefined {
                id: id.to_string(),
                format: info.format.to_string(),
            });
        }

        let mut reader = self.get_stream(id).await?;
        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hasher.len() == info.size && hasher.finalize() == info.hash)
    }
}
