use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::constants::{MULTIPART_CHUNK_BYTES, MULTIPART_THRESHOLD_BYTES};
use crate::paths::{AppPaths, PathError, validate_bucket, validate_key};

// Object storage abstractions.
//
// Objects are addressed by `(bucket, key)`. Keys are `/`-separated and may not
// escape the bucket. Writes replace existing objects atomically; large local
// files go through `put_multipart`, which backends may implement natively.

/// Errors emitted by blob storage operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object `{bucket}/{key}` not found")]
    NotFound { bucket: String, key: String },

    #[error(transparent)]
    Location(#[from] PathError),

    #[error("io error: {0}")]
    Io(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl BlobError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        BlobError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }
}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        BlobError::Io(e.to_string())
    }
}

/// Outcome of [`BlobStore::upload_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Object already present and `overwrite` was false.
    Skipped,
    Uploaded { size_bytes: u64, parts: usize },
}

/// Trait abstracting over object storage backends.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, BlobError>;

    /// Full object body or `BlobError::NotFound`.
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, BlobError>;

    /// Create or replace the object.
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), BlobError>;

    /// Delete the object if present. Returns Ok(true) if deleted, Ok(false) if it
    /// did not exist.
    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, BlobError>;

    /// Upload a local file in `part_size` chunks. Returns the part count.
    ///
    /// The default buffers every part and issues one `put`.
    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        part_size: usize,
    ) -> Result<usize, BlobError> {
        let mut file = fs::File::open(path).await?;
        let mut body = BytesMut::new();
        let mut parts = 0;
        loop {
            let part = read_part(&mut file, part_size).await?;
            if part.is_empty() {
                break;
            }
            body.extend_from_slice(&part);
            parts += 1;
        }
        self.put(bucket, key, body.freeze()).await?;
        Ok(parts.max(1))
    }

    /// Upload a local file, skipping when the object exists and `overwrite` is
    /// false. Files above the multipart threshold are sent in parts.
    async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        overwrite: bool,
    ) -> Result<UploadOutcome, BlobError> {
        if !overwrite && self.exists(bucket, key).await? {
            tracing::debug!(bucket, key, "object exists; upload skipped");
            return Ok(UploadOutcome::Skipped);
        }
        let size_bytes = fs::metadata(path)
            .await
            .map_err(|e| BlobError::Io(format!("stat {}: {}", path.display(), e)))?
            .len();
        let parts = if size_bytes > MULTIPART_THRESHOLD_BYTES {
            self.put_multipart(bucket, key, path, MULTIPART_CHUNK_BYTES)
                .await?
        } else {
            let data = fs::read(path)
                .await
                .map_err(|e| BlobError::Io(format!("read {}: {}", path.display(), e)))?;
            self.put(bucket, key, Bytes::from(data)).await?;
            1
        };
        tracing::debug!(bucket, key, size_bytes, parts, "uploaded file");
        Ok(UploadOutcome::Uploaded { size_bytes, parts })
    }

    /// Download an object to `path`, creating parent directories.
    async fn download_file(&self, bucket: &str, key: &str, path: &Path) -> Result<u64, BlobError> {
        let data = self.get(bucket, key).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, &data)
            .await
            .map_err(|e| BlobError::Io(format!("write {}: {}", path.display(), e)))?;
        Ok(data.len() as u64)
    }
}

async fn read_part(file: &mut fs::File, part_size: usize) -> Result<Vec<u8>, BlobError> {
    debug_assert!(part_size > 0);
    let mut buf = vec![0u8; part_size];
    let mut filled = 0;
    while filled < part_size {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Durability policy for filesystem writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurableWrite {
    /// No explicit fsync (fastest, least durable).
    #[default]
    None,
    /// Fsync the file only.
    FileOnly,
    /// Fsync file and parent directory.
    FileAndDir,
}

/// Filesystem blob store rooted at `AppPaths::blobs_base_dir`.
///
/// Layout is `blobs/{bucket}/{key}`. Writes stream into a temp file in the
/// staging dir and are renamed into place, so readers never see a partial
/// object.
#[derive(Debug, Clone, bon::Builder)]
pub struct FsBlobStore {
    paths: AppPaths,
    #[builder(default = DurableWrite::None)]
    durability: DurableWrite,
}

impl FsBlobStore {
    /// Final object path without creating directories.
    fn object_path_unchecked(&self, bucket: &str, key: &str) -> Result<PathBuf, BlobError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let mut path = self.paths.data_dir();
        path.push("blobs");
        path.push(bucket);
        for part in key.split('/') {
            path.push(part);
        }
        Ok(path)
    }

    async fn fsync_dir(&self, dir_path: &Path) {
        // Directory fsync is best-effort; some platforms don't support it.
        match fs::File::open(dir_path).await {
            Ok(dir_file) => {
                if let Err(e) = dir_file.sync_all().await {
                    tracing::warn!("directory fsync unsupported or failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("failed to open directory for fsync: {}", e),
        }
    }

    /// Stage `chunks` in a temp file and rename it onto the object path.
    async fn write_staged(
        &self,
        bucket: &str,
        key: &str,
        chunks: impl IntoIterator<Item = Bytes>,
    ) -> Result<(), BlobError> {
        let final_path = self.paths.blob_path(bucket, key)?;
        let staging = self.paths.staging_dir()?;
        let temp_file = tempfile::NamedTempFile::new_in(&staging)
            .map_err(|e| BlobError::Io(format!("create temp file: {}", e)))?;
        let mut file = fs::File::from_std(
            temp_file
                .reopen()
                .map_err(|e| BlobError::Io(format!("reopen temp file: {}", e)))?,
        );
        for chunk in chunks {
            file.write_all(&chunk)
                .await
                .map_err(|e| BlobError::Io(format!("write chunk: {}", e)))?;
        }
        if self.durability != DurableWrite::None {
            file.sync_all()
                .await
                .map_err(|e| BlobError::Io(format!("fsync file: {}", e)))?;
        }
        drop(file);

        temp_file
            .persist(&final_path)
            .map_err(|e| BlobError::Io(format!("rename into place: {}", e.error)))?;

        if self.durability == DurableWrite::FileAndDir
            && let Some(parent) = final_path.parent()
        {
            self.fsync_dir(parent).await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, BlobError> {
        let path = self.object_path_unchecked(bucket, key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobError::Io(format!("stat object: {}", e))),
        }
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, BlobError> {
        let path = self.object_path_unchecked(bucket, key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::not_found(bucket, key))
            }
            Err(e) => Err(BlobError::Io(format!("read object: {}", e))),
        }
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), BlobError> {
        self.write_staged(bucket, key, [data]).await
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, BlobError> {
        let path = self.object_path_unchecked(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobError::Io(format!("delete object: {}", e))),
        }
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        part_size: usize,
    ) -> Result<usize, BlobError> {
        let mut file = fs::File::open(path).await?;
        let mut parts = Vec::new();
        loop {
            let part = read_part(&mut file, part_size).await?;
            if part.is_empty() {
                break;
            }
            parts.push(Bytes::from(part));
        }
        let count = parts.len().max(1);
        self.write_staged(bucket, key, parts).await?;
        Ok(count)
    }
}

/// In-memory store used by tests and local dry runs.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<(String, String), Bytes>>,
    puts: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Keys currently stored in `bucket`, sorted.
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .await
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, key)| key.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, BlobError> {
        let objects = self.objects.lock().await;
        Ok(objects.contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, BlobError> {
        let objects = self.objects.lock().await;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| BlobError::not_found(bucket, key))
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), BlobError> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        self.objects
            .lock()
            .await
            .insert((bucket.to_string(), key.to_string()), data);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, BlobError> {
        let mut objects = self.objects.lock().await;
        Ok(objects
            .remove(&(bucket.to_string(), key.to_string()))
            .is_some())
    }
}

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Options {
    /// Custom endpoint (MinIO, Ceph, IBM COS); AWS resolution when unset.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Defaults to true whenever `endpoint_url` is set.
    #[serde(default)]
    pub force_path_style: Option<bool>,
}

#[cfg(feature = "s3")]
pub use s3::S3BlobStore;

#[cfg(feature = "s3")]
mod s3 {
    use std::path::Path;

    use aws_sdk_s3::error::SdkError;
    use aws_sdk_s3::operation::get_object::GetObjectError;
    use aws_sdk_s3::operation::head_object::HeadObjectError;
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
    use bytes::Bytes;
    use tokio::fs;

    use super::{BlobError, BlobStore, S3Options, read_part};

    /// Object store backed by an S3-compatible service.
    #[derive(Debug, Clone)]
    pub struct S3BlobStore {
        client: aws_sdk_s3::Client,
    }

    impl S3BlobStore {
        /// Build a client from the ambient AWS environment plus `options`.
        pub async fn connect(options: &S3Options) -> Self {
            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
            if let Some(region) = options.region.clone() {
                loader = loader.region(aws_config::Region::new(region));
            }
            let shared = loader.load().await;
            let mut builder = aws_sdk_s3::config::Builder::from(&shared);
            if let Some(url) = options.endpoint_url.clone() {
                builder = builder.endpoint_url(url);
            }
            let force_path_style = options
                .force_path_style
                .unwrap_or(options.endpoint_url.is_some());
            if force_path_style {
                builder = builder.force_path_style(true);
            }
            Self {
                client: aws_sdk_s3::Client::from_conf(builder.build()),
            }
        }

        async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
            if let Err(err) = self
                .client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
            {
                tracing::warn!(bucket, key, error = ?err, "failed to abort multipart upload");
            }
        }

        async fn upload_parts(
            &self,
            bucket: &str,
            key: &str,
            upload_id: &str,
            path: &Path,
            part_size: usize,
        ) -> Result<Vec<CompletedPart>, BlobError> {
            let mut file = fs::File::open(path).await?;
            let mut completed = Vec::new();
            let mut part_number = 1;
            loop {
                let part = read_part(&mut file, part_size).await?;
                if part.is_empty() && part_number > 1 {
                    break;
                }
                let last = part.len() < part_size;
                let out = self
                    .client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(part))
                    .send()
                    .await
                    .map_err(|e| BlobError::Backend(format!("s3 upload_part failed: {e:?}")))?;
                completed.push(
                    CompletedPart::builder()
                        .set_e_tag(out.e_tag().map(str::to_string))
                        .part_number(part_number)
                        .build(),
                );
                if last {
                    break;
                }
                part_number += 1;
            }
            Ok(completed)
        }
    }

    #[async_trait::async_trait]
    impl BlobStore for S3BlobStore {
        async fn exists(&self, bucket: &str, key: &str) -> Result<bool, BlobError> {
            match self.client.head_object().bucket(bucket).key(key).send().await {
                Ok(_) => Ok(true),
                Err(err) => match map_head_err(bucket, key, err) {
                    BlobError::NotFound { .. } => Ok(false),
                    other => Err(other),
                },
            }
        }

        async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, BlobError> {
            let out = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| map_get_err(bucket, key, err))?;
            let body = out.body.collect().await.map_err(|e| {
                BlobError::Backend(format!("get_object body collect failed: {e:?}"))
            })?;
            Ok(body.into_bytes())
        }

        async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<(), BlobError> {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| BlobError::Backend(format!("s3 put_object failed: {e:?}")))?;
            Ok(())
        }

        async fn delete(&self, bucket: &str, key: &str) -> Result<bool, BlobError> {
            if !self.exists(bucket, key).await? {
                return Ok(false);
            }
            self.client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| BlobError::Backend(format!("s3 delete_object failed: {e:?}")))?;
            Ok(true)
        }

        async fn put_multipart(
            &self,
            bucket: &str,
            key: &str,
            path: &Path,
            part_size: usize,
        ) -> Result<usize, BlobError> {
            let created = self
                .client
                .create_multipart_upload()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| {
                    BlobError::Backend(format!("s3 create_multipart_upload failed: {e:?}"))
                })?;
            let upload_id = created
                .upload_id()
                .ok_or_else(|| BlobError::Backend("multipart upload id missing".to_string()))?
                .to_string();

            let parts = match self
                .upload_parts(bucket, key, &upload_id, path, part_size)
                .await
            {
                Ok(parts) => parts,
                Err(err) => {
                    self.abort_multipart(bucket, key, &upload_id).await;
                    return Err(err);
                }
            };
            let count = parts.len();
            let completion = CompletedMultipartUpload::builder()
                .set_parts(Some(parts))
                .build();
            if let Err(e) = self
                .client
                .complete_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(completion)
                .send()
                .await
            {
                self.abort_multipart(bucket, key, &upload_id).await;
                return Err(BlobError::Backend(format!(
                    "s3 complete_multipart_upload failed: {e:?}"
                )));
            }
            Ok(count)
        }
    }

    fn map_get_err(bucket: &str, key: &str, err: SdkError<GetObjectError>) -> BlobError {
        match err {
            SdkError::ServiceError(ref se) if se.err().is_no_such_key() => {
                BlobError::not_found(bucket, key)
            }
            other => BlobError::Backend(format!("s3 get_object failed: {other:?}")),
        }
    }

    fn map_head_err(bucket: &str, key: &str, err: SdkError<HeadObjectError>) -> BlobError {
        match err {
            SdkError::ServiceError(ref se) if se.err().is_not_found() => {
                BlobError::not_found(bucket, key)
            }
            other => BlobError::Backend(format!("s3 head_object failed: {other:?}")),
        }
    }
}
