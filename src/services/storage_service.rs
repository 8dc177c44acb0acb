//! src/services/storage_service.rs
//!
//! StorageService — the local object store the thumbnailer runs against.
//! Metadata lives in SQLite, payloads on disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`. Every committed write emits a
//! `FinalizeEvent` to the configured notifier, thumbnails included.

use crate::{
    models::{bucket::Bucket, event::FinalizeEvent, object::Object},
    services::object_store::{ByteStream, ObjectSink, ObjectStore, ReadOptions, WriteOptions},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("object `{key}` in bucket `{bucket}` failed integrity check: expected {expected}, got {actual}")]
    IntegrityMismatch {
        bucket: String,
        key: String,
        expected: String,
        actual: String,
    },
    #[error("{0} not supported")]
    Unsupported(&'static str),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Local object store: buckets, streamed non-resumable writes, validated reads.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    /// Receives a `FinalizeEvent` after every committed write.
    events: Option<mpsc::Sender<FinalizeEvent>>,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const READ_CHUNK_SIZE: usize = 64 * 1024;
const SUPPORTED_REGIONS: [&str; 6] = [
    "local",
    "us-east-1",
    "us-west-2",
    "eu-west-1",
    "eu-north-1",
    "ap-southeast-1",
];

impl StorageService {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            events: None,
        }
    }

    /// Publish finalize events for committed writes on `events`.
    pub fn with_finalize_notifier(mut self, events: mpsc::Sender<FinalizeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Rejects empty or oversized keys and trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// S3-style bucket naming: 3–63 chars of `[a-z0-9.-]`, alphanumeric at
    /// both ends, no `..`, `-.` or `.-`.
    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        Ok(())
    }

    fn ensure_region_valid(&self, region: &str) -> StorageResult<()> {
        if SUPPORTED_REGIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(StorageError::UnsupportedRegion(region.to_string()))
        }
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Two-level shard directories from MD5(bucket/key).
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Payload file of one version of `key`. Every write gets its own file;
    /// the metadata row decides which version is current.
    fn object_path(&self, bucket_name: &str, key: &str, version: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(format!("v-{}", version));
        path
    }

    fn payload_path(&self, bucket: &Bucket, object: &Object) -> StorageResult<PathBuf> {
        let version = object
            .version_id
            .as_deref()
            .ok_or_else(|| StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: object.key.clone(),
            })?;
        Ok(self.object_path(&bucket.name, &object.key, version))
    }

    async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<_, Bucket>(
            "SELECT id, name, owner_id, region, created_at, versioning_enabled
             FROM buckets WHERE name = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(
            "SELECT id, bucket_id, key, filename, content_type, size_bytes, etag,
                    storage_class, last_modified, version_id, is_deleted
             FROM objects
             WHERE key = ? AND bucket_id = ? AND is_deleted = 0",
        )
        .bind(key)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    /// Start a non-resumable write of `bucket/key`.
    ///
    /// Bytes go to a temp file next to the final location; the object only
    /// becomes visible when the returned sink is finished.
    pub async fn begin_write(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
    ) -> StorageResult<DiskObjectSink> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let version = Uuid::new_v4().to_string();
        let final_path = self.object_path(&bucket_rec.name, key, &version);
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;

        debug!(bucket = %bucket_rec.name, key, tmp = %tmp_path.display(), "opened write stream");

        Ok(DiskObjectSink {
            service: self.clone(),
            bucket: bucket_rec,
            key: key.to_string(),
            version,
            content_type,
            file: Some(file),
            tmp_path,
            final_path,
            digest: Context::new(),
            size_bytes: 0,
            settled: false,
        })
    }

    /// Stream-upload an object from an HTTP body (or any chunk stream).
    pub async fn upload_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StorageResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let mut sink = self.begin_write(bucket, key, content_type).await?;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    sink.discard().await;
                    return Err(StorageError::Io(err));
                }
            };
            if let Err(err) = sink.append(chunk).await {
                sink.discard().await;
                return Err(err);
            }
        }
        sink.commit().await
    }

    /// Fetch an object for reading: metadata plus an open file handle.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Object, File)> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;

        let file_path = self.payload_path(&bucket_rec, &object)?;
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        self.fetch_object(&bucket_rec, key).await
    }

    /// Hash the payload in bounded chunks and compare against the stored etag
    /// and size, then rewind the handle.
    async fn verify_payload(
        &self,
        bucket: &str,
        object: &Object,
        file: &mut File,
    ) -> StorageResult<()> {
        let mut digest = Context::new();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut read_total: i64 = 0;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
            read_total += n as i64;
        }

        let actual = format!("{:x}", digest.compute());
        let expected = object.etag.clone().unwrap_or_else(|| "<missing>".into());
        if actual != expected || read_total != object.size_bytes {
            return Err(StorageError::IntegrityMismatch {
                bucket: bucket.to_string(),
                key: object.key.clone(),
                expected: format!("{} ({} bytes)", expected, object.size_bytes),
                actual: format!("{} ({} bytes)", actual, read_total),
            });
        }

        file.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }

    /// Create a bucket and its payload directory.
    pub async fn create_bucket(&self, name: &str, region: String) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let normalized_region = region.to_lowercase();
        self.ensure_region_valid(&normalized_region)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner_id: Uuid::new_v4(),
            region: normalized_region,
            created_at: Utc::now(),
            versioning_enabled: false,
        };

        match sqlx::query(
            "INSERT INTO buckets (id, name, owner_id, region, created_at, versioning_enabled)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(bucket.id)
        .bind(&bucket.name)
        .bind(bucket.owner_id)
        .bind(&bucket.region)
        .bind(bucket.created_at)
        .bind(bucket.versioning_enabled)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    /// Create `name` unless it already exists.
    pub async fn ensure_bucket(&self, name: &str) -> StorageResult<()> {
        match self.create_bucket(name, "local".into()).await {
            Ok(_) | Err(StorageError::BucketAlreadyExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn notify_finalized(&self, bucket: &str, object: &Object) {
        let Some(events) = &self.events else {
            return;
        };
        let event = FinalizeEvent::new(bucket, object.key.clone())
            .with_content_type(object.content_type.clone())
            .with_size(object.size_bytes);
        if events.send(event).await.is_err() {
            warn!(bucket, key = %object.key, "finalize listener is gone; event dropped");
        }
    }
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn open_read(
        &self,
        bucket: &str,
        key: &str,
        options: ReadOptions,
    ) -> StorageResult<ByteStream> {
        let (object, mut file) = self.get_object_reader(bucket, key).await?;
        if options.validate_integrity {
            self.verify_payload(bucket, &object, &mut file).await?;
        }
        Ok(Box::pin(ReaderStream::with_capacity(file, READ_CHUNK_SIZE)))
    }

    async fn open_write(
        &self,
        bucket: &str,
        key: &str,
        options: WriteOptions,
    ) -> StorageResult<Box<dyn ObjectSink>> {
        if options.resumable {
            return Err(StorageError::Unsupported("resumable uploads"));
        }
        let sink = self.begin_write(bucket, key, options.content_type).await?;
        Ok(Box::new(sink))
    }
}

/// An in-flight write to the local store.
///
/// Bytes are appended to a temp file while the MD5 etag and size are tracked.
/// `commit` fsyncs, renames the file to its own version path and upserts the
/// metadata row. The upsert alone switches readers to the new version, so
/// concurrent writers to one key resolve to whichever upsert lands last. A
/// sink that is dropped before committing removes its temp file.
pub struct DiskObjectSink {
    service: StorageService,
    bucket: Bucket,
    key: String,
    version: String,
    content_type: Option<String>,
    file: Option<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    digest: Context,
    size_bytes: i64,
    /// Set once the temp file has been renamed or removed.
    settled: bool,
}

impl DiskObjectSink {
    pub async fn append(&mut self, chunk: Bytes) -> StorageResult<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            StorageError::Io(io::Error::new(ErrorKind::BrokenPipe, "write stream closed"))
        })?;
        file.write_all(&chunk).await?;
        self.size_bytes += chunk.len() as i64;
        self.digest.consume(&chunk);
        Ok(())
    }

    pub async fn commit(mut self) -> StorageResult<Object> {
        let mut file = self.file.take().ok_or_else(|| {
            StorageError::Io(io::Error::new(ErrorKind::BrokenPipe, "write stream closed"))
        })?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&self.tmp_path, &self.final_path).await?;
        self.settled = true;

        let filename = self.key.rsplit('/').next().unwrap_or(&self.key).to_string();
        let digest = std::mem::replace(&mut self.digest, Context::new());
        let etag = format!("{:x}", digest.compute());

        let insert_result = sqlx::query_as::<_, CommittedRow>(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, filename, content_type, size_bytes,
                etag, storage_class, last_modified, version_id, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                storage_class = excluded.storage_class,
                last_modified = excluded.last_modified,
                version_id = excluded.version_id,
                replaced_version_id = objects.version_id,
                is_deleted = 0
            RETURNING id, bucket_id, key, filename, content_type, size_bytes,
                      etag, storage_class, last_modified, version_id, is_deleted,
                      replaced_version_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(self.bucket.id)
        .bind(&self.key)
        .bind(&filename)
        .bind(self.content_type.clone())
        .bind(self.size_bytes)
        .bind(&etag)
        .bind("STANDARD")
        .bind(Utc::now())
        .bind(&self.version)
        .fetch_one(&*self.service.db)
        .await;

        let CommittedRow { object, replaced } = match insert_result {
            Ok(row) => row,
            Err(err) => {
                // Only this write's version file; the current one stays readable.
                let _ = fs::remove_file(&self.final_path).await;
                return Err(StorageError::Sqlx(err));
            }
        };

        if let Some(previous) = replaced.filter(|v| *v != self.version) {
            let stale = self
                .service
                .object_path(&self.bucket.name, &self.key, &previous);
            match fs::remove_file(&stale).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(key = %self.key, version = %previous, "failed to remove replaced payload: {}", err),
            }
        }

        debug!(bucket = %self.bucket.name, key = %object.key, size = object.size_bytes, etag = %etag, "object committed");
        self.service
            .notify_finalized(&self.bucket.name, &object)
            .await;
        Ok(object)
    }

    pub async fn discard(mut self) {
        self.file.take();
        match fs::remove_file(&self.tmp_path).await {
            Ok(()) => debug!(key = %self.key, "discarded partial write"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(key = %self.key, "failed to remove {}: {}", self.tmp_path.display(), err),
        }
        self.settled = true;
    }
}

impl Drop for DiskObjectSink {
    fn drop(&mut self) {
        if !self.settled {
            self.file.take();
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

#[async_trait]
impl ObjectSink for DiskObjectSink {
    async fn write(&mut self, chunk: Bytes) -> StorageResult<()> {
        self.append(chunk).await
    }

    async fn finish(self: Box<Self>) -> StorageResult<Object> {
        (*self).commit().await
    }

    async fn abort(self: Box<Self>) {
        (*self).discard().await
    }
}

/// Upsert result: the committed row plus the version it displaced, if any.
#[derive(sqlx::FromRow)]
struct CommittedRow {
    #[sqlx(flatten)]
    object: Object,
    #[sqlx(rename = "replaced_version_id")]
    replaced: Option<String>,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
