//! In-memory `ObjectStore` that records what the pipeline asked of it.

use crate::{
    models::object::Object,
    services::{
        object_store::{ByteStream, ObjectSink, ObjectStore, ReadOptions, WriteOptions},
        storage_service::{StorageError, StorageResult},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream;
use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use uuid::Uuid;

type Key = (String, String);

#[derive(Default)]
struct State {
    objects: HashMap<Key, Vec<u8>>,
    corrupted: HashSet<Key>,
    read_validation: Vec<bool>,
    write_options: Vec<WriteOptions>,
    aborted: usize,
    finished: usize,
    fail_writes_after: Option<usize>,
    reject_open_write: bool,
    write_delay: Option<Duration>,
    max_chunk_len: usize,
    open_writes: usize,
    max_open_writes: usize,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) {
        self.state()
            .objects
            .insert((bucket.into(), key.into()), bytes);
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state()
            .objects
            .get(&(bucket.into(), key.into()))
            .cloned()
    }

    pub fn corrupt(&self, bucket: &str, key: &str) {
        self.state().corrupted.insert((bucket.into(), key.into()));
    }

    pub fn fail_writes_after(&self, chunks: usize) {
        self.state().fail_writes_after = Some(chunks);
    }

    pub fn reject_open_write(&self) {
        self.state().reject_open_write = true;
    }

    pub fn delay_writes(&self, delay: Duration) {
        self.state().write_delay = Some(delay);
    }

    pub fn reads(&self) -> usize {
        self.state().read_validation.len()
    }

    pub fn read_validation(&self) -> Vec<bool> {
        self.state().read_validation.clone()
    }

    pub fn writes_opened(&self) -> usize {
        self.state().write_options.len()
    }

    pub fn write_options(&self) -> Vec<WriteOptions> {
        self.state().write_options.clone()
    }

    pub fn aborted(&self) -> usize {
        self.state().aborted
    }

    pub fn finished(&self) -> usize {
        self.state().finished
    }

    pub fn max_chunk_len(&self) -> usize {
        self.state().max_chunk_len
    }

    /// Highest number of sinks that were open at the same time.
    pub fn max_open_writes(&self) -> usize {
        self.state().max_open_writes
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn open_read(
        &self,
        bucket: &str,
        key: &str,
        options: ReadOptions,
    ) -> StorageResult<ByteStream> {
        let mut state = self.state();
        state.read_validation.push(options.validate_integrity);
        let id = (bucket.to_string(), key.to_string());
        let bytes = state
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::ObjectNotFound {
                bucket: bucket.into(),
                key: key.into(),
            })?;
        if options.validate_integrity && state.corrupted.contains(&id) {
            return Err(StorageError::IntegrityMismatch {
                bucket: bucket.into(),
                key: key.into(),
                expected: "stored".into(),
                actual: "corrupted".into(),
            });
        }

        let chunks: Vec<io::Result<Bytes>> = bytes
            .chunks(1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn open_write(
        &self,
        bucket: &str,
        key: &str,
        options: WriteOptions,
    ) -> StorageResult<Box<dyn ObjectSink>> {
        let mut state = self.state();
        state.write_options.push(options.clone());
        if state.reject_open_write {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "bucket is read-only",
            )));
        }
        state.open_writes += 1;
        state.max_open_writes = state.max_open_writes.max(state.open_writes);
        Ok(Box::new(MemorySink {
            store: self.clone(),
            bucket: bucket.into(),
            key: key.into(),
            content_type: options.content_type,
            buf: Vec::new(),
            chunks: 0,
        }))
    }
}

struct MemorySink {
    store: MemoryStore,
    bucket: String,
    key: String,
    content_type: Option<String>,
    buf: Vec<u8>,
    chunks: usize,
}

#[async_trait]
impl ObjectSink for MemorySink {
    async fn write(&mut self, chunk: Bytes) -> StorageResult<()> {
        let delay = self.store.state().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.store.state();
        if state.fail_writes_after.is_some_and(|limit| self.chunks >= limit) {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection to store lost",
            )));
        }
        state.max_chunk_len = state.max_chunk_len.max(chunk.len());
        self.buf.extend_from_slice(&chunk);
        self.chunks += 1;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<Object> {
        let MemorySink {
            store,
            bucket,
            key,
            content_type,
            buf,
            ..
        } = *self;
        let object = Object {
            id: Uuid::new_v4(),
            bucket_id: Uuid::nil(),
            filename: key.rsplit('/').next().unwrap_or(&key).to_string(),
            key: key.clone(),
            content_type,
            size_bytes: buf.len() as i64,
            etag: Some(format!("{:x}", md5::compute(&buf))),
            storage_class: "STANDARD".into(),
            last_modified: Utc::now(),
            version_id: None,
            is_deleted: false,
        };
        let mut state = store.state();
        state.finished += 1;
        state.open_writes -= 1;
        state.objects.insert((bucket, key), buf);
        Ok(object)
    }

    async fn abort(self: Box<Self>) {
        let mut state = self.store.state();
        state.aborted += 1;
        state.open_writes -= 1;
    }
}
