//! The object-store boundary the thumbnail pipeline is written against.
//!
//! `StorageService` implements it for the local disk + SQLite store; tests use
//! an in-memory implementation. Both hand out one `ByteStream` per read and one
//! `ObjectSink` per write, owned by the caller for the duration of a single
//! invocation.

use crate::{
    models::object::Object,
    services::storage_service::StorageResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::{io, pin::Pin};

/// Ordered payload chunks of one object.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Clone, Copy, Debug)]
pub struct ReadOptions {
    /// Verify the payload against its stored checksum before handing out the
    /// stream. Disabled only when running against the emulator.
    pub validate_integrity: bool,
}

#[derive(Clone, Debug)]
pub struct WriteOptions {
    pub content_type: Option<String>,
    /// Resumable uploads can continue from a partial offset. Thumbnails are
    /// always written non-resumable: interrupted writes never commit.
    pub resumable: bool,
}

impl WriteOptions {
    pub fn non_resumable(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            resumable: false,
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a read stream for `bucket/key`.
    async fn open_read(
        &self,
        bucket: &str,
        key: &str,
        options: ReadOptions,
    ) -> StorageResult<ByteStream>;

    /// Open a write stream for `bucket/key`. Nothing becomes visible under the
    /// key until [`ObjectSink::finish`] succeeds.
    async fn open_write(
        &self,
        bucket: &str,
        key: &str,
        options: WriteOptions,
    ) -> StorageResult<Box<dyn ObjectSink>>;
}

/// Destination half of a write.
///
/// Dropping a sink without calling `finish` has the same effect as `abort`.
#[async_trait]
pub trait ObjectSink: Send {
    /// Append a chunk. Resolves once the chunk has been accepted, which is what
    /// throttles upstream producers.
    async fn write(&mut self, chunk: Bytes) -> StorageResult<()>;

    /// Flush and commit the object, returning its metadata.
    async fn finish(self: Box<Self>) -> StorageResult<Object>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>);
}
