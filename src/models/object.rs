//! Metadata for a committed object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A committed object inside a bucket.
///
/// Rows only exist for finished writes: an aborted or interrupted upload never
/// reaches the `objects` table, so readers never observe partial payloads.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    pub id: Uuid,

    pub bucket_id: Uuid,

    /// Path-like key, unique within the bucket.
    pub key: String,

    /// Last path segment of `key`.
    pub filename: String,

    /// MIME type supplied by the writer (`image/jpeg` for thumbnails).
    pub content_type: Option<String>,

    pub size_bytes: i64,

    /// Lowercase hex MD5 of the payload. Reads validate against it unless the
    /// process runs in emulator mode.
    pub etag: Option<String>,

    pub storage_class: String,

    pub last_modified: DateTime<Utc>,

    pub version_id: Option<String>,

    pub is_deleted: bool,
}
