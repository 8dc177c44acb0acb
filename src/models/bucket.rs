//! A bucket: the namespace every object key lives in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Bucket metadata row.
///
/// Finalize events and thumbnail writes are always scoped to one bucket; the
/// derived object lands next to its source.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    pub id: Uuid,

    /// Bucket name as used in URLs and events (DNS-style rules).
    pub name: String,

    pub owner_id: Uuid,

    /// Region label, `local` for the emulator.
    pub region: String,

    pub created_at: DateTime<Utc>,

    /// Always false; overwrites replace the previous payload.
    pub versioning_enabled: bool,
}
