//! Data models shared by the local object store and the thumbnail trigger.
//!
//! `Bucket` and `Object` map to SQLite rows via `sqlx::FromRow`; `FinalizeEvent`
//! is the notification payload handed to the trigger after a write completes.

pub mod bucket;
pub mod event;
pub mod object;
