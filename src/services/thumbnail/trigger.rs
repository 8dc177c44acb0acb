//! Entry point for finalize notifications.
//!
//! `ThumbnailTrigger::on_finalize` is the whole contract with the hosting
//! runtime: `Ok` for both a generated thumbnail and a guarded skip, `Err` with
//! the pipeline's error otherwise. `run_dispatcher` is the in-process runtime
//! used when the local store publishes its own finalize events.

use crate::{
    models::event::FinalizeEvent,
    services::thumbnail::{
        error::PipelineResult,
        keys::{derive_key, should_process},
        pipeline::Pipeline,
    },
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{Instrument, debug, error, info, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingBucket,
    MissingKey,
    /// The key already names a thumbnail.
    DerivedObject,
}

/// Successful outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Invocation {
    Skipped {
        reason: SkipReason,
    },
    Generated {
        bucket: String,
        source_key: String,
        thumbnail_key: String,
        size_bytes: i64,
    },
}

pub struct ThumbnailTrigger {
    pipeline: Pipeline,
}

impl ThumbnailTrigger {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub async fn on_finalize(&self, event: FinalizeEvent) -> PipelineResult<Invocation> {
        let Some(bucket) = event.bucket.filter(|b| !b.is_empty()) else {
            return Ok(Invocation::Skipped {
                reason: SkipReason::MissingBucket,
            });
        };
        let key = event.name;
        if !should_process(key.as_deref()) {
            let reason = if key.as_deref().is_some_and(|k| !k.is_empty()) {
                SkipReason::DerivedObject
            } else {
                SkipReason::MissingKey
            };
            debug!(bucket, key = key.as_deref().unwrap_or(""), ?reason, "skipping finalize event");
            return Ok(Invocation::Skipped { reason });
        }
        let source_key = key.unwrap_or_default();

        let thumbnail_key = derive_key(&source_key);
        info!(bucket, source_key, thumbnail_key, "generating thumbnail");
        let object = self
            .pipeline
            .run(&bucket, &source_key, &thumbnail_key)
            .await?;

        Ok(Invocation::Generated {
            bucket,
            source_key,
            thumbnail_key,
            size_bytes: object.size_bytes,
        })
    }
}

/// Handle finalize events until every sender is gone.
///
/// Each event runs as its own task; invocations share nothing but the trigger
/// and never wait on each other. At most `max_in_flight` run at once, since
/// each may hold a full decoded raster. Once the limit is reached the
/// dispatcher stops receiving and events queue in the channel. Outcomes are
/// only logged: redelivery is up to whoever produced the event.
pub async fn run_dispatcher(
    mut events: mpsc::Receiver<FinalizeEvent>,
    trigger: Arc<ThumbnailTrigger>,
    max_in_flight: usize,
) {
    info!(max_in_flight, "finalize dispatcher started");
    let limit = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut tasks = tokio::task::JoinSet::new();

    while let Some(event) = events.recv().await {
        let Ok(permit) = limit.clone().acquire_owned().await else {
            break;
        };
        let trigger = trigger.clone();
        let span = info_span!(
            "finalize",
            bucket = event.bucket.as_deref().unwrap_or(""),
            key = event.name.as_deref().unwrap_or("")
        );
        tasks.spawn(
            async move {
                let _permit = permit;
                match trigger.on_finalize(event).await {
                    Ok(Invocation::Skipped { reason }) => debug!(?reason, "invocation skipped"),
                    Ok(Invocation::Generated {
                        thumbnail_key,
                        size_bytes,
                        ..
                    }) => info!(thumbnail_key, size_bytes, "invocation completed"),
                    Err(err) => error!(kind = err.kind(), error = %err, "invocation failed"),
                }
            }
            .instrument(span),
        );

        // Reap finished invocations so the set does not grow unbounded.
        while let Some(joined) = tasks.try_join_next() {
            if let Err(err) = joined {
                error!("invocation task panicked: {}", err);
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!("invocation task panicked: {}", err);
        }
    }
    info!("finalize dispatcher stopped");
}
