//! Externally delivered finalize notifications.

use crate::{
    errors::AppError,
    models::event::FinalizeEvent,
    services::thumbnail::{Invocation, ThumbnailTrigger},
};
use axum::{Json, extract::State};
use std::sync::Arc;

/// `POST /_events/finalize`
///
/// Runs the trigger to completion before answering, so the status code is the
/// invocation outcome: 200 for generated or skipped, an error status otherwise.
/// A non-2xx answer is the caller's signal to redeliver.
pub async fn finalize(
    State(trigger): State<Arc<ThumbnailTrigger>>,
    Json(event): Json<FinalizeEvent>,
) -> Result<Json<Invocation>, AppError> {
    let invocation = trigger.on_finalize(event).await.inspect_err(|err| {
        tracing::warn!(kind = err.kind(), error = %err, "delivered finalize event failed");
    })?;
    Ok(Json(invocation))
}
