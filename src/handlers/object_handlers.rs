//! HTTP handlers for bucket and object operations.
//! Bodies are streamed in both directions; storage concerns live in
//! `StorageService`. A successful upload fires a finalize event.

use crate::{errors::AppError, models::object::Object, services::storage_service::StorageService};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;

/// Optional request body for `PUT /{bucket}`.
#[derive(Debug, Default, Deserialize)]
pub struct CreateBucketReq {
    #[serde(rename = "LocationConstraint")]
    pub location_constraint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateBucketResp {
    pub bucket: String,
    pub region: String,
}

/// Upload an object to `/{bucket}/{*key}`.
pub async fn upload_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let object = service
        .upload_object_stream(&bucket, &key, content_type, stream)
        .await?;
    tracing::info!(bucket, key, size = object.size_bytes, "object uploaded");

    let mut response = Response::new(Body::empty());
    if let Some(value) = object.etag.as_deref().and_then(quoted_etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// Download an object `/{bucket}/{*key}` as a streaming response.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (meta, file) = service.get_object_reader(&bucket, &key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// HEAD `/{bucket}/{*key}`: same headers as GET, no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let meta = service.get_object_metadata(&bucket, &key).await?;
    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// PUT `/{bucket}`: create bucket. The body may be empty.
pub async fn create_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload: CreateBucketReq = if body.iter().all(u8::is_ascii_whitespace) {
        CreateBucketReq::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| {
            AppError::new(StatusCode::BAD_REQUEST, format!("invalid bucket request: {err}"))
        })?
    };
    let region = payload
        .location_constraint
        .unwrap_or_else(|| "local".into());

    let created = service.create_bucket(&bucket, region).await?;
    Ok((
        StatusCode::OK,
        Json(CreateBucketResp {
            bucket: created.name,
            region: created.region,
        }),
    ))
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0) as u64),
    );

    if let Some(value) = meta.etag.as_deref().and_then(quoted_etag) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

fn quoted_etag(etag: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("\"{}\"", etag)).ok()
}
