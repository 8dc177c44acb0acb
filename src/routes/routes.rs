//! Route table for the local store and the event endpoint.
//!
//! - `GET  /healthz`, `GET /readyz`
//! - `PUT  /{bucket}`: create bucket
//! - `PUT  /{bucket}/{*key}`: upload object (fires finalize)
//! - `GET  /{bucket}/{*key}`, `HEAD /{bucket}/{*key}`: download, metadata
//! - `POST /_events/finalize`: run the thumbnail trigger for a delivered event
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.png`.

use crate::{
    handlers::{
        event_handlers::finalize,
        health_handlers::{healthz, readyz},
        object_handlers::{create_bucket, get_object, head_object, upload_object},
    },
    services::{storage_service::StorageService, thumbnail::ThumbnailTrigger},
};
use axum::{
    Router,
    extract::FromRef,
    routing::{get, post, put},
};
use std::sync::Arc;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub trigger: Arc<ThumbnailTrigger>,
}

impl FromRef<AppState> for StorageService {
    fn from_ref(state: &AppState) -> Self {
        state.storage.clone()
    }
}

impl FromRef<AppState> for Arc<ThumbnailTrigger> {
    fn from_ref(state: &AppState) -> Self {
        state.trigger.clone()
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/_events/finalize", post(finalize))
        .route(
            "/{bucket}/{*key}",
            put(upload_object).get(get_object).head(head_object),
        )
        .route("/{bucket}", put(create_bucket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        storage_service::tests::local_store,
        thumbnail::{Pipeline, TransformConfig, TransformStage, transform::tests::png},
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use image::GenericImageView;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app() -> (Router, TempDir) {
        let (storage, dir) = local_store().await;
        let pipeline = Pipeline::new(
            Arc::new(storage.clone()),
            TransformStage::new(TransformConfig::default()),
            true,
        );
        let state = AppState {
            storage,
            trigger: Arc::new(ThumbnailTrigger::new(pipeline)),
        };
        (routes().with_state(state), dir)
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn finalize_event(body: &str) -> Request<Body> {
        Request::post("/_events/finalize")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (app, _dir) = app().await;
        let (status, _) = send(&app, Request::get("/healthz").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_checks_db_and_disk() {
        let (app, _dir) = app().await;
        let (status, body) = send(&app, Request::get("/readyz").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["checks"]["sqlite"]["ok"], true);
        assert_eq!(json["checks"]["disk"]["ok"], true);
    }

    #[tokio::test]
    async fn upload_then_deliver_event_generates_thumbnail() {
        let (app, _dir) = app().await;
        let upload = Request::put("/uploads/u1/photo.png")
            .header(header::CONTENT_TYPE, "image/png")
            .body(Body::from(png(1200, 900)))
            .unwrap();
        let resp = app.clone().oneshot(upload).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(header::ETAG));

        let (status, body) =
            send(&app, finalize_event(r#"{"bucket":"uploads","name":"u1/photo.png"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "generated");
        assert_eq!(json["thumbnail_key"], "u1/photo.thumbnail.jpg");

        let download = Request::get("/uploads/u1/photo.thumbnail.jpg")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(download).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/jpeg");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (200, 150));
    }

    #[tokio::test]
    async fn thumbnail_event_is_skipped() {
        let (app, _dir) = app().await;
        let (status, body) = send(
            &app,
            finalize_event(r#"{"bucket":"uploads","name":"photo.thumbnail.jpg"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "derived_object");
    }

    #[tokio::test]
    async fn event_failures_map_to_statuses() {
        let (app, _dir) = app().await;
        let (status, body) =
            send(&app, finalize_event(r#"{"bucket":"uploads","name":"missing.png"}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "not_found");

        let upload = Request::put("/uploads/broken.png")
            .body(Body::from("definitely not a png"))
            .unwrap();
        let (status, _) = send(&app, upload).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) =
            send(&app, finalize_event(r#"{"bucket":"uploads","name":"broken.png"}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let head = Request::head("/uploads/broken.thumbnail.jpg")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, head).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_bucket_accepts_empty_and_json_bodies() {
        let (app, _dir) = app().await;
        let (status, _) = send(&app, Request::put("/photos").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);

        let req = Request::put("/archive")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"LocationConstraint":"EU-WEST-1"}"#))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["region"], "eu-west-1");

        let (status, _) = send(&app, Request::put("/photos").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
