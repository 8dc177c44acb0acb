//! Read → transform → write orchestration for a single thumbnail.

use crate::{
    models::object::Object,
    services::{
        object_store::{ObjectStore, ReadOptions, WriteOptions},
        thumbnail::{
            error::{PipelineError, PipelineResult},
            transform::TransformStage,
        },
    },
};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Streams one source object through the transform into its thumbnail key.
///
/// Holds only process-scoped, immutable state and can be shared across
/// concurrent invocations.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn ObjectStore>,
    stage: TransformStage,
    validate_integrity: bool,
}

impl Pipeline {
    pub fn new(store: Arc<dyn ObjectStore>, stage: TransformStage, validate_integrity: bool) -> Self {
        Self {
            store,
            stage,
            validate_integrity,
        }
    }

    /// Generate `dest_key` from `source_key` inside `bucket`.
    ///
    /// Succeeds only once the destination reports a committed write. On any
    /// failure the destination write is aborted and the source released
    /// before the first error is returned.
    pub async fn run(
        &self,
        bucket: &str,
        source_key: &str,
        dest_key: &str,
    ) -> PipelineResult<Object> {
        let source = self
            .store
            .open_read(
                bucket,
                source_key,
                ReadOptions {
                    validate_integrity: self.validate_integrity,
                },
            )
            .await
            .map_err(PipelineError::from_read)?;

        let content_type = self.stage.config().encoding.content_type();
        let mut sink = self
            .store
            .open_write(bucket, dest_key, WriteOptions::non_resumable(content_type))
            .await
            .map_err(PipelineError::Write)?;

        let mut output = self.stage.apply(source);
        let mut written: u64 = 0;
        while let Some(chunk) = output.next().await {
            let outcome = match chunk {
                Ok(bytes) => {
                    written += bytes.len() as u64;
                    sink.write(bytes).await.map_err(PipelineError::Write)
                }
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                drop(output);
                sink.abort().await;
                warn!(bucket, source_key, dest_key, written, error = %err, "thumbnail pipeline aborted");
                return Err(err);
            }
        }

        let object = sink.finish().await.map_err(PipelineError::Write)?;
        debug!(bucket, source_key, dest_key, size = object.size_bytes, "thumbnail committed");
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        storage_service::StorageError,
        thumbnail::{
            testing::MemoryStore,
            transform::{TransformConfig, tests::png},
        },
    };
    use image::{GenericImageView, ImageFormat};
    use std::time::Duration;

    fn pipeline(store: &Arc<MemoryStore>) -> Pipeline {
        Pipeline::new(
            store.clone(),
            TransformStage::new(TransformConfig::default()),
            true,
        )
    }

    #[tokio::test]
    async fn writes_jpeg_thumbnail() {
        let store = Arc::new(MemoryStore::new());
        store.put("b", "photo.png", png(640, 480));

        let object = pipeline(&store)
            .run("b", "photo.png", "photo.thumbnail.jpg")
            .await
            .unwrap();

        assert_eq!(object.key, "photo.thumbnail.jpg");
        assert_eq!(object.content_type.as_deref(), Some("image/jpeg"));
        let bytes = store.get("b", "photo.thumbnail.jpg").unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
        assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (200, 150));
        assert_eq!(store.write_options().len(), 1);
        assert!(!store.write_options()[0].resumable);
    }

    #[tokio::test]
    async fn large_photo_becomes_200_by_150() {
        let store = Arc::new(MemoryStore::new());
        store.put("b", "photo.png", png(4000, 3000));

        pipeline(&store)
            .run("b", "photo.png", "photo.thumbnail.jpg")
            .await
            .unwrap();

        let bytes = store.get("b", "photo.thumbnail.jpg").unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
        assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (200, 150));
        assert_eq!(store.aborted(), 0);
    }

    #[tokio::test]
    async fn requests_integrity_validation() {
        let store = Arc::new(MemoryStore::new());
        store.put("b", "photo.png", png(10, 10));

        pipeline(&store).run("b", "photo.png", "t.jpg").await.unwrap();
        Pipeline::new(store.clone(), TransformStage::new(TransformConfig::default()), false)
            .run("b", "photo.png", "t.jpg")
            .await
            .unwrap();

        assert_eq!(store.read_validation(), vec![true, false]);
    }

    #[tokio::test]
    async fn missing_source_is_not_found_and_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let err = pipeline(&store)
            .run("b", "gone.png", "gone.thumbnail.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
        assert_eq!(store.writes_opened(), 0);
    }

    #[tokio::test]
    async fn integrity_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.put("b", "photo.png", png(10, 10));
        store.corrupt("b", "photo.png");

        let err = pipeline(&store).run("b", "photo.png", "t.jpg").await.unwrap_err();
        assert!(matches!(err, PipelineError::Integrity(_)));
        assert!(store.get("b", "t.jpg").is_none());
    }

    #[tokio::test]
    async fn decode_failure_aborts_the_write() {
        let store = Arc::new(MemoryStore::new());
        store.put("b", "broken.png", b"not an image at all".to_vec());

        let err = pipeline(&store)
            .run("b", "broken.png", "broken.thumbnail.jpg")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Decode(_)));
        assert_eq!(store.aborted(), 1);
        assert_eq!(store.finished(), 0);
        assert!(store.get("b", "broken.thumbnail.jpg").is_none());
    }

    #[tokio::test]
    async fn write_failure_aborts_and_propagates() {
        let store = Arc::new(MemoryStore::new());
        store.put("b", "photo.png", png(300, 300));
        store.fail_writes_after(0);

        let err = pipeline(&store)
            .run("b", "photo.png", "photo.thumbnail.jpg")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Write(StorageError::Io(_))));
        assert_eq!(store.aborted(), 1);
        assert!(store.get("b", "photo.thumbnail.jpg").is_none());
    }

    #[tokio::test]
    async fn open_write_failure_is_write_error() {
        let store = Arc::new(MemoryStore::new());
        store.put("b", "photo.png", png(10, 10));
        store.reject_open_write();

        let err = pipeline(&store).run("b", "photo.png", "t.jpg").await.unwrap_err();
        assert!(matches!(err, PipelineError::Write(_)));
    }

    #[tokio::test]
    async fn slow_destination_still_completes() {
        let store = Arc::new(MemoryStore::new());
        store.put("b", "photo.png", png(400, 400));
        store.delay_writes(Duration::from_millis(5));

        let stage = TransformStage::new(TransformConfig {
            chunk_size: 512,
            channel_capacity: 1,
            ..TransformConfig::default()
        });
        Pipeline::new(store.clone(), stage, true)
            .run("b", "photo.png", "photo.thumbnail.jpg")
            .await
            .unwrap();

        let bytes = store.get("b", "photo.thumbnail.jpg").unwrap();
        assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (200, 200));
        assert!(store.max_chunk_len() <= 512 + 4096);
    }
}
