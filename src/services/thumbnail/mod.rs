//! Thumbnail generation for finalized uploads.
//!
//! - `keys`: which keys are processed and where their thumbnail goes
//! - `transform`: streaming decode → resize → JPEG encode
//! - `pipeline`: wires a source read and a destination write through the transform
//! - `trigger`: finalize-event entry point and in-process dispatcher

pub mod error;
pub mod keys;
pub mod pipeline;
pub mod transform;
pub mod trigger;

#[cfg(test)]
mod testing;

pub use error::{PipelineError, PipelineResult};
pub use pipeline::Pipeline;
pub use transform::{TargetEncoding, TransformConfig, TransformStage};
pub use trigger::{Invocation, SkipReason, ThumbnailTrigger, run_dispatcher};
