//! Streaming image transform: encoded bytes in, JPEG thumbnail bytes out.
//!
//! Decoding, resizing and encoding are CPU bound and run on a blocking
//! worker. The worker is connected to the async world by two bounded
//! channels:
//!
//! ```text
//! source ByteStream --feeder task--> [input, N chunks] --> decoder/resize/encoder
//!                                                            |
//! TransformStream <--------- [output, N chunks] <------------+
//! ```
//!
//! A full output channel blocks the encoder until the consumer catches up;
//! a busy decoder leaves the input channel full, which parks the feeder and
//! stops it pulling from the source. Neither side ever holds more than
//! `channel_capacity` chunks of encoded data.

use crate::services::{
    object_store::ByteStream,
    storage_service::StorageError,
    thumbnail::error::PipelineError,
};
use bytes::{Buf, Bytes};
use futures::{Stream, StreamExt};
use image::{
    ColorType, DynamicImage, GenericImageView, ImageDecoder, ImageError, ImageFormat,
    codecs::{gif::GifDecoder, jpeg::JpegDecoder, jpeg::JpegEncoder, png::PngDecoder},
    imageops::FilterType,
};
use std::{
    future::Future,
    io::{self, BufReader, Cursor, Read, Write},
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll, ready},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

/// Bytes needed to recognise every supported container.
const SNIFF_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetEncoding {
    Jpeg { quality: u8 },
}

impl TargetEncoding {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpeg { .. } => "image/jpeg",
        }
    }
}

/// Immutable per-process transform settings.
#[derive(Clone, Debug)]
pub struct TransformConfig {
    pub encoding: TargetEncoding,
    /// Length of the longer output axis in pixels.
    pub max_dimension: u32,
    /// Upper bound on the decoded source raster. Larger images fail to decode
    /// instead of exhausting memory.
    pub max_decoded_bytes: u64,
    /// Size of the chunks handed downstream.
    pub chunk_size: usize,
    /// Chunks buffered between stages, per direction.
    pub channel_capacity: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            encoding: TargetEncoding::Jpeg { quality: 80 },
            max_dimension: 200,
            max_decoded_bytes: 256 * 1024 * 1024,
            chunk_size: 64 * 1024,
            channel_capacity: 4,
        }
    }
}

/// Output size for a `width` x `height` source: the longer axis becomes
/// exactly `max_dimension`, the shorter one keeps the aspect ratio (rounded,
/// at least one pixel). Smaller sources are scaled up. A zero
/// `max_dimension` is treated as one.
pub fn thumbnail_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let max_dimension = max_dimension.max(1);
    let scale = |short: u32, long: u32| {
        let scaled = (f64::from(short) * f64::from(max_dimension) / f64::from(long)).round();
        (scaled as u32).clamp(1, max_dimension)
    };
    if width >= height {
        (max_dimension, scale(height, width))
    } else {
        (scale(width, height), max_dimension)
    }
}

/// Resizes and re-encodes image byte streams.
#[derive(Clone, Debug)]
pub struct TransformStage {
    config: Arc<TransformConfig>,
}

impl TransformStage {
    pub fn new(config: TransformConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Start transforming `source`. Work only progresses while the returned
    /// stream is polled; dropping it cancels the transform and releases the
    /// source.
    pub fn apply(&self, source: ByteStream) -> TransformStream {
        let capacity = self.config.channel_capacity.max(1);
        let (input_tx, input_rx) = mpsc::channel(capacity);
        let (output_tx, output_rx) = mpsc::channel(capacity);
        let source_failure = Arc::new(Mutex::new(None));

        let feeder = tokio::spawn(feed_source(source, input_tx, source_failure.clone()));

        let config = self.config.clone();
        let worker = tokio::task::spawn_blocking(move || {
            let reader = ChunkReader::new(input_rx);
            let writer = ChunkWriter::new(output_tx.clone(), config.chunk_size);
            match render(&config, reader, writer) {
                Ok((width, height)) => debug!(width, height, "thumbnail encoded"),
                Err(err) => {
                    let failure = source_failure
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    let err = match (err, failure) {
                        (PipelineError::Decode(_), Some(io_err)) => {
                            PipelineError::Read(StorageError::Io(io_err))
                        }
                        (err, _) => err,
                    };
                    let _ = output_tx.blocking_send(Err(err));
                }
            }
        });

        TransformStream {
            output: output_rx,
            worker: Some(worker),
            feeder,
        }
    }
}

/// Pulls source chunks into the bounded input channel. Stops when the source
/// ends or fails, or when the worker no longer wants input; either way the
/// source stream is dropped on return.
async fn feed_source(
    mut source: ByteStream,
    input: mpsc::Sender<Bytes>,
    failure: Arc<Mutex<Option<io::Error>>>,
) {
    while let Some(chunk) = source.next().await {
        match chunk {
            Ok(bytes) if bytes.is_empty() => continue,
            Ok(bytes) => {
                if input.send(bytes).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                return;
            }
        }
    }
}

fn render(
    config: &TransformConfig,
    mut reader: ChunkReader,
    mut writer: ChunkWriter,
) -> Result<(u32, u32), PipelineError> {
    let mut header = Vec::with_capacity(SNIFF_LEN);
    (&mut reader)
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut header)
        .map_err(|err| PipelineError::Decode(err.to_string()))?;
    if header.is_empty() {
        return Err(PipelineError::Decode("source object is empty".into()));
    }

    let format = image::guess_format(&header).map_err(decode_error)?;
    let source = BufReader::new(Read::chain(Cursor::new(header), reader));
    let image = match format {
        ImageFormat::Png => decode(PngDecoder::new(source), config)?,
        ImageFormat::Jpeg => decode(JpegDecoder::new(source), config)?,
        ImageFormat::Gif => decode(GifDecoder::new(source), config)?,
        other => {
            return Err(PipelineError::Decode(format!(
                "unsupported image format {other:?}"
            )));
        }
    };

    let (source_width, source_height) = image.dimensions();
    let (width, height) = thumbnail_dimensions(source_width, source_height, config.max_dimension);
    debug!(source_width, source_height, width, height, "resizing");
    let resized = image.resize_exact(width, height, FilterType::Triangle);
    drop(image);

    match config.encoding {
        TargetEncoding::Jpeg { quality } => {
            let rgb = resized.to_rgb8();
            JpegEncoder::new_with_quality(&mut writer, quality)
                .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
                .map_err(|err| PipelineError::Encode(err.to_string()))?;
        }
    }
    writer
        .flush()
        .map_err(|err| PipelineError::Encode(err.to_string()))?;

    Ok((width, height))
}

fn decode<'a, D: ImageDecoder<'a>>(
    decoder: Result<D, ImageError>,
    config: &TransformConfig,
) -> Result<DynamicImage, PipelineError> {
    let decoder = decoder.map_err(decode_error)?;
    let (width, height) = decoder.dimensions();
    if width == 0 || height == 0 {
        return Err(PipelineError::Decode(format!(
            "degenerate image dimensions {width}x{height}"
        )));
    }
    if decoder.total_bytes() > config.max_decoded_bytes {
        return Err(PipelineError::Decode(format!(
            "{width}x{height} image needs {} bytes decoded, limit is {}",
            decoder.total_bytes(),
            config.max_decoded_bytes
        )));
    }
    DynamicImage::from_decoder(decoder).map_err(decode_error)
}

fn decode_error(err: ImageError) -> PipelineError {
    PipelineError::Decode(err.to_string())
}

/// Thumbnail bytes produced by [`TransformStage::apply`].
///
/// Yields `Ok` chunks in order; a failure is always the last item.
pub struct TransformStream {
    output: mpsc::Receiver<Result<Bytes, PipelineError>>,
    worker: Option<JoinHandle<()>>,
    feeder: JoinHandle<()>,
}

impl Stream for TransformStream {
    type Item = Result<Bytes, PipelineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let Some(item) = ready!(this.output.poll_recv(cx)) {
            return Poll::Ready(Some(item));
        }

        // Output closed: make sure the worker ended cleanly and did not panic
        // halfway through the image.
        let Some(worker) = this.worker.as_mut() else {
            return Poll::Ready(None);
        };
        let joined = ready!(Pin::new(worker).poll(cx));
        this.worker = None;
        match joined {
            Ok(()) => Poll::Ready(None),
            Err(err) => Poll::Ready(Some(Err(PipelineError::Encode(format!(
                "transform worker failed: {err}"
            ))))),
        }
    }
}

impl Drop for TransformStream {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}

/// Blocking `Read` over the input channel.
struct ChunkReader {
    input: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChunkReader {
    fn new(input: mpsc::Receiver<Bytes>) -> Self {
        Self {
            input,
            current: Bytes::new(),
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.input.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Blocking `Write` that cuts encoder output into `chunk_size` pieces and
/// pushes them into the output channel.
struct ChunkWriter {
    output: mpsc::Sender<Result<Bytes, PipelineError>>,
    buf: Vec<u8>,
    chunk_size: usize,
}

impl ChunkWriter {
    fn new(output: mpsc::Sender<Result<Bytes, PipelineError>>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            output,
            buf: Vec::with_capacity(chunk_size),
            chunk_size,
        }
    }

    fn emit(&mut self) -> io::Result<()> {
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size));
        self.output
            .blocking_send(Ok(Bytes::from(chunk)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "thumbnail consumer went away"))
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= self.chunk_size {
            self.emit()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.emit()
    }
}
