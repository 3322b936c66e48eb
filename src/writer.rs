//! Chunk writer: encodes and stores the chunks of one level with bounded concurrency

use crate::compression::{get_compressor, CompressionLevel, CompressionMethod};
use crate::error::{ConvertError, Result};
use crate::io::{IOManager, WriteOutcome};
use crate::layout::ChunkLayout;
use crate::metadata::{ArrayMetadata, MetadataEmitter};
use crate::volume::{Region, VolumeBuffer, VolumeSource};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Supplies the samples of a level, region by region
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn read(&self, region: &Region) -> Result<VolumeBuffer>;
}

/// Adapts a synchronous [`VolumeSource`] by decoding on the blocking pool
pub struct BlockingSource {
    inner: Arc<dyn VolumeSource>,
}

impl BlockingSource {
    pub fn new(inner: Arc<dyn VolumeSource>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ChunkSource for BlockingSource {
    async fn read(&self, region: &Region) -> Result<VolumeBuffer> {
        let inner = Arc::clone(&self.inner);
        let region = region.clone();
        tokio::task::spawn_blocking(move || inner.read_region(&region)).await?
    }
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop scheduling new work; in-flight chunks still complete
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Codec and parallelism settings
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub compression: CompressionMethod,
    pub compression_level: CompressionLevel,
    pub workers: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::Zstd,
            compression_level: CompressionMethod::Zstd.default_level(),
            workers: default_workers(),
        }
    }
}

/// Number of workers used when none is configured
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Outcome of writing one level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelReport {
    pub level: usize,
    pub shape: Vec<usize>,
    pub chunks_total: usize,
    pub chunks_written: usize,
    pub chunks_unchanged: usize,
    pub bytes_written: usize,
    pub elapsed: Duration,
}

struct ChunkResult {
    outcome: WriteOutcome,
    bytes: usize,
}

pub struct ChunkWriter {
    io: Arc<dyn IOManager>,
    options: WriterOptions,
    cancel: CancelToken,
}

impl ChunkWriter {
    pub fn new(io: Arc<dyn IOManager>, options: WriterOptions, cancel: CancelToken) -> Self {
        Self {
            io,
            options,
            cancel,
        }
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Write a level's `.zarray` and then all of its chunks.
    ///
    /// On the first failure no further chunks are scheduled; chunks already in
    /// flight run to completion and the first error is returned.
    pub async fn write_level(
        &self,
        level: usize,
        layout: &ChunkLayout,
        source: &dyn ChunkSource,
    ) -> Result<LevelReport> {
        if self.cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }

        let started = Instant::now();
        let metadata = ArrayMetadata::new(
            layout,
            self.options.compression,
            self.options.compression_level,
        );
        MetadataEmitter::new(Arc::clone(&self.io))
            .write_array(level, &metadata)
            .await?;

        let total = layout.total_chunks();
        info!(level, layout = %layout.summary(), "writing level");

        let failed = &AtomicBool::new(false);
        let cancel = &self.cancel;
        let results: Vec<Result<ChunkResult>> = stream::iter(layout.chunk_coords())
            .take_while(move |_| {
                futures::future::ready(!cancel.is_cancelled() && !failed.load(Ordering::SeqCst))
            })
            .map(move |coords| async move {
                let result = self.write_chunk(level, layout, source, coords).await;
                if result.is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
                result
            })
            .buffer_unordered(self.options.workers.max(1))
            .collect()
            .await;

        let mut report = LevelReport {
            level,
            shape: layout.shape.clone(),
            chunks_total: total,
            chunks_written: 0,
            chunks_unchanged: 0,
            bytes_written: 0,
            elapsed: Duration::ZERO,
        };
        let mut first_error = None;
        for result in results {
            match result {
                Ok(ChunkResult {
                    outcome: WriteOutcome::Written,
                    bytes,
                }) => {
                    report.chunks_written += 1;
                    report.bytes_written += bytes;
                }
                Ok(ChunkResult {
                    outcome: WriteOutcome::Unchanged,
                    ..
                }) => report.chunks_unchanged += 1,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            warn!(level, error = %e, "level write failed");
            return Err(e);
        }
        if report.chunks_written + report.chunks_unchanged < total {
            warn!(
                level,
                done = report.chunks_written + report.chunks_unchanged,
                total,
                "level write cancelled"
            );
            return Err(ConvertError::Cancelled);
        }

        report.elapsed = started.elapsed();
        info!(
            level,
            written = report.chunks_written,
            unchanged = report.chunks_unchanged,
            bytes = report.bytes_written,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "level complete"
        );
        Ok(report)
    }

    async fn write_chunk(
        &self,
        level: usize,
        layout: &ChunkLayout,
        source: &dyn ChunkSource,
        coords: Vec<usize>,
    ) -> Result<ChunkResult> {
        let region = layout.chunk_region(&coords);
        let block = source.read(&region).await?;
        if block.shape() != region.shape.as_slice() || block.data_type() != layout.data_type {
            return Err(ConvertError::Internal(format!(
                "source returned {:?} {} for chunk {:?} of level {}, expected {:?} {}",
                block.shape(),
                block.data_type(),
                coords,
                level,
                region.shape,
                layout.data_type
            )));
        }

        let chunk_shape = layout.chunk_shape.clone();
        let compressor = get_compressor(self.options.compression);
        let compression_level = self.options.compression_level;
        let encoded = tokio::task::spawn_blocking(move || {
            let padded = block.padded(&chunk_shape)?;
            compressor.compress(&padded.to_le_bytes(), compression_level)
        })
        .await??;

        let key = format!("{}/{}", level, ChunkLayout::chunk_key(&coords));
        let outcome = self
            .io
            .write_if_changed(&key, &encoded)
            .await
            .map_err(|e| ConvertError::ChunkWriteFailure {
                level,
                chunk: coords.clone(),
                reason: e.to_string(),
            })?;
        debug!(key = %key, bytes = encoded.len(), ?outcome, "chunk stored");

        Ok(ChunkResult {
            outcome,
            bytes: match outcome {
                WriteOutcome::Written => encoded.len(),
                WriteOutcome::Unchanged => 0,
            },
        })
    }
}
