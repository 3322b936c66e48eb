//! Conversion job: reader, normalizer, pyramid, chunk writer, then store metadata

use crate::access::LevelReader;
use crate::config::ConvertConfig;
use crate::error::{ConvertError, Result};
use crate::formats::{FormatReader, ReaderParams};
use crate::io::{create_io_manager, FileSystemIOManager, IOManager, StorageBackend};
use crate::layout::ChunkLayout;
use crate::metadata::{
    read_array_metadata, ArrayMetadata, ConversionInfo, MetadataEmitter, Multiscale,
    StoreAttributes, ARRAY_METADATA_KEY, GROUP_METADATA_KEY,
};
use crate::normalize::{normalize, CanonicalMetadata, SourceMetadata};
use crate::pyramid::{Downsampler, PyramidPlan};
use crate::types::DataType;
use crate::utils::{format_bytes, format_shape};
use crate::volume::{PermutedSource, VolumeSource};
use crate::writer::{BlockingSource, CancelToken, ChunkWriter, LevelReport};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Summary of a finished conversion
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub conversion_id: Uuid,
    pub modality: String,
    pub axes: String,
    pub shape: Vec<usize>,
    pub data_type: DataType,
    pub levels: Vec<LevelReport>,
    pub sidecar: Option<PathBuf>,
    pub elapsed: Duration,
}

impl ConversionReport {
    pub fn chunks_written(&self) -> usize {
        self.levels.iter().map(|l| l.chunks_written).sum()
    }

    pub fn chunks_unchanged(&self) -> usize {
        self.levels.iter().map(|l| l.chunks_unchanged).sum()
    }

    pub fn bytes_written(&self) -> usize {
        self.levels.iter().map(|l| l.bytes_written).sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} {} {} ({}), {} levels, {} chunks written, {} unchanged, {} in {:.1}s",
            self.modality,
            self.axes,
            format_shape(&self.shape),
            self.data_type,
            self.levels.len(),
            self.chunks_written(),
            self.chunks_unchanged(),
            format_bytes(self.bytes_written()),
            self.elapsed.as_secs_f64()
        )
    }
}

/// One conversion into one store
pub struct ConversionJob {
    io: Arc<dyn IOManager>,
    config: ConvertConfig,
    cancel: CancelToken,
    sidecar_path: Option<PathBuf>,
}

/// `<stem>.json` next to a `<stem>.ome.zarr` store
pub fn sidecar_path(store: &Path) -> PathBuf {
    let name = store
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name
        .strip_suffix(".ome.zarr")
        .or_else(|| name.strip_suffix(".zarr"))
        .unwrap_or(&name);
    store.with_file_name(format!("{}.json", stem))
}

impl ConversionJob {
    /// Convert into a store on the local file system
    pub fn new(output: impl AsRef<Path>, config: ConvertConfig) -> Self {
        let output = output.as_ref();
        Self {
            io: Arc::new(FileSystemIOManager::new(output)),
            config,
            cancel: CancelToken::new(),
            sidecar_path: Some(sidecar_path(output)),
        }
    }

    /// Convert into the store at `url` (`file://`, a plain path, or `memory://`)
    pub fn create(url: &str, config: ConvertConfig) -> Result<Self> {
        let io: Arc<dyn IOManager> = Arc::from(create_io_manager(url)?);
        let sidecar = match io.backend() {
            StorageBackend::FileSystem => {
                Some(sidecar_path(Path::new(url.strip_prefix("file://").unwrap_or(url))))
            }
            StorageBackend::Memory => None,
        };
        Ok(Self {
            io,
            config,
            cancel: CancelToken::new(),
            sidecar_path: sidecar,
        })
    }

    /// Convert through a caller-provided I/O manager; no sidecar is written
    pub fn with_io(io: Arc<dyn IOManager>, config: ConvertConfig) -> Self {
        Self {
            io,
            config,
            cancel: CancelToken::new(),
            sidecar_path: None,
        }
    }

    pub fn with_sidecar_path(mut self, path: Option<PathBuf>) -> Self {
        self.sidecar_path = path;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the job when cancelled
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    pub fn io(&self) -> Arc<dyn IOManager> {
        Arc::clone(&self.io)
    }

    /// Open the input described by `params` and convert it
    pub async fn run_params(&self, params: ReaderParams) -> Result<ConversionReport> {
        self.config.validate()?;
        let capacity = self.config.tile_cache_capacity;
        let reader =
            tokio::task::spawn_blocking(move || FormatReader::open(params, capacity)).await??;
        self.run(reader).await
    }

    /// Convert an opened input
    pub async fn run(&self, reader: FormatReader) -> Result<ConversionReport> {
        self.config.validate()?;
        let source = reader.source();
        let metadata = normalize(
            source.shape(),
            source.data_type(),
            &reader.source_metadata(),
            &self.config,
        )?;
        let sidecar = reader.sidecar(&metadata);
        self.execute(source, metadata, reader.name(), sidecar).await
    }

    /// Convert any volume source with reader-style metadata
    pub async fn run_source(
        &self,
        source: Arc<dyn VolumeSource>,
        metadata: SourceMetadata,
        name: &str,
    ) -> Result<ConversionReport> {
        self.config.validate()?;
        let metadata = normalize(source.shape(), source.data_type(), &metadata, &self.config)?;
        self.execute(source, metadata, name.to_string(), None).await
    }

    async fn execute(
        &self,
        source: Arc<dyn VolumeSource>,
        metadata: CanonicalMetadata,
        name: String,
        sidecar: Option<Value>,
    ) -> Result<ConversionReport> {
        let started = Instant::now();
        let shape = metadata.shape();
        let data_type = metadata.data_type;
        let plan = PyramidPlan::new(&shape, &metadata.pooled(), &self.config.pyramid_options())?;
        let chunk_shape = self.config.resolve_chunk_shape(&metadata.axes)?;
        info!(
            name = %name,
            modality = %metadata.modality,
            axes = %metadata.axis_names(),
            shape = %format_shape(&shape),
            %data_type,
            levels = plan.num_levels(),
            chunks = ?chunk_shape,
            "starting conversion"
        );

        let layouts = plan
            .levels
            .iter()
            .map(|level| ChunkLayout::new(level.shape.clone(), &chunk_shape, data_type))
            .collect::<Result<Vec<_>>>()?;
        self.prepare_store(&layouts).await?;

        let source: Arc<dyn VolumeSource> = if metadata.is_identity() {
            source
        } else {
            Arc::new(PermutedSource::new(source, metadata.permutation.clone()))
        };

        let writer = ChunkWriter::new(
            Arc::clone(&self.io),
            self.config.writer_options(),
            self.cancel.clone(),
        );
        let mut levels = Vec::with_capacity(plan.num_levels());
        levels.push(
            writer
                .write_level(0, &layouts[0], &BlockingSource::new(source))
                .await?,
        );
        for (spec, layout) in plan.levels.iter().zip(&layouts).skip(1) {
            let finer = LevelReader::open(Arc::clone(&self.io), spec.index - 1).await?;
            let downsampler = Downsampler::new(finer, spec);
            levels.push(writer.write_level(spec.index, layout, &downsampler).await?);
        }
        if self.cancel.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }

        let sidecar = match (sidecar, &self.sidecar_path) {
            (Some(document), Some(path)) => {
                tokio::fs::write(path, serde_json::to_vec_pretty(&document)?).await?;
                info!(path = %path.display(), "sidecar written");
                Some(path.clone())
            }
            _ => None,
        };

        let kwargs = serde_json::to_value(&self.config)
            .map_err(|e| ConvertError::Internal(format!("cannot record configuration: {}", e)))?;
        let multiscale = Multiscale::new(name, &metadata, &plan, kwargs);
        let conversion = ConversionInfo::new(&metadata);
        let conversion_id = conversion.conversion_id;
        MetadataEmitter::new(Arc::clone(&self.io))
            .emit(&StoreAttributes::new(multiscale, conversion))
            .await?;

        let report = ConversionReport {
            conversion_id,
            modality: metadata.modality.clone(),
            axes: metadata.axis_names(),
            shape,
            data_type,
            levels,
            sidecar,
            elapsed: started.elapsed(),
        };
        info!(summary = %report.summary(), "conversion complete");
        Ok(report)
    }

    /// Only an empty location or something holding a Zarr store may be cleared
    async fn check_replaceable(&self) -> Result<()> {
        let entries = self.io.list("").await?;
        if entries.is_empty()
            || self.io.exists(GROUP_METADATA_KEY).await?
            || self.io.exists(&format!("0/{}", ARRAY_METADATA_KEY)).await?
        {
            return Ok(());
        }
        Err(ConvertError::InvalidConfig(format!(
            "refusing to overwrite an output location that is not a Zarr store ({} entries, e.g. {:?})",
            entries.len(),
            entries[0]
        )))
    }

    /// Remove completion markers and make sure existing levels are compatible
    async fn prepare_store(&self, layouts: &[ChunkLayout]) -> Result<()> {
        if self.config.overwrite {
            self.check_replaceable().await?;
            info!("clearing existing store");
            return self.io.clear().await;
        }
        for (level, layout) in layouts.iter().enumerate() {
            if !self
                .io
                .exists(&format!("{}/{}", level, ARRAY_METADATA_KEY))
                .await?
            {
                continue;
            }
            let existing = read_array_metadata(self.io.as_ref(), level).await?;
            let wanted = ArrayMetadata::new(
                layout,
                self.config.compression,
                self.config.compression_level(),
            );
            if existing.shape != wanted.shape
                || existing.chunks != wanted.chunks
                || existing.dtype != wanted.dtype
            {
                return Err(ConvertError::InvalidConfig(format!(
                    "level {} already holds a {:?} {} array chunked {:?}; use overwrite to replace it",
                    level, existing.shape, existing.dtype, existing.chunks
                )));
            }
            // Chunks of one array share a single codec
            if existing.compressor != wanted.compressor {
                return Err(ConvertError::InvalidConfig(format!(
                    "level {} is compressed with {}, not {}; use overwrite to replace it",
                    level, existing.compressor, wanted.compressor
                )));
            }
        }

        MetadataEmitter::new(Arc::clone(&self.io))
            .clear_stale()
            .await?;

        let extra = format!("{}/{}", layouts.len(), ARRAY_METADATA_KEY);
        if self.io.exists(&extra).await? {
            warn!(
                level = layouts.len(),
                "store holds levels beyond the planned pyramid; they will not be referenced"
            );
        }
        Ok(())
    }
}
