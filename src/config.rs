//! Conversion settings and the command line interface.
//!
//! [`ConvertConfig`] carries every knob of a job and is recorded in the
//! output's `multiscales` metadata. The clap definitions below map command
//! line flags (and a few `LINC_` environment variables) onto it.
//!
//! ```ignore
//! use linc_convert::config::ConvertConfig;
//!
//! let config = ConvertConfig::default()
//!     .with_chunk_shape(vec![64])
//!     .with_voxel_size(vec![10.0, 1.0, 1.0]);
//! config.validate()?;
//! ```

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{ConvertError, Result};
use crate::pyramid::PyramidOptions;
use crate::types::{canonical_rank, Axis, AxisKind};
use crate::writer::{default_workers, WriterOptions};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default chunk edge along spatial axes
pub const DEFAULT_CHUNK: usize = 128;

/// Default downsampling factor
pub const DEFAULT_DOWNSAMPLE_FACTOR: usize = 2;

/// Default minimum extent below which no further level is produced
pub const DEFAULT_MIN_EXTENT: usize = 64;

/// Default number of decoded tiles or slices kept in memory
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 16;

/// Settings of one conversion job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// One value for every spatial axis, one per spatial axis, or one per axis
    pub chunk_shape: Vec<usize>,
    pub compression: CompressionMethod,
    pub compression_level: Option<u8>,
    pub downsample_factor: usize,
    pub downsample_min_extent: usize,
    pub max_levels: Option<usize>,
    /// Isotropic value or one value per spatial axis in `z, y, x` order
    pub voxel_size: Option<Vec<f64>>,
    pub unit: Option<String>,
    /// Labels of the source axes in source order, e.g. `"xyz"`
    pub axis_order: Option<String>,
    pub no_pool: Vec<char>,
    pub workers: usize,
    pub tile_cache_capacity: usize,
    pub overwrite: bool,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            chunk_shape: vec![DEFAULT_CHUNK],
            compression: CompressionMethod::Zstd,
            compression_level: None,
            downsample_factor: DEFAULT_DOWNSAMPLE_FACTOR,
            downsample_min_extent: DEFAULT_MIN_EXTENT,
            max_levels: None,
            voxel_size: None,
            unit: None,
            axis_order: None,
            no_pool: Vec::new(),
            workers: default_workers(),
            tile_cache_capacity: DEFAULT_TILE_CACHE_CAPACITY,
            overwrite: false,
        }
    }
}

impl ConvertConfig {
    pub fn with_chunk_shape(mut self, chunk_shape: Vec<usize>) -> Self {
        self.chunk_shape = chunk_shape;
        self
    }

    pub fn with_compression(mut self, method: CompressionMethod, level: Option<u8>) -> Self {
        self.compression = method;
        self.compression_level = level;
        self
    }

    pub fn with_min_extent(mut self, min_extent: usize) -> Self {
        self.downsample_min_extent = min_extent;
        self
    }

    pub fn with_max_levels(mut self, max_levels: usize) -> Self {
        self.max_levels = Some(max_levels);
        self
    }

    pub fn with_voxel_size(mut self, voxel_size: Vec<f64>) -> Self {
        self.voxel_size = Some(voxel_size);
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_axis_order(mut self, axis_order: impl Into<String>) -> Self {
        self.axis_order = Some(axis_order.into());
        self
    }

    pub fn with_no_pool(mut self, axis: char) -> Self {
        self.no_pool.push(axis);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Check values that do not depend on the input
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ConvertError::InvalidConfig(msg));

        if self.chunk_shape.is_empty() || self.chunk_shape.contains(&0) {
            return invalid(format!(
                "chunk shape must be non-empty and positive, got {:?}",
                self.chunk_shape
            ));
        }
        if self.downsample_factor < 2 {
            return invalid(format!(
                "downsample factor must be at least 2, got {}",
                self.downsample_factor
            ));
        }
        if self.max_levels == Some(0) {
            return invalid("max_levels must be at least 1".to_string());
        }
        if self.workers == 0 {
            return invalid("workers must be greater than 0".to_string());
        }
        if self.tile_cache_capacity == 0 {
            return invalid("tile_cache_capacity must be greater than 0".to_string());
        }
        self.compression_level().validate_for(self.compression)?;
        if let Some(voxel_size) = &self.voxel_size {
            if voxel_size.is_empty() || voxel_size.len() > 3 {
                return invalid(format!(
                    "voxel size needs 1 to 3 values, got {}",
                    voxel_size.len()
                ));
            }
            if voxel_size.iter().any(|v| !v.is_finite() || *v <= 0.0) {
                return invalid(format!("voxel size must be positive, got {:?}", voxel_size));
            }
        }
        if let Some(axis) = self.no_pool.iter().find(|a| canonical_rank(**a).is_none()) {
            return invalid(format!("unknown axis {:?} in no_pool", axis));
        }
        Ok(())
    }

    pub fn compression_level(&self) -> CompressionLevel {
        self.compression_level
            .map(CompressionLevel::new)
            .unwrap_or_else(|| self.compression.default_level())
    }

    pub fn pyramid_options(&self) -> PyramidOptions {
        PyramidOptions {
            factor: self.downsample_factor,
            min_extent: self.downsample_min_extent,
            max_levels: self.max_levels,
        }
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            compression: self.compression,
            compression_level: self.compression_level(),
            workers: self.workers,
        }
    }

    /// Expand the configured chunk shape to one value per canonical axis.
    ///
    /// Channel and time axes get chunks of one sample unless every axis is
    /// given explicitly.
    pub fn resolve_chunk_shape(&self, axes: &[Axis]) -> Result<Vec<usize>> {
        let spatial = axes.iter().filter(|a| a.kind == AxisKind::Space).count();
        let values = &self.chunk_shape;

        if values.len() == axes.len() && values.len() != 1 {
            return Ok(values.clone());
        }
        if values.len() != 1 && values.len() != spatial {
            return Err(ConvertError::InvalidConfig(format!(
                "chunk shape {:?} does not fit axes {}",
                values,
                axes.iter().map(|a| a.name).collect::<String>()
            )));
        }

        let mut spatial_values = values.iter().cycle();
        Ok(axes
            .iter()
            .map(|axis| match axis.kind {
                AxisKind::Space => spatial_values.next().copied().unwrap_or(DEFAULT_CHUNK),
                _ => 1,
            })
            .collect())
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// linc-convert - convert microscopy acquisitions to OME-Zarr
#[derive(Parser, Debug, Clone)]
#[command(name = "linc-convert")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Stack dark-field slice images (PNG or TIFF) along z
    #[command(name = "darkfield")]
    DarkField(DarkFieldArgs),

    /// Assemble a light-sheet tile mosaic (`*_zNN_yNN*.tif`)
    #[command(name = "lightsheet")]
    LightSheet(LightSheetArgs),

    /// Stack PS-OCT volumes or planes (`.npy`, or `.mat` with the matlab feature)
    #[command(name = "psoct")]
    PsOct(PsOctArgs),

    /// Infer the modality from the inputs and convert
    Detect(DetectArgs),
}

/// Flags shared by all subcommands
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Output store; defaults to `<first input stem>.ome.zarr`
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Chunk edge(s): one value, one per spatial axis, or one per axis
    #[arg(long = "chunk", value_delimiter = ',', default_value = "128", env = "LINC_CHUNK")]
    pub chunk_shape: Vec<usize>,

    /// Chunk compression: zstd, zlib, gzip or raw
    #[arg(long, default_value = "zstd", env = "LINC_COMPRESSION")]
    pub compression: CompressionMethod,

    /// Compression level (0-9 for zlib/gzip, 1-22 for zstd)
    #[arg(long)]
    pub compression_level: Option<u8>,

    /// Downsampling factor along pooled axes
    #[arg(long, default_value_t = DEFAULT_DOWNSAMPLE_FACTOR)]
    pub downsample_factor: usize,

    /// Stop adding levels once the smallest pooled extent would reach this size
    #[arg(long = "min-extent", default_value_t = DEFAULT_MIN_EXTENT)]
    pub downsample_min_extent: usize,

    /// Maximum number of levels, including full resolution
    #[arg(long)]
    pub max_levels: Option<usize>,

    /// Voxel size: one isotropic value or `z,y,x`
    #[arg(long, value_delimiter = ',')]
    pub voxel_size: Option<Vec<f64>>,

    /// Unit of the voxel size (um, nm, mm, ...)
    #[arg(long)]
    pub unit: Option<String>,

    /// Labels of the input axes in input order, e.g. `xyz`
    #[arg(long)]
    pub axis_order: Option<String>,

    /// Axes that are never downsampled
    #[arg(long, value_delimiter = ',')]
    pub no_pool: Vec<char>,

    /// Number of chunks encoded and written concurrently
    #[arg(short = 'j', long, env = "LINC_WORKERS")]
    pub workers: Option<usize>,

    /// Decoded tiles or slices kept in memory
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_CAPACITY, env = "LINC_TILE_CACHE")]
    pub tile_cache: usize,

    /// Replace an existing output store
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,

    /// Enable verbose logging (debug level)
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CommonArgs {
    pub fn to_config(&self) -> ConvertConfig {
        ConvertConfig {
            chunk_shape: self.chunk_shape.clone(),
            compression: self.compression,
            compression_level: self.compression_level,
            downsample_factor: self.downsample_factor,
            downsample_min_extent: self.downsample_min_extent,
            max_levels: self.max_levels,
            voxel_size: self.voxel_size.clone(),
            unit: self.unit.clone(),
            axis_order: self.axis_order.clone(),
            no_pool: self.no_pool.clone(),
            workers: self.workers.unwrap_or_else(default_workers),
            tile_cache_capacity: self.tile_cache,
            overwrite: self.overwrite,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DarkFieldArgs {
    /// Slice images, in stacking order
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Physical distance between slices (defaults to 1)
    #[arg(long)]
    pub slice_thickness: Option<f64>,

    /// Staining recorded in the sidecar
    #[arg(long)]
    pub staining: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LightSheetArgs {
    /// Directory holding the `*_zNN_yNN*.tif` tiles
    pub input: PathBuf,

    /// Expected tile grid as `Z,Y`
    #[arg(long, value_delimiter = ',')]
    pub tile_grid: Option<Vec<usize>>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PsOctArgs {
    /// Input files: one volume, several planes, or several channel volumes
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Acquisition description text file
    #[arg(long)]
    pub meta: Option<PathBuf>,

    /// Dataset name inside `.mat` inputs
    #[arg(long)]
    pub key: Option<String>,

    /// Expected number of polarization channels
    #[arg(long)]
    pub polarization_channels: Option<usize>,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug, Clone)]
pub struct DetectArgs {
    /// Input files or directory
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl Command {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Command::DarkField(args) => &args.common,
            Command::LightSheet(args) => &args.common,
            Command::PsOct(args) => &args.common,
            Command::Detect(args) => &args.common,
        }
    }

    /// Paths given as inputs, used to derive the default output name
    pub fn inputs(&self) -> Vec<PathBuf> {
        match self {
            Command::DarkField(args) => args.inputs.clone(),
            Command::LightSheet(args) => vec![args.input.clone()],
            Command::PsOct(args) => args.inputs.clone(),
            Command::Detect(args) => args.inputs.clone(),
        }
    }

    /// Output store location
    pub fn output(&self) -> Result<PathBuf> {
        if let Some(output) = &self.common().output {
            return Ok(output.clone());
        }
        let inputs = self.inputs();
        let first = inputs
            .first()
            .ok_or_else(|| ConvertError::InvalidConfig("no input given".to_string()))?;
        Ok(default_output_path(first))
    }
}

/// `<stem>.ome.zarr` next to the input
pub fn default_output_path(input: &std::path::Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let stem = stem.strip_suffix(".ome").unwrap_or(&stem);
    input.with_file_name(format!("{}.ome.zarr", stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axes(labels: &str) -> Vec<Axis> {
        labels
            .chars()
            .map(|c| {
                if c == 'c' {
                    Axis::channel(3)
                } else {
                    Axis::space(c, 100, "micrometer", 1.0)
                }
            })
            .collect()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ConvertConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.compression_level().value(), 3);
        assert_eq!(config.pyramid_options().min_extent, 64);
    }

    #[test]
    fn test_invalid_values() {
        let cases = [
            ConvertConfig::default().with_chunk_shape(vec![64, 0]),
            ConvertConfig::default().with_workers(0),
            ConvertConfig::default().with_voxel_size(vec![1.0, -1.0]),
            ConvertConfig::default().with_voxel_size(vec![1.0; 4]),
            ConvertConfig::default().with_compression(CompressionMethod::Zlib, Some(15)),
            ConvertConfig::default().with_no_pool('q'),
            ConvertConfig::default().with_max_levels(0),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(ConvertError::InvalidConfig(_))),
                "{:?}",
                config
            );
        }
    }

    #[test]
    fn test_resolve_chunk_shape() {
        let config = ConvertConfig::default().with_chunk_shape(vec![64]);
        assert_eq!(config.resolve_chunk_shape(&axes("czyx")).unwrap(), vec![1, 64, 64, 64]);

        let config = ConvertConfig::default().with_chunk_shape(vec![8, 64, 32]);
        assert_eq!(config.resolve_chunk_shape(&axes("czyx")).unwrap(), vec![1, 8, 64, 32]);

        let config = ConvertConfig::default().with_chunk_shape(vec![3, 8, 64, 32]);
        assert_eq!(config.resolve_chunk_shape(&axes("czyx")).unwrap(), vec![3, 8, 64, 32]);

        let config = ConvertConfig::default().with_chunk_shape(vec![8, 8]);
        assert!(config.resolve_chunk_shape(&axes("zyx")).is_err());
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: ConvertConfig = serde_json::from_str(r#"{"chunk_shape": [32]}"#).unwrap();
        assert_eq!(config.chunk_shape, vec![32]);
        assert_eq!(config.downsample_factor, 2);
        assert_eq!(config.compression, CompressionMethod::Zstd);
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from([
            "linc-convert",
            "lightsheet",
            "/data/mosaic",
            "--tile-grid",
            "2,3",
            "--chunk",
            "64",
            "--voxel-size",
            "2.5,1,1",
            "--compression",
            "gzip",
            "--no-pool",
            "z",
        ])
        .unwrap();
        let Command::LightSheet(args) = &cli.command else {
            panic!("expected lightsheet");
        };
        assert_eq!(args.tile_grid, Some(vec![2, 3]));
        let config = args.common.to_config();
        assert_eq!(config.chunk_shape, vec![64]);
        assert_eq!(config.voxel_size, Some(vec![2.5, 1.0, 1.0]));
        assert_eq!(config.compression, CompressionMethod::Gzip);
        assert_eq!(config.no_pool, vec!['z']);
        assert_eq!(
            cli.command.output().unwrap(),
            PathBuf::from("/data/mosaic.ome.zarr")
        );

        assert!(Cli::try_parse_from(["linc-convert", "psoct", "a.npy", "--compression", "blosc"])
            .is_err());
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(std::path::Path::new("/in/slice_001.png")),
            PathBuf::from("/in/slice_001.ome.zarr")
        );
    }
}
