//! linc-convert - microscopy acquisitions to OME-Zarr
//!
//! Converts dark-field multi-slice images, light-sheet TIFF mosaics and
//! PS-OCT volumes into chunked, multi-resolution Zarr v2 stores carrying
//! OME-NGFF 0.4 `multiscales` metadata.
//!
//! # Features
//!
//! - Streaming readers: tiles, sections and files are decoded on demand and
//!   kept in a bounded cache
//! - Axis and unit normalization into canonical `c, z, y, x` order
//! - Mean-window pyramids, each level built from the previous level as stored
//! - Bounded parallel chunk writing with atomic, idempotent chunk files
//! - Codecs: raw, zlib, gzip, zstd
//! - Store metadata written last, so only finished stores look complete
//!
//! # Example
//!
//! ```rust,ignore
//! use linc_convert::{ConversionJob, ConvertConfig, LightSheetParams, ReaderParams};
//!
//! # async fn example() -> linc_convert::Result<()> {
//! let config = ConvertConfig::default().with_voxel_size(vec![2.5, 1.0, 1.0]);
//! let job = ConversionJob::new("brain.ome.zarr", config);
//! let params = LightSheetParams::new("/data/brain_tiles".into());
//! let report = job.run_params(ReaderParams::LightSheet(params)).await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod compression;
pub mod config;
pub mod convert;
pub mod error;
pub mod formats;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod normalize;
pub mod pyramid;
pub mod types;
pub mod utils;
pub mod volume;
pub mod writer;

// Re-exports
pub use access::LevelReader;
pub use compression::{CompressionLevel, CompressionMethod, Compressor};
pub use config::ConvertConfig;
pub use convert::{ConversionJob, ConversionReport};
pub use error::{ConvertError, ErrorKind, Result};
pub use formats::{
    DarkFieldParams, FormatReader, LightSheetParams, Modality, PsOctParams, ReaderParams,
};
pub use io::{FileSystemIOManager, IOManager, MemoryIOManager, StorageBackend, WriteOutcome};
pub use layout::ChunkLayout;
pub use metadata::{Multiscale, StoreAttributes};
pub use normalize::{CanonicalMetadata, SourceMetadata};
pub use pyramid::{build_pyramid, PyramidOptions, PyramidPlan};
pub use types::{Axis, AxisKind, DataType};
pub use volume::{InMemorySource, Region, VolumeBuffer, VolumeSource};
pub use writer::{CancelToken, ChunkWriter, WriterOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
