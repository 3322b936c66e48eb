//! Store metadata documents: Zarr v2 `.zarray`/`.zgroup` and OME `multiscales`

use crate::compression::{CompressionLevel, CompressionMethod};
use crate::error::{ConvertError, Result};
use crate::io::IOManager;
use crate::layout::ChunkLayout;
use crate::normalize::CanonicalMetadata;
use crate::pyramid::PyramidPlan;
use crate::types::{AxisKind, DataType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// OME-NGFF version written into `multiscales`
pub const OME_VERSION: &str = "0.4";

/// Key of the array metadata document inside a level
pub const ARRAY_METADATA_KEY: &str = ".zarray";
/// Key of the group metadata document at the store root
pub const GROUP_METADATA_KEY: &str = ".zgroup";
/// Key of the attributes document at the store root
pub const ATTRIBUTES_KEY: &str = ".zattrs";

/// Zarr v2 array metadata (`.zarray`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayMetadata {
    pub zarr_format: u8,
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: String,
    pub compressor: Value,
    pub fill_value: Value,
    pub order: String,
    pub filters: Option<Value>,
    #[serde(default = "default_separator")]
    pub dimension_separator: String,
}

fn default_separator() -> String {
    ".".to_string()
}

impl ArrayMetadata {
    /// Describe a level stored with the given layout and codec
    pub fn new(layout: &ChunkLayout, method: CompressionMethod, level: CompressionLevel) -> Self {
        Self {
            zarr_format: 2,
            shape: layout.shape.clone(),
            chunks: layout.chunk_shape.clone(),
            dtype: layout.data_type.zarr_dtype().to_string(),
            compressor: method.to_metadata(level),
            fill_value: json!(0),
            order: "C".to_string(),
            filters: None,
            dimension_separator: "/".to_string(),
        }
    }

    /// Chunk layout described by this document
    pub fn layout(&self) -> Result<ChunkLayout> {
        if self.zarr_format != 2 {
            return Err(ConvertError::malformed(format!(
                "unsupported zarr_format {}",
                self.zarr_format
            )));
        }
        if self.order != "C" {
            return Err(ConvertError::malformed(format!(
                "unsupported array order {:?}",
                self.order
            )));
        }
        if self.filters.as_ref().is_some_and(|f| !f.is_null()) {
            return Err(ConvertError::malformed("array filters are not supported"));
        }
        ChunkLayout::new(
            self.shape.clone(),
            &self.chunks,
            DataType::from_zarr_dtype(&self.dtype)?,
        )
    }

    pub fn compression(&self) -> Result<(CompressionMethod, CompressionLevel)> {
        CompressionMethod::from_metadata(&self.compressor)
    }
}

/// Zarr v2 group metadata (`.zgroup`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub zarr_format: u8,
}

impl Default for GroupMetadata {
    fn default() -> Self {
        Self { zarr_format: 2 }
    }
}

/// One entry of `multiscales[].axes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmeAxis {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AxisKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Per-level coordinate transformation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CoordinateTransformation {
    Scale { scale: Vec<f64> },
    Translation { translation: Vec<f64> },
}

/// One resolution level of a multiscale image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub path: String,
    #[serde(rename = "coordinateTransformations")]
    pub coordinate_transformations: Vec<CoordinateTransformation>,
}

impl Dataset {
    pub fn scale(&self) -> Option<&[f64]> {
        self.coordinate_transformations.iter().find_map(|t| match t {
            CoordinateTransformation::Scale { scale } => Some(scale.as_slice()),
            _ => None,
        })
    }

    pub fn translation(&self) -> Option<&[f64]> {
        self.coordinate_transformations.iter().find_map(|t| match t {
            CoordinateTransformation::Translation { translation } => Some(translation.as_slice()),
            _ => None,
        })
    }
}

/// An OME `multiscales` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Multiscale {
    pub version: String,
    pub name: String,
    pub axes: Vec<OmeAxis>,
    pub datasets: Vec<Dataset>,
    #[serde(rename = "type")]
    pub kind: String,
    pub metadata: Value,
}

impl Multiscale {
    /// Bind the planned levels to physical coordinates.
    ///
    /// Level `k` of a pooled axis has `scale = voxel * f^k` and
    /// `translation = (f^k - 1) / 2 * voxel`, so that each coarse sample sits at
    /// the centre of the window it averages.
    pub fn new(
        name: impl Into<String>,
        metadata: &CanonicalMetadata,
        plan: &PyramidPlan,
        kwargs: Value,
    ) -> Self {
        let axes = metadata
            .axes
            .iter()
            .map(|axis| OmeAxis {
                name: axis.name.to_string(),
                kind: axis.kind,
                unit: axis.unit.clone(),
            })
            .collect();

        let datasets = plan
            .levels
            .iter()
            .map(|level| {
                let (scale, translation) = metadata
                    .axes
                    .iter()
                    .zip(&level.cumulative)
                    .map(|(axis, &factor)| match axis.kind {
                        AxisKind::Channel => (1.0, 0.0),
                        _ => {
                            let factor = factor as f64;
                            (axis.scale * factor, (factor - 1.0) / 2.0 * axis.scale)
                        }
                    })
                    .unzip();
                Dataset {
                    path: level.index.to_string(),
                    coordinate_transformations: vec![
                        CoordinateTransformation::Scale { scale },
                        CoordinateTransformation::Translation { translation },
                    ],
                }
            })
            .collect();

        let window = metadata
            .axes
            .iter()
            .filter(|axis| axis.kind == AxisKind::Space)
            .map(|axis| if axis.pooled { plan.factor } else { 1 }.to_string())
            .collect::<Vec<_>>()
            .join("x");

        Self {
            version: OME_VERSION.to_string(),
            name: name.into(),
            axes,
            datasets,
            kind: format!("{} mean window", window),
            metadata: json!({
                "description": "local mean over non-overlapping windows",
                "method": "linc_convert.pyramid.downsample",
                "version": env!("CARGO_PKG_VERSION"),
                "kwargs": kwargs,
            }),
        }
    }
}

/// Provenance and modality attributes stored next to `multiscales`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionInfo {
    pub version: String,
    pub conversion_id: Uuid,
    pub created: DateTime<Utc>,
    pub modality: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channel_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl ConversionInfo {
    pub fn new(metadata: &CanonicalMetadata) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            conversion_id: Uuid::new_v4(),
            created: Utc::now(),
            modality: metadata.modality.clone(),
            channel_names: metadata.channel_names.clone(),
            attributes: metadata.attributes.clone(),
        }
    }
}

/// Root attributes document (`.zattrs`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreAttributes {
    pub multiscales: Vec<Multiscale>,
    pub linc_convert: ConversionInfo,
}

impl StoreAttributes {
    pub fn new(multiscale: Multiscale, info: ConversionInfo) -> Self {
        Self {
            multiscales: vec![multiscale],
            linc_convert: info,
        }
    }
}

/// Writes and removes the root metadata that marks a store as complete
pub struct MetadataEmitter {
    io: Arc<dyn IOManager>,
}

impl MetadataEmitter {
    pub fn new(io: Arc<dyn IOManager>) -> Self {
        Self { io }
    }

    /// Remove root metadata left by an earlier run
    pub async fn clear_stale(&self) -> Result<()> {
        for key in [ATTRIBUTES_KEY, GROUP_METADATA_KEY] {
            if self.io.exists(key).await? {
                debug!(key, "removing stale root metadata");
                self.io.delete(key).await?;
            }
        }
        Ok(())
    }

    /// Write a level's `.zarray`
    pub async fn write_array(&self, level: usize, metadata: &ArrayMetadata) -> Result<()> {
        let key = format!("{}/{}", level, ARRAY_METADATA_KEY);
        self.write_json(&key, metadata).await
    }

    /// Write `.zgroup` and then `.zattrs`, the completion marker
    pub async fn emit(&self, attributes: &StoreAttributes) -> Result<()> {
        self.write_json(GROUP_METADATA_KEY, &GroupMetadata::default())
            .await?;
        self.write_json(ATTRIBUTES_KEY, attributes).await?;
        info!(
            levels = attributes
                .multiscales
                .first()
                .map_or(0, |m| m.datasets.len()),
            "store metadata written"
        );
        Ok(())
    }

    async fn write_json<T: Serialize + Sync>(&self, key: &str, document: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|e| ConvertError::MetadataWriteFailure(format!("{}: {}", key, e)))?;
        self.io
            .write(key, &bytes)
            .await
            .map_err(|e| ConvertError::MetadataWriteFailure(format!("{}: {}", key, e)))
    }
}

/// Read a level's `.zarray`
pub async fn read_array_metadata(io: &dyn IOManager, level: usize) -> Result<ArrayMetadata> {
    let key = format!("{}/{}", level, ARRAY_METADATA_KEY);
    let bytes = io.read(&key).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Read the root attributes, `None` if the store is incomplete
pub async fn read_store_attributes(io: &dyn IOManager) -> Result<Option<StoreAttributes>> {
    if !io.exists(ATTRIBUTES_KEY).await? {
        return Ok(None);
    }
    let bytes = io.read(ATTRIBUTES_KEY).await?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIOManager;
    use crate::pyramid::PyramidOptions;
    use crate::types::Axis;

    fn canonical() -> CanonicalMetadata {
        CanonicalMetadata {
            axes: vec![
                Axis::channel(2),
                Axis::space('z', 256, "micrometer", 2.0),
                Axis::space('y', 256, "micrometer", 1.0),
                Axis::space('x', 256, "micrometer", 1.0),
            ],
            permutation: vec![0, 1, 2, 3],
            data_type: DataType::U16,
            channel_names: vec!["dBI".into(), "R3D".into()],
            modality: "psoct".into(),
            attributes: Map::new(),
        }
    }

    #[test]
    fn test_array_metadata_document() {
        let layout = ChunkLayout::new(vec![100, 50], &[64, 64], DataType::U16).unwrap();
        let meta = ArrayMetadata::new(&layout, CompressionMethod::Zstd, CompressionLevel::new(3));
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["shape"], json!([100, 50]));
        assert_eq!(value["chunks"], json!([64, 50]));
        assert_eq!(value["dtype"], "<u2");
        assert_eq!(value["compressor"], json!({"id": "zstd", "level": 3}));
        assert_eq!(value["filters"], Value::Null);
        assert_eq!(value["dimension_separator"], "/");

        let back: ArrayMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(back.layout().unwrap(), layout);
    }

    #[test]
    fn test_multiscale_transforms() {
        let meta = canonical();
        let plan = PyramidPlan::new(
            &meta.shape(),
            &meta.pooled(),
            &PyramidOptions {
                factor: 2,
                min_extent: 32,
                max_levels: None,
            },
        )
        .unwrap();
        let ms = Multiscale::new("sample", &meta, &plan, json!({}));
        assert_eq!(ms.version, "0.4");
        assert_eq!(ms.kind, "2x2x2 mean window");
        assert_eq!(ms.datasets.len(), plan.levels.len());

        let level2 = &ms.datasets[2];
        assert_eq!(level2.path, "2");
        assert_eq!(level2.scale().unwrap(), &[1.0, 8.0, 4.0, 4.0]);
        assert_eq!(level2.translation().unwrap(), &[0.0, 3.0, 1.5, 1.5]);

        let value = serde_json::to_value(&ms).unwrap();
        assert_eq!(value["axes"][0], json!({"name": "c", "type": "channel"}));
        assert_eq!(
            value["axes"][1],
            json!({"name": "z", "type": "space", "unit": "micrometer"})
        );
        assert_eq!(
            value["datasets"][0]["coordinateTransformations"][0]["type"],
            "scale"
        );
    }

    #[tokio::test]
    async fn test_emitter_writes_group_then_attributes() {
        let io = Arc::new(MemoryIOManager::new());
        let emitter = MetadataEmitter::new(io.clone());
        let meta = canonical();
        let plan = PyramidPlan::single_level(&meta.shape());
        let attrs = StoreAttributes::new(
            Multiscale::new("sample", &meta, &plan, json!({})),
            ConversionInfo::new(&meta),
        );

        assert!(read_store_attributes(io.as_ref()).await.unwrap().is_none());
        emitter.emit(&attrs).await.unwrap();
        let back = read_store_attributes(io.as_ref()).await.unwrap().unwrap();
        assert_eq!(back, attrs);
        assert!(io.exists(GROUP_METADATA_KEY).await.unwrap());

        emitter.clear_stale().await.unwrap();
        assert!(!io.exists(ATTRIBUTES_KEY).await.unwrap());
        assert!(!io.exists(GROUP_METADATA_KEY).await.unwrap());
    }
}
