//! Dark-field multi-slice reader.
//!
//! Each input is one 2-D section (PNG or single-page TIFF). Sections are
//! stacked along `z` in input order and centred on a canvas as large as the
//! largest section; the border is zero. RGB sections add a leading channel
//! axis.

use super::cache::TileCache;
use super::image::{
    inspect_png, inspect_tiff, read_png, read_tiff_pages, tiff_spacing, PixelFormat, PixelSpacing,
    TiffInfo,
};
use super::{check_region, copy_overlap, extension, stem, Modality};
use crate::error::{ConvertError, Result};
use crate::normalize::{short_unit, CanonicalMetadata, SourceMetadata};
use crate::types::DataType;
use crate::volume::{Region, VolumeBuffer, VolumeSource};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct DarkFieldParams {
    /// Section images, top to bottom
    pub inputs: Vec<PathBuf>,
    /// Physical thickness of one section
    pub slice_thickness: Option<f64>,
    pub staining: Option<String>,
}

impl DarkFieldParams {
    pub fn new(inputs: Vec<PathBuf>) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    pub fn with_slice_thickness(mut self, thickness: f64) -> Self {
        self.slice_thickness = Some(thickness);
        self
    }

    pub fn with_staining(mut self, staining: impl Into<String>) -> Self {
        self.staining = Some(staining.into());
        self
    }
}

#[derive(Debug, Clone)]
enum SliceFile {
    Png,
    Tiff(TiffInfo),
}

#[derive(Debug, Clone)]
struct Slice {
    path: PathBuf,
    file: SliceFile,
    height: usize,
    width: usize,
    format: PixelFormat,
    spacing: PixelSpacing,
}

impl Slice {
    fn inspect(path: PathBuf) -> Result<Self> {
        match extension(&path).as_deref() {
            Some("png") => {
                let info = inspect_png(&path)?;
                Ok(Self {
                    path,
                    file: SliceFile::Png,
                    height: info.height,
                    width: info.width,
                    format: info.format,
                    spacing: info.spacing,
                })
            }
            Some("tif" | "tiff") => {
                let info = inspect_tiff(&path)?;
                if info.pages != 1 {
                    return Err(ConvertError::malformed(format!(
                        "{}: expected a single-page section, found {} pages",
                        path.display(),
                        info.pages
                    )));
                }
                Ok(Self {
                    height: info.height,
                    width: info.width,
                    format: info.format,
                    spacing: tiff_spacing(&info),
                    file: SliceFile::Tiff(info),
                    path,
                })
            }
            _ => Err(ConvertError::malformed(format!(
                "{}: sections must be PNG or TIFF images",
                path.display()
            ))),
        }
    }

    /// Decoded samples as `[channels, height, width]`
    fn decode(&self) -> Result<VolumeBuffer> {
        match &self.file {
            SliceFile::Png => read_png(&self.path),
            SliceFile::Tiff(info) => read_tiff_pages(&self.path, info)?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    ConvertError::malformed(format!("{}: no image data", self.path.display()))
                }),
        }
    }
}

pub struct DarkFieldReader {
    params: DarkFieldParams,
    slices: Vec<Slice>,
    channels: usize,
    data_type: DataType,
    shape: Vec<usize>,
    /// In-plane spacing embedded in the first section
    spacing: PixelSpacing,
    cache: TileCache<usize>,
}

impl DarkFieldReader {
    /// Inspect every section and lay out the stacked volume
    pub fn open(params: DarkFieldParams, cache_capacity: usize) -> Result<Self> {
        if params.inputs.is_empty() {
            return Err(ConvertError::InvalidConfig(
                "dark-field conversion needs at least one section".to_string(),
            ));
        }
        let slices = params
            .inputs
            .iter()
            .cloned()
            .map(Slice::inspect)
            .collect::<Result<Vec<_>>>()?;

        let first = &slices[0];
        for slice in &slices[1..] {
            if slice.format.channels != first.format.channels {
                return Err(ConvertError::malformed(format!(
                    "{} has {} channels, {} has {}",
                    slice.path.display(),
                    slice.format.channels,
                    first.path.display(),
                    first.format.channels
                )));
            }
            if slice.format.data_type != first.format.data_type {
                return Err(ConvertError::malformed(format!(
                    "{} holds {} samples, {} holds {}",
                    slice.path.display(),
                    slice.format.data_type,
                    first.path.display(),
                    first.format.data_type
                )));
            }
        }

        let spacing = first.spacing.clone();
        if let Some(other) = slices[1..].iter().find(|s| s.spacing != spacing) {
            warn!(
                first = %first.path.display(),
                other = %other.path.display(),
                "sections embed different pixel sizes; using the first"
            );
        }

        let channels = first.format.channels;
        let data_type = first.format.data_type;
        let height = slices.iter().map(|s| s.height).max().unwrap_or(0);
        let width = slices.iter().map(|s| s.width).max().unwrap_or(0);
        let mut shape = vec![slices.len(), height, width];
        if channels > 1 {
            shape.insert(0, channels);
        }
        info!(
            sections = slices.len(),
            channels,
            %data_type,
            height,
            width,
            "opened dark-field sections"
        );

        Ok(Self {
            params,
            slices,
            channels,
            data_type,
            shape,
            spacing,
            cache: TileCache::new(cache_capacity),
        })
    }

    pub fn modality(&self) -> Modality {
        Modality::DarkField
    }

    pub fn num_slices(&self) -> usize {
        self.slices.len()
    }

    pub fn name(&self) -> String {
        stem(&self.params.inputs[0])
    }

    fn has_channels(&self) -> bool {
        self.channels > 1
    }

    /// Where section `z` sits in the volume
    fn placement(&self, z: usize) -> Region {
        let slice = &self.slices[z];
        let (height, width) = (self.shape[self.shape.len() - 2], self.shape[self.shape.len() - 1]);
        let mut start = vec![z, (height - slice.height) / 2, (width - slice.width) / 2];
        let mut extent = vec![1, slice.height, slice.width];
        if self.has_channels() {
            start.insert(0, 0);
            extent.insert(0, self.channels);
        }
        Region::new(start, extent)
    }

    fn load(&self, z: usize) -> Result<VolumeBuffer> {
        let slice = &self.slices[z];
        debug!(path = %slice.path.display(), z, "decoding section");
        let planes = slice.decode()?;
        if planes.shape() != [slice.format.channels, slice.height, slice.width] {
            return Err(ConvertError::malformed(format!(
                "{}: decoded {:?}, header announced {}x{}",
                slice.path.display(),
                planes.shape(),
                slice.width,
                slice.height
            )));
        }
        // [c, h, w] -> [c, 1, h, w] or [1, h, w]
        Ok(if self.has_channels() {
            planes.insert_axis(1)
        } else {
            planes
        })
    }

    pub fn source_metadata(&self) -> SourceMetadata {
        let axes = if self.has_channels() { "czyx" } else { "zyx" };
        // Sections are one unit thick unless told otherwise
        let mut metadata = SourceMetadata::new(Modality::DarkField.tag(), axes)
            .unpooled('z')
            .with_spacing('z', self.params.slice_thickness.unwrap_or(1.0));
        for (axis, value) in [('y', self.spacing.y), ('x', self.spacing.x)] {
            if let Some(value) = value {
                metadata = metadata.with_spacing(axis, value);
            }
        }
        if let Some(unit) = &self.spacing.unit {
            metadata = metadata.with_unit(unit.clone());
        }
        if let Some(staining) = &self.params.staining {
            metadata = metadata.with_attribute("SampleStaining", json!(staining));
        }
        if self.has_channels() {
            metadata = metadata.with_channel_names(vec![
                "red".to_string(),
                "green".to_string(),
                "blue".to_string(),
            ]);
        }
        metadata.with_attribute(
            "Sections",
            Value::Array(
                self.slices
                    .iter()
                    .map(|s| json!(s.path.file_name().map(|n| n.to_string_lossy())))
                    .collect(),
            ),
        )
    }

    /// Acquisition sidecar in BIDS microscopy terms
    pub fn sidecar(&self, metadata: &CanonicalMetadata) -> Value {
        let mut sidecar = Map::new();
        let axis_unit = |name| {
            metadata
                .axis(name)
                .and_then(|a| a.unit.as_deref())
                .map(short_unit)
        };
        if let (Some(y), Some(x)) = (metadata.axis('y'), metadata.axis('x')) {
            sidecar.insert("PixelSize".into(), json!([y.scale, x.scale]));
            if let Some(unit) = axis_unit('x') {
                sidecar.insert("PixelSizeUnits".into(), json!(unit));
            }
        }
        if let Some(z) = metadata.axis('z') {
            sidecar.insert("SliceThickness".into(), json!(z.scale));
            if let Some(unit) = axis_unit('z') {
                sidecar.insert("SliceThicknessUnits".into(), json!(unit));
            }
        }
        if let Some(staining) = &self.params.staining {
            sidecar.insert("SampleStaining".into(), json!(staining));
        }
        Value::Object(sidecar)
    }
}

impl VolumeSource for DarkFieldReader {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn read_region(&self, region: &Region) -> Result<VolumeBuffer> {
        check_region(region, &self.shape)?;
        let z_axis = usize::from(self.has_channels());
        let mut out = VolumeBuffer::zeros(self.data_type, &region.shape);
        let z_range = region.start[z_axis]..region.start[z_axis] + region.shape[z_axis];
        for z in z_range {
            let section = self.cache.get_or_load(&z, || self.load(z))?;
            copy_overlap(&mut out, region, &section, &self.placement(z))?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConvertConfig;
    use crate::formats::image::tests::{
        write_gray16_tiff, write_gray16_tiff_per_cm, write_png, write_png_with_density,
    };
    use crate::normalize::normalize;
    use tempfile::TempDir;

    fn grey_png(dir: &TempDir, name: &str, width: u32, height: u32, value: u8) -> PathBuf {
        let path = dir.path().join(name);
        let data = vec![value; (width * height) as usize];
        write_png(
            &path,
            width,
            height,
            png::ColorType::Grayscale,
            png::BitDepth::Eight,
            &data,
        );
        path
    }

    #[test]
    fn test_sections_are_centred() {
        let dir = TempDir::new().unwrap();
        let inputs = vec![
            grey_png(&dir, "s1.png", 4, 4, 10),
            grey_png(&dir, "s2.png", 2, 3, 20),
        ];
        let reader = DarkFieldReader::open(DarkFieldParams::new(inputs), 4).unwrap();
        assert_eq!(reader.shape(), &[2, 4, 4]);
        assert_eq!(reader.data_type(), DataType::U8);

        let second = reader
            .read_region(&Region::new(vec![1, 0, 0], vec![1, 4, 4]))
            .unwrap()
            .to_f64_vec();
        // 3 rows tall -> offset 0, 2 wide -> offset 1
        #[rustfmt::skip]
        let expected = vec![
            0.0, 20.0, 20.0, 0.0,
            0.0, 20.0, 20.0, 0.0,
            0.0, 20.0, 20.0, 0.0,
            0.0, 0.0, 0.0, 0.0,
        ];
        assert_eq!(second, expected);

        let first = reader
            .read_region(&Region::new(vec![0, 1, 1], vec![1, 2, 2]))
            .unwrap();
        assert_eq!(first.to_f64_vec(), vec![10.0; 4]);
    }

    #[test]
    fn test_rgb_sections_add_channel_axis() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rgb.png");
        write_png(
            &path,
            1,
            1,
            png::ColorType::Rgb,
            png::BitDepth::Eight,
            &[1, 2, 3],
        );
        let reader = DarkFieldReader::open(DarkFieldParams::new(vec![path]), 1).unwrap();
        assert_eq!(reader.shape(), &[3, 1, 1, 1]);
        let all = reader.read_region(&Region::full(&[3, 1, 1, 1])).unwrap();
        assert_eq!(all.to_f64_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(reader.source_metadata().axes, vec!['c', 'z', 'y', 'x']);
    }

    #[test]
    fn test_mixed_sample_types_rejected() {
        let dir = TempDir::new().unwrap();
        let png = grey_png(&dir, "a.png", 2, 2, 1);
        let tif = dir.path().join("b.tif");
        write_gray16_tiff(&tif, 2, 2, &[vec![1, 2, 3, 4]]);
        let err = DarkFieldReader::open(DarkFieldParams::new(vec![png, tif]), 2)
            .err()
            .unwrap();
        assert!(matches!(err, ConvertError::MalformedInput(_)));
    }

    #[test]
    fn test_multi_page_tiff_rejected() {
        let dir = TempDir::new().unwrap();
        let tif = dir.path().join("stack.tif");
        write_gray16_tiff(&tif, 2, 2, &[vec![0; 4], vec![0; 4]]);
        assert!(DarkFieldReader::open(DarkFieldParams::new(vec![tif]), 2).is_err());
    }

    #[test]
    fn test_metadata_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let inputs = vec![grey_png(&dir, "s1.png", 2, 2, 1)];
        let params = DarkFieldParams::new(inputs)
            .with_slice_thickness(50.0)
            .with_staining("Nissl");
        let reader = DarkFieldReader::open(params, 2).unwrap();
        let source = reader.source_metadata();
        assert_eq!(source.unpooled, vec!['z']);

        let config = ConvertConfig::default().with_voxel_size(vec![2.5, 2.5]);
        let meta = normalize(reader.shape(), reader.data_type(), &source, &config).unwrap();
        assert_eq!(meta.voxel_size(), vec![50.0, 2.5, 2.5]);
        assert!(!meta.axis('z').unwrap().pooled);

        let sidecar = reader.sidecar(&meta);
        assert_eq!(sidecar["PixelSize"], json!([2.5, 2.5]));
        assert_eq!(sidecar["PixelSizeUnits"], json!("um"));
        assert_eq!(sidecar["SliceThickness"], json!(50.0));
        assert_eq!(sidecar["SampleStaining"], json!("Nissl"));
    }

    #[test]
    fn test_missing_pixel_size() {
        let dir = TempDir::new().unwrap();
        let reader =
            DarkFieldReader::open(DarkFieldParams::new(vec![grey_png(&dir, "s.png", 2, 2, 1)]), 1)
                .unwrap();
        let err = normalize(
            reader.shape(),
            reader.data_type(),
            &reader.source_metadata(),
            &ConvertConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConvertError::MissingMetadata(_)));
    }

    #[test]
    fn test_embedded_pixel_size() {
        let dir = TempDir::new().unwrap();
        let png_path = dir.path().join("s1.png");
        write_png_with_density(
            &png_path,
            2,
            2,
            png::ColorType::Grayscale,
            png::BitDepth::Eight,
            Some(400_000),
            &[1, 2, 3, 4],
        );
        let reader = DarkFieldReader::open(DarkFieldParams::new(vec![png_path]), 1).unwrap();
        let meta = normalize(
            reader.shape(),
            reader.data_type(),
            &reader.source_metadata(),
            &ConvertConfig::default(),
        )
        .unwrap();
        // No slice thickness given: one unit per section
        assert_eq!(meta.voxel_size(), vec![1.0, 2.5, 2.5]);
        assert_eq!(meta.axis('x').unwrap().unit.as_deref(), Some("micrometer"));

        let tif_path = dir.path().join("s2.tif");
        write_gray16_tiff_per_cm(&tif_path, 2, 2, 2000, &[1, 2, 3, 4]);
        let params = DarkFieldParams::new(vec![tif_path]).with_slice_thickness(40.0);
        let reader = DarkFieldReader::open(params, 1).unwrap();
        let meta = normalize(
            reader.shape(),
            reader.data_type(),
            &reader.source_metadata(),
            &ConvertConfig::default(),
        )
        .unwrap();
        assert_eq!(meta.voxel_size(), vec![40.0, 5.0, 5.0]);

        // Configuration wins over the header
        let config = ConvertConfig::default().with_voxel_size(vec![0.5, 0.5]);
        let meta = normalize(reader.shape(), reader.data_type(), &reader.source_metadata(), &config)
            .unwrap();
        assert_eq!(meta.voxel_size(), vec![40.0, 0.5, 0.5]);
    }
}
