//! Format readers for the supported acquisition modalities

pub mod cache;
pub mod darkfield;
pub(crate) mod image;
pub mod lightsheet;
pub mod psoct;

use crate::error::{ConvertError, Result};
use crate::normalize::{CanonicalMetadata, SourceMetadata};
use crate::volume::{Region, VolumeBuffer, VolumeSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use darkfield::{DarkFieldParams, DarkFieldReader};
pub use lightsheet::{LightSheetParams, LightSheetReader};
pub use psoct::{PsOctParams, PsOctReader};

/// Acquisition modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    DarkField,
    LightSheet,
    PsOct,
}

impl Modality {
    /// Tag recorded in the store attributes
    pub fn tag(&self) -> &'static str {
        match self {
            Modality::DarkField => "darkfield",
            Modality::LightSheet => "lightsheet",
            Modality::PsOct => "psoct",
        }
    }

    /// Infer the modality from input paths
    pub fn detect(inputs: &[PathBuf]) -> Result<Self> {
        if inputs.is_empty() {
            return Err(ConvertError::InvalidConfig("no input given".to_string()));
        }
        if let [single] = inputs {
            if single.is_dir() {
                return if lightsheet::contains_tiles(single)? {
                    Ok(Modality::LightSheet)
                } else {
                    Err(ConvertError::malformed(format!(
                        "{} holds no *_zNN_yNN*.tif tiles",
                        single.display()
                    )))
                };
            }
        }

        let mut found = None;
        for path in inputs {
            let modality = match extension(path).as_deref() {
                Some("npy" | "mat") => Modality::PsOct,
                Some("png" | "tif" | "tiff") => Modality::DarkField,
                _ => {
                    return Err(ConvertError::malformed(format!(
                        "cannot infer the modality of {}",
                        path.display()
                    )))
                }
            };
            match found {
                None => found = Some(modality),
                Some(previous) if previous != modality => {
                    return Err(ConvertError::malformed(format!(
                        "inputs mix {} and {} files",
                        previous, modality
                    )))
                }
                Some(_) => {}
            }
        }
        found.ok_or_else(|| ConvertError::InvalidConfig("no input given".to_string()))
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Lower-cased file extension
pub(crate) fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// File stem as a string
pub(crate) fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Inputs of a reader, one variant per modality
#[derive(Debug, Clone)]
pub enum ReaderParams {
    DarkField(DarkFieldParams),
    LightSheet(LightSheetParams),
    PsOct(PsOctParams),
}

impl ReaderParams {
    /// Default parameters for `inputs` of a detected modality
    pub fn detect(inputs: &[PathBuf]) -> Result<Self> {
        Ok(match Modality::detect(inputs)? {
            Modality::DarkField => ReaderParams::DarkField(DarkFieldParams::new(inputs.to_vec())),
            Modality::LightSheet => {
                ReaderParams::LightSheet(LightSheetParams::new(inputs[0].clone()))
            }
            Modality::PsOct => ReaderParams::PsOct(PsOctParams::new(inputs.to_vec())),
        })
    }

    pub fn modality(&self) -> Modality {
        match self {
            ReaderParams::DarkField(_) => Modality::DarkField,
            ReaderParams::LightSheet(_) => Modality::LightSheet,
            ReaderParams::PsOct(_) => Modality::PsOct,
        }
    }
}

/// An opened input of any modality
#[derive(Clone)]
pub enum FormatReader {
    DarkField(Arc<DarkFieldReader>),
    LightSheet(Arc<LightSheetReader>),
    PsOct(Arc<PsOctReader>),
}

impl FormatReader {
    /// Open and validate the input. Only headers are read here.
    pub fn open(params: ReaderParams, cache_capacity: usize) -> Result<Self> {
        Ok(match params {
            ReaderParams::DarkField(p) => {
                FormatReader::DarkField(Arc::new(DarkFieldReader::open(p, cache_capacity)?))
            }
            ReaderParams::LightSheet(p) => {
                FormatReader::LightSheet(Arc::new(LightSheetReader::open(p, cache_capacity)?))
            }
            ReaderParams::PsOct(p) => {
                FormatReader::PsOct(Arc::new(PsOctReader::open(p, cache_capacity)?))
            }
        })
    }

    pub fn modality(&self) -> Modality {
        match self {
            FormatReader::DarkField(_) => Modality::DarkField,
            FormatReader::LightSheet(_) => Modality::LightSheet,
            FormatReader::PsOct(_) => Modality::PsOct,
        }
    }

    /// The decoded volume, in the reader's axis order
    pub fn source(&self) -> Arc<dyn VolumeSource> {
        match self {
            FormatReader::DarkField(r) => r.clone(),
            FormatReader::LightSheet(r) => r.clone(),
            FormatReader::PsOct(r) => r.clone(),
        }
    }

    pub fn source_metadata(&self) -> SourceMetadata {
        match self {
            FormatReader::DarkField(r) => r.source_metadata(),
            FormatReader::LightSheet(r) => r.source_metadata(),
            FormatReader::PsOct(r) => r.source_metadata(),
        }
    }

    /// Name of the image in the `multiscales` metadata
    pub fn name(&self) -> String {
        match self {
            FormatReader::DarkField(r) => r.name(),
            FormatReader::LightSheet(r) => r.name(),
            FormatReader::PsOct(r) => r.name(),
        }
    }

    /// JSON sidecar written next to the store, if the modality has one
    pub fn sidecar(&self, metadata: &CanonicalMetadata) -> Option<Value> {
        match self {
            FormatReader::DarkField(r) => Some(r.sidecar(metadata)),
            FormatReader::LightSheet(_) => None,
            FormatReader::PsOct(r) => r.sidecar(),
        }
    }
}

/// Copy the part of `unit` (placed at `placement` in volume coordinates)
/// that falls inside `region` into `out`, which holds `region`.
pub(crate) fn copy_overlap(
    out: &mut VolumeBuffer,
    region: &Region,
    unit: &VolumeBuffer,
    placement: &Region,
) -> Result<()> {
    let Some(overlap) = placement.intersect(region) else {
        return Ok(());
    };
    let values = unit.extract(&overlap.relative_to(&placement.start))?;
    out.assign(&overlap.relative_to(&region.start), &values)
}

/// Reject regions that do not lie inside `shape`
pub(crate) fn check_region(region: &Region, shape: &[usize]) -> Result<()> {
    if region.fits_in(shape) {
        Ok(())
    } else {
        Err(ConvertError::Internal(format!(
            "region {} outside volume of shape {:?}",
            region, shape
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;
    use tempfile::TempDir;

    #[test]
    fn test_detect_by_extension() {
        let npy = vec![PathBuf::from("a.npy"), PathBuf::from("b.NPY")];
        assert_eq!(Modality::detect(&npy).unwrap(), Modality::PsOct);

        let slices = vec![PathBuf::from("s1.png"), PathBuf::from("s2.tif")];
        assert_eq!(Modality::detect(&slices).unwrap(), Modality::DarkField);

        let mixed = vec![PathBuf::from("s1.png"), PathBuf::from("v.npy")];
        assert!(matches!(
            Modality::detect(&mixed),
            Err(ConvertError::MalformedInput(_))
        ));
        assert!(Modality::detect(&[PathBuf::from("notes.txt")]).is_err());
    }

    #[test]
    fn test_detect_mosaic_directory() {
        let dir = TempDir::new().unwrap();
        assert!(Modality::detect(&[dir.path().to_path_buf()]).is_err());
        std::fs::write(dir.path().join("run_z01_y01.tif"), b"").unwrap();
        assert_eq!(
            Modality::detect(&[dir.path().to_path_buf()]).unwrap(),
            Modality::LightSheet
        );
    }

    #[test]
    fn test_copy_overlap() {
        let mut out = VolumeBuffer::zeros(DataType::U8, &[4, 4]);
        let region = Region::new(vec![2, 2], vec![4, 4]);
        let unit = VolumeBuffer::from(ndarray::ArrayD::from_elem(ndarray::IxDyn(&[3, 3]), 5u8));
        let placement = Region::new(vec![0, 0], vec![3, 3]);
        copy_overlap(&mut out, &region, &unit, &placement).unwrap();
        let values = out.to_f64_vec();
        assert_eq!(values[0], 5.0);
        assert_eq!(values.iter().filter(|&&v| v == 5.0).count(), 1);
    }
}
