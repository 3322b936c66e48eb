//! PS-OCT reader for NumPy and MATLAB volumes.
//!
//! Inputs are stacked by rank:
//!
//! - one 3-D file is the volume `(z, y, x)`;
//! - 2-D files of one shape become the `x` planes of a `(z, y, x)` volume;
//! - several 3-D files of one shape are channels `(c, z, y, x)`.

use super::cache::TileCache;
use super::{check_region, copy_overlap, extension, stem, Modality};
use crate::error::{ConvertError, Result};
use crate::normalize::SourceMetadata;
use crate::types::DataType;
use crate::volume::{Element, Region, VolumeBuffer, VolumeSource};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use npyz::{DType, NpyFile, Order};
use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct PsOctParams {
    pub inputs: Vec<PathBuf>,
    /// Acquisition description in `Key: value` text form
    pub meta: Option<PathBuf>,
    /// Dataset to read from `.mat` files; the first one when unset
    pub key: Option<String>,
    /// Expected number of polarization channels
    pub polarization_channels: Option<usize>,
}

impl PsOctParams {
    pub fn new(inputs: Vec<PathBuf>) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    pub fn with_meta(mut self, meta: PathBuf) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_polarization_channels(mut self, channels: usize) -> Self {
        self.polarization_channels = Some(channels);
        self
    }
}

/// How input files map onto the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stacking {
    Single,
    Planes,
    Channels,
}

#[derive(Debug, Clone)]
enum Container {
    Npy { fortran: bool },
    #[cfg(feature = "matlab")]
    Mat { dataset: String },
}

#[derive(Debug, Clone)]
struct OctFile {
    path: PathBuf,
    container: Container,
    shape: Vec<usize>,
    data_type: DataType,
}

fn npy_error(path: &Path, err: std::io::Error) -> ConvertError {
    ConvertError::malformed(format!("{}: {}", path.display(), err))
}

fn npy_data_type(path: &Path, dtype: &DType) -> Result<DataType> {
    let DType::Plain(type_str) = dtype else {
        return Err(ConvertError::malformed(format!(
            "{}: structured arrays are not supported",
            path.display()
        )));
    };
    let descr = type_str.to_string();
    // Values are decoded to native order, so big-endian files are fine
    let little = descr.replacen('>', "<", 1);
    if little.ends_with("b1") {
        return Err(ConvertError::malformed(format!(
            "{}: boolean arrays are not supported",
            path.display()
        )));
    }
    DataType::from_zarr_dtype(&little)
        .map_err(|_| ConvertError::malformed(format!("{}: unsupported dtype {}", path.display(), descr)))
}

fn open_npy(path: &Path) -> Result<NpyFile<BufReader<File>>> {
    let file = BufReader::new(File::open(path)?);
    NpyFile::new(file).map_err(|e| npy_error(path, e))
}

impl OctFile {
    fn inspect(path: PathBuf, key: Option<&str>) -> Result<Self> {
        match extension(&path).as_deref() {
            Some("npy") => {
                let npy = open_npy(&path)?;
                let shape = npy.shape().iter().map(|&n| n as usize).collect();
                let data_type = npy_data_type(&path, &npy.dtype())?;
                let fortran = matches!(npy.order(), Order::Fortran);
                Ok(Self {
                    path,
                    container: Container::Npy { fortran },
                    shape,
                    data_type,
                })
            }
            #[cfg(feature = "matlab")]
            Some("mat") => {
                let (dataset, shape, data_type) = mat::inspect(&path, key)?;
                Ok(Self {
                    path,
                    container: Container::Mat { dataset },
                    shape,
                    data_type,
                })
            }
            #[cfg(not(feature = "matlab"))]
            Some("mat") => {
                let _ = key;
                Err(ConvertError::InvalidConfig(format!(
                    "{}: reading .mat files requires the `matlab` feature",
                    path.display()
                )))
            }
            _ => Err(ConvertError::malformed(format!(
                "{}: expected a .npy or .mat file",
                path.display()
            ))),
        }
    }

    fn read(&self) -> Result<VolumeBuffer> {
        let buffer = match &self.container {
            Container::Npy { fortran } => read_npy(&self.path, &self.shape, self.data_type, *fortran)?,
            #[cfg(feature = "matlab")]
            Container::Mat { dataset } => mat::read(&self.path, dataset, &self.shape, self.data_type)?,
        };
        if buffer.shape() != self.shape.as_slice() {
            return Err(ConvertError::malformed(format!(
                "{}: decoded {:?}, header announced {:?}",
                self.path.display(),
                buffer.shape(),
                self.shape
            )));
        }
        Ok(buffer)
    }
}

/// Build a C-ordered array from values stored in C or Fortran order
fn to_array<T: Element>(values: Vec<T>, shape: &[usize], fortran: bool) -> Result<VolumeBuffer> {
    let array = if fortran {
        ArrayD::from_shape_vec(IxDyn(shape).f(), values)
    } else {
        ArrayD::from_shape_vec(IxDyn(shape), values)
    }
    .map_err(|e| ConvertError::malformed(format!("array size mismatch: {}", e)))?;
    Ok(array.as_standard_layout().into_owned().into())
}

fn typed_npy<T, R>(npy: NpyFile<R>, path: &Path, shape: &[usize], fortran: bool) -> Result<VolumeBuffer>
where
    T: Element + npyz::Deserialize,
    R: Read,
{
    let values = npy.into_vec::<T>().map_err(|e| npy_error(path, e))?;
    to_array(values, shape, fortran)
}

fn read_npy(path: &Path, shape: &[usize], data_type: DataType, fortran: bool) -> Result<VolumeBuffer> {
    let npy = open_npy(path)?;
    match data_type {
        DataType::U8 => typed_npy::<u8, _>(npy, path, shape, fortran),
        DataType::U16 => typed_npy::<u16, _>(npy, path, shape, fortran),
        DataType::U32 => typed_npy::<u32, _>(npy, path, shape, fortran),
        DataType::I8 => typed_npy::<i8, _>(npy, path, shape, fortran),
        DataType::I16 => typed_npy::<i16, _>(npy, path, shape, fortran),
        DataType::I32 => typed_npy::<i32, _>(npy, path, shape, fortran),
        DataType::F32 => typed_npy::<f32, _>(npy, path, shape, fortran),
        DataType::F64 => typed_npy::<f64, _>(npy, path, shape, fortran),
    }
}

#[cfg(feature = "matlab")]
mod mat {
    //! MATLAB v7.3 files are HDF5 containers with dimensions stored reversed

    use super::to_array;
    use crate::error::{ConvertError, Result};
    use crate::types::DataType;
    use crate::volume::{Element, VolumeBuffer};
    use hdf5::types::{FloatSize, IntSize, TypeDescriptor};
    use std::path::Path;
    use tracing::warn;

    fn hdf5_error(path: &Path, err: hdf5::Error) -> ConvertError {
        ConvertError::malformed(format!("{}: {}", path.display(), err))
    }

    pub(super) fn inspect(
        path: &Path,
        key: Option<&str>,
    ) -> Result<(String, Vec<usize>, DataType)> {
        let file = hdf5::File::open(path).map_err(|e| hdf5_error(path, e))?;
        // `#refs#` and `#subsystem#` are MATLAB bookkeeping
        let names: Vec<String> = file
            .member_names()
            .map_err(|e| hdf5_error(path, e))?
            .into_iter()
            .filter(|n| !n.starts_with('#'))
            .collect();
        let dataset = match key {
            Some(key) if names.iter().any(|n| n == key) => key.to_string(),
            Some(key) => {
                return Err(ConvertError::malformed(format!(
                    "{}: no variable {:?}; found {:?}",
                    path.display(),
                    key,
                    names
                )))
            }
            None => {
                let first = names.first().cloned().ok_or_else(|| {
                    ConvertError::malformed(format!("{}: no variables", path.display()))
                })?;
                if names.len() > 1 {
                    warn!(path = %path.display(), variable = %first, others = ?&names[1..], "using the first variable");
                }
                first
            }
        };

        let ds = file.dataset(&dataset).map_err(|e| hdf5_error(path, e))?;
        let shape: Vec<usize> = ds.shape().into_iter().rev().collect();
        let descriptor = ds
            .dtype()
            .and_then(|t| t.to_descriptor())
            .map_err(|e| hdf5_error(path, e))?;
        let data_type = match descriptor {
            TypeDescriptor::Unsigned(IntSize::U1) => DataType::U8,
            TypeDescriptor::Unsigned(IntSize::U2) => DataType::U16,
            TypeDescriptor::Unsigned(IntSize::U4) => DataType::U32,
            TypeDescriptor::Integer(IntSize::U1) => DataType::I8,
            TypeDescriptor::Integer(IntSize::U2) => DataType::I16,
            TypeDescriptor::Integer(IntSize::U4) => DataType::I32,
            TypeDescriptor::Float(FloatSize::U4) => DataType::F32,
            TypeDescriptor::Float(FloatSize::U8) => DataType::F64,
            other => {
                return Err(ConvertError::malformed(format!(
                    "{}: unsupported variable type {:?}",
                    path.display(),
                    other
                )))
            }
        };
        Ok((dataset, shape, data_type))
    }

    fn typed<T: Element + hdf5::H5Type>(
        path: &Path,
        ds: &hdf5::Dataset,
        shape: &[usize],
    ) -> Result<VolumeBuffer> {
        let values = ds.read_raw::<T>().map_err(|e| hdf5_error(path, e))?;
        to_array(values, shape, true)
    }

    pub(super) fn read(
        path: &Path,
        dataset: &str,
        shape: &[usize],
        data_type: DataType,
    ) -> Result<VolumeBuffer> {
        let file = hdf5::File::open(path).map_err(|e| hdf5_error(path, e))?;
        let ds = file.dataset(dataset).map_err(|e| hdf5_error(path, e))?;
        match data_type {
            DataType::U8 => typed::<u8>(path, &ds, shape),
            DataType::U16 => typed::<u16>(path, &ds, shape),
            DataType::U32 => typed::<u32>(path, &ds, shape),
            DataType::I8 => typed::<i8>(path, &ds, shape),
            DataType::I16 => typed::<i16>(path, &ds, shape),
            DataType::I32 => typed::<i32>(path, &ds, shape),
            DataType::F32 => typed::<f32>(path, &ds, shape),
            DataType::F64 => typed::<f64>(path, &ds, shape),
        }
    }
}

/// Split `"3.5um"` into `(3.5, "um")`
fn split_quantity(text: &str) -> Option<(f64, String)> {
    let text = text.trim().trim_end_matches('.');
    let end = text
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')))
        .unwrap_or(text.len());
    let value = text[..end].trim().parse().ok()?;
    let unit = text[end..].trim();
    unit.chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == 'µ')
        .then(|| (value, unit.to_string()))
}

fn quantity(key: &str, text: &str) -> Result<(f64, String)> {
    split_quantity(text)
        .ok_or_else(|| ConvertError::malformed(format!("cannot parse {} {:?}", key, text)))
}

/// `<name>` and `<name>Unit` from a `value unit` string
fn insert_quantity(map: &mut Map<String, Value>, key: &str, text: &str, name: &str) -> Result<()> {
    let (value, unit) = quantity(key, text)?;
    map.insert(name.to_string(), json!(value));
    map.insert(format!("{}Unit", name), json!(unit));
    Ok(())
}

/// Micrometres per one `unit`
fn micrometres_per(unit: &str) -> Option<f64> {
    match unit {
        "nm" => Some(1e-3),
        "um" | "µm" | "" => Some(1.0),
        "mm" => Some(1e3),
        "cm" => Some(1e4),
        "m" => Some(1e6),
        _ => None,
    }
}

/// Parse an acquisition description (`Voxel size: 3x3x3um`, ...) into
/// BIDS microscopy fields.
///
/// Lines without a `:` and unknown keys are ignored; a known key whose value
/// does not parse is an error.
pub fn parse_acquisition(text: &str) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    map.insert("BodyPart".into(), json!("BRAIN"));
    map.insert("Environment".into(), json!("exvivo"));
    map.insert("SampleStaining".into(), json!("none"));

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key.to_lowercase().as_str() {
            "image medium" => {
                let medium = value
                    .split_whitespace()
                    .map(|w| if w == "TDE" { "2,2' Thiodiethanol (TDE)" } else { w })
                    .collect::<Vec<_>>()
                    .join(" ");
                map.insert("SampleMedium".into(), json!(medium));
            }
            "center wavelength" => insert_quantity(&mut map, key, value, "Wavelength")?,
            "axial resolution" => insert_quantity(&mut map, key, value, "ResolutionAxial")?,
            "lateral resolution" => {
                insert_quantity(&mut map, key, value, "ResolutionLateral")?
            },
            "depth focus range" => insert_quantity(&mut map, key, value, "DepthFocusRange")?,
            "voxel size" => {
                let parts = value
                    .split(['x', 'X'])
                    .map(|p| quantity(key, p))
                    .collect::<Result<Vec<_>>>()?;
                if parts.len() != 3 {
                    return Err(ConvertError::malformed(format!(
                        "voxel size {:?} must list three values",
                        value
                    )));
                }
                let sizes: Vec<f64> = parts.iter().map(|(v, _)| *v).collect();
                let unit = parts.last().map(|(_, u)| u.clone()).unwrap_or_default();
                map.insert("PixelSize".into(), json!(sizes));
                map.insert("PixelSizeUnits".into(), json!(unit));
            }
            "number of focuses" => {
                let (count, _) = quantity(key, value)?;
                map.insert("FocusCount".into(), json!(count as i64));
            }
            "number of slices" => {
                let (count, _) = quantity(key, value)?;
                map.insert("SliceCount".into(), json!(count as i64));
            }
            "slice thickness" => {
                let (thickness, unit) = quantity(key, value)?;
                let scale = micrometres_per(&unit).ok_or_else(|| {
                    ConvertError::malformed(format!("unknown slice thickness unit {:?}", unit))
                })?;
                map.insert("SliceThickness".into(), json!(thickness * scale));
                map.insert("SliceThicknessUnits".into(), json!("um"));
            }
            "modality" => {
                map.insert("OCTModality".into(), json!(value));
            }
            _ => {}
        }
    }
    Ok(map)
}

pub struct PsOctReader {
    params: PsOctParams,
    files: Vec<OctFile>,
    stacking: Stacking,
    data_type: DataType,
    shape: Vec<usize>,
    acquisition: Option<Map<String, Value>>,
    cache: TileCache<usize>,
}

impl PsOctReader {
    pub fn open(params: PsOctParams, cache_capacity: usize) -> Result<Self> {
        if params.inputs.is_empty() {
            return Err(ConvertError::InvalidConfig(
                "PS-OCT conversion needs at least one input file".to_string(),
            ));
        }
        let files = params
            .inputs
            .iter()
            .cloned()
            .map(|p| OctFile::inspect(p, params.key.as_deref()))
            .collect::<Result<Vec<_>>>()?;

        let first = &files[0];
        for file in &files[1..] {
            if file.shape.len() != first.shape.len() {
                return Err(ConvertError::malformed(format!(
                    "{} is {}-D but {} is {}-D",
                    file.path.display(),
                    file.shape.len(),
                    first.path.display(),
                    first.shape.len()
                )));
            }
            if file.shape != first.shape {
                return Err(ConvertError::malformed(format!(
                    "{} has shape {:?} but {} has {:?}",
                    file.path.display(),
                    file.shape,
                    first.path.display(),
                    first.shape
                )));
            }
            if file.data_type != first.data_type {
                return Err(ConvertError::malformed(format!(
                    "{} holds {} samples but {} holds {}",
                    file.path.display(),
                    file.data_type,
                    first.path.display(),
                    first.data_type
                )));
            }
        }

        let count = files.len();
        let (stacking, shape) = match first.shape.as_slice() {
            [z, y] => (Stacking::Planes, vec![*z, *y, count]),
            [z, y, x] if count == 1 => (Stacking::Single, vec![*z, *y, *x]),
            [z, y, x] => (Stacking::Channels, vec![count, *z, *y, *x]),
            other => {
                return Err(ConvertError::malformed(format!(
                    "{}: expected a 2-D or 3-D array, found shape {:?}",
                    first.path.display(),
                    other
                )))
            }
        };
        if let Some(expected) = params.polarization_channels {
            let found = if stacking == Stacking::Channels { count } else { 1 };
            if found != expected {
                return Err(ConvertError::malformed(format!(
                    "expected {} polarization channels, inputs provide {}",
                    expected, found
                )));
            }
        }

        let acquisition = match &params.meta {
            Some(path) => Some(parse_acquisition(&std::fs::read_to_string(path)?)?),
            None => None,
        };
        let data_type = first.data_type;
        info!(
            files = count,
            stacking = ?stacking,
            shape = ?shape,
            %data_type,
            "opened PS-OCT inputs"
        );

        Ok(Self {
            params,
            files,
            stacking,
            data_type,
            shape,
            acquisition,
            cache: TileCache::new(cache_capacity),
        })
    }

    pub fn modality(&self) -> Modality {
        Modality::PsOct
    }

    pub fn stacking(&self) -> Stacking {
        self.stacking
    }

    pub fn name(&self) -> String {
        stem(&self.params.inputs[0])
    }

    /// Parsed acquisition description, if one was given
    pub fn acquisition(&self) -> Option<&Map<String, Value>> {
        self.acquisition.as_ref()
    }

    /// Volume region covered by file `index`
    fn placement(&self, index: usize) -> Region {
        match self.stacking {
            Stacking::Single => Region::full(&self.shape),
            Stacking::Planes => {
                Region::new(vec![0, 0, index], vec![self.shape[0], self.shape[1], 1])
            }
            Stacking::Channels => {
                let mut shape = self.shape.clone();
                shape[0] = 1;
                Region::new(vec![index, 0, 0, 0], shape)
            }
        }
    }

    fn load(&self, index: usize) -> Result<VolumeBuffer> {
        let file = &self.files[index];
        debug!(path = %file.path.display(), "decoding file");
        let buffer = file.read()?;
        Ok(match self.stacking {
            Stacking::Single => buffer,
            Stacking::Planes => buffer.insert_axis(2),
            Stacking::Channels => buffer.insert_axis(0),
        })
    }

    fn files_in(&self, region: &Region) -> std::ops::Range<usize> {
        match self.stacking {
            Stacking::Single => 0..1,
            Stacking::Planes => region.start[2]..region.start[2] + region.shape[2],
            Stacking::Channels => region.start[0]..region.start[0] + region.shape[0],
        }
    }

    pub fn source_metadata(&self) -> SourceMetadata {
        let axes = match self.stacking {
            Stacking::Channels => "czyx",
            _ => "zyx",
        };
        let mut metadata = SourceMetadata::new(Modality::PsOct.tag(), axes);
        if self.stacking == Stacking::Channels {
            metadata = metadata.with_channel_names(self.params.inputs.iter().map(|p| stem(p)).collect());
        }
        let Some(acquisition) = &self.acquisition else {
            return metadata;
        };

        // PixelSize follows array order: z, y, x
        if let Some(sizes) = acquisition.get("PixelSize").and_then(Value::as_array) {
            for (axis, size) in ['z', 'y', 'x'].into_iter().zip(sizes) {
                if let Some(size) = size.as_f64() {
                    metadata = metadata.with_spacing(axis, size);
                }
            }
        }
        if let Some(unit) = acquisition
            .get("PixelSizeUnits")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
        {
            metadata = metadata.with_unit(unit);
        }
        for (key, value) in acquisition {
            metadata = metadata.with_attribute(key.clone(), value.clone());
        }
        metadata
    }

    /// The acquisition description as a sidecar document
    pub fn sidecar(&self) -> Option<Value> {
        self.acquisition.clone().map(Value::Object)
    }
}

impl VolumeSource for PsOctReader {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn read_region(&self, region: &Region) -> Result<VolumeBuffer> {
        check_region(region, &self.shape)?;
        let mut out = VolumeBuffer::zeros(self.data_type, &region.shape);
        for index in self.files_in(region) {
            let samples = self.cache.get_or_load(&index, || self.load(index))?;
            copy_overlap(&mut out, region, &samples, &self.placement(index))?;
        }
        Ok(out)
    }
}
