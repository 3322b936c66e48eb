//! In-memory volume representation: regions, typed sample buffers and sources

use crate::error::{ConvertError, Result};
use crate::types::DataType;
use ndarray::{ArrayD, IxDyn, Slice};
use num_traits::{ToPrimitive, Zero};
use std::fmt;

/// An axis-aligned box of samples, `[start, start + shape)` along every axis
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    pub start: Vec<usize>,
    pub shape: Vec<usize>,
}

impl Region {
    pub fn new(start: Vec<usize>, shape: Vec<usize>) -> Self {
        debug_assert_eq!(start.len(), shape.len());
        Self { start, shape }
    }

    /// Region covering a whole array of the given shape
    pub fn full(shape: &[usize]) -> Self {
        Self::new(vec![0; shape.len()], shape.to_vec())
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Exclusive end coordinate along every axis
    pub fn end(&self) -> Vec<usize> {
        self.start
            .iter()
            .zip(&self.shape)
            .map(|(s, n)| s + n)
            .collect()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.shape.iter().any(|&n| n == 0)
    }

    /// Overlap of two regions, `None` if they are disjoint
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let mut start = Vec::with_capacity(self.ndim());
        let mut shape = Vec::with_capacity(self.ndim());
        for axis in 0..self.ndim() {
            let lo = self.start[axis].max(other.start[axis]);
            let hi = (self.start[axis] + self.shape[axis])
                .min(other.start[axis] + other.shape[axis]);
            if hi <= lo {
                return None;
            }
            start.push(lo);
            shape.push(hi - lo);
        }
        Some(Region::new(start, shape))
    }

    /// Express this region relative to `origin`, which must not exceed `start`
    pub fn relative_to(&self, origin: &[usize]) -> Region {
        Region::new(
            self.start.iter().zip(origin).map(|(s, o)| s - o).collect(),
            self.shape.clone(),
        )
    }

    /// Reorder axes: axis `i` of the result is axis `permutation[i]` of `self`
    pub fn permuted(&self, permutation: &[usize]) -> Region {
        Region::new(
            permutation.iter().map(|&p| self.start[p]).collect(),
            permutation.iter().map(|&p| self.shape[p]).collect(),
        )
    }

    /// Inverse of [`Region::permuted`]
    pub fn unpermuted(&self, permutation: &[usize]) -> Region {
        let mut start = vec![0; self.ndim()];
        let mut shape = vec![0; self.ndim()];
        for (i, &p) in permutation.iter().enumerate() {
            start[p] = self.start[i];
            shape[p] = self.shape[i];
        }
        Region::new(start, shape)
    }

    /// Check that the region lies inside an array of the given shape
    pub fn fits_in(&self, shape: &[usize]) -> bool {
        shape.len() == self.ndim() && self.end().iter().zip(shape).all(|(e, n)| e <= n)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .start
            .iter()
            .zip(&self.shape)
            .map(|(s, n)| format!("{}..{}", s, s + n))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// A numeric sample type that can be stored in a converted volume
pub trait Element:
    Copy + Default + PartialEq + fmt::Debug + Send + Sync + ToPrimitive + Zero + 'static
{
    const DATA_TYPE: DataType;

    /// Convert an averaged value back to the sample type.
    ///
    /// Integer types round half away from zero and saturate at their range.
    fn from_mean(mean: f64) -> Self;

    /// Append the little-endian encoding of this sample
    fn write_le(self, out: &mut Vec<u8>);

    /// Decode a sample from exactly `size_of::<Self>()` little-endian bytes
    fn read_le(bytes: &[u8]) -> Self;

    fn into_buffer(array: ArrayD<Self>) -> VolumeBuffer;

    fn buffer_ref(buffer: &VolumeBuffer) -> Option<&ArrayD<Self>>;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident, $int:expr) => {
        impl Element for $t {
            const DATA_TYPE: DataType = DataType::$variant;

            fn from_mean(mean: f64) -> Self {
                if $int {
                    mean.round().clamp(<$t>::MIN as f64, <$t>::MAX as f64) as $t
                } else {
                    mean as $t
                }
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_le_bytes(raw)
            }

            fn into_buffer(array: ArrayD<Self>) -> VolumeBuffer {
                VolumeBuffer::$variant(array)
            }

            fn buffer_ref(buffer: &VolumeBuffer) -> Option<&ArrayD<Self>> {
                match buffer {
                    VolumeBuffer::$variant(array) => Some(array),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(u8, U8, true);
impl_element!(u16, U16, true);
impl_element!(u32, U32, true);
impl_element!(i8, I8, true);
impl_element!(i16, I16, true);
impl_element!(i32, I32, true);
impl_element!(f32, F32, false);
impl_element!(f64, F64, false);

/// A dense n-dimensional block of samples of one data type
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeBuffer {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    I8(ArrayD<i8>),
    I16(ArrayD<i16>),
    I32(ArrayD<i32>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

/// Apply a generic expression to the array inside a buffer, keeping its variant
macro_rules! map_buffer {
    ($buffer:expr, $array:ident => $body:expr) => {
        match $buffer {
            VolumeBuffer::U8($array) => VolumeBuffer::U8($body),
            VolumeBuffer::U16($array) => VolumeBuffer::U16($body),
            VolumeBuffer::U32($array) => VolumeBuffer::U32($body),
            VolumeBuffer::I8($array) => VolumeBuffer::I8($body),
            VolumeBuffer::I16($array) => VolumeBuffer::I16($body),
            VolumeBuffer::I32($array) => VolumeBuffer::I32($body),
            VolumeBuffer::F32($array) => VolumeBuffer::F32($body),
            VolumeBuffer::F64($array) => VolumeBuffer::F64($body),
        }
    };
}

/// Evaluate a generic expression over the array inside a buffer
macro_rules! with_buffer {
    ($buffer:expr, $array:ident => $body:expr) => {
        match $buffer {
            VolumeBuffer::U8($array) => $body,
            VolumeBuffer::U16($array) => $body,
            VolumeBuffer::U32($array) => $body,
            VolumeBuffer::I8($array) => $body,
            VolumeBuffer::I16($array) => $body,
            VolumeBuffer::I32($array) => $body,
            VolumeBuffer::F32($array) => $body,
            VolumeBuffer::F64($array) => $body,
        }
    };
}

/// Pick the element type matching a runtime [`DataType`]
macro_rules! with_data_type {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            DataType::U8 => {
                type $t = u8;
                $body
            }
            DataType::U16 => {
                type $t = u16;
                $body
            }
            DataType::U32 => {
                type $t = u32;
                $body
            }
            DataType::I8 => {
                type $t = i8;
                $body
            }
            DataType::I16 => {
                type $t = i16;
                $body
            }
            DataType::I32 => {
                type $t = i32;
                $body
            }
            DataType::F32 => {
                type $t = f32;
                $body
            }
            DataType::F64 => {
                type $t = f64;
                $body
            }
        }
    };
}

pub(crate) use map_buffer;
pub(crate) use with_buffer;

fn slice_region<T: Clone>(array: &ArrayD<T>, region: &Region) -> ArrayD<T> {
    array
        .slice_each_axis(|ax| {
            let i = ax.axis.index();
            Slice::from(region.start[i]..region.start[i] + region.shape[i])
        })
        .to_owned()
}

fn decode_array<T: Element>(shape: &[usize], bytes: &[u8]) -> Result<ArrayD<T>> {
    let size = std::mem::size_of::<T>();
    let expected: usize = shape.iter().product::<usize>() * size;
    if bytes.len() != expected {
        return Err(ConvertError::Codec(format!(
            "decoded chunk has {} bytes, expected {}",
            bytes.len(),
            expected
        )));
    }
    let values: Vec<T> = bytes.chunks_exact(size).map(T::read_le).collect();
    ArrayD::from_shape_vec(IxDyn(shape), values)
        .map_err(|e| ConvertError::Internal(format!("shape mismatch: {}", e)))
}

impl VolumeBuffer {
    /// A zero-filled buffer
    pub fn zeros(data_type: DataType, shape: &[usize]) -> Self {
        with_data_type!(data_type, T => T::into_buffer(ArrayD::<T>::zeros(IxDyn(shape))))
    }

    /// Decode C-ordered little-endian bytes
    pub fn from_le_bytes(data_type: DataType, shape: &[usize], bytes: &[u8]) -> Result<Self> {
        with_data_type!(data_type, T => Ok(T::into_buffer(decode_array::<T>(shape, bytes)?)))
    }

    pub fn data_type(&self) -> DataType {
        match self {
            VolumeBuffer::U8(_) => DataType::U8,
            VolumeBuffer::U16(_) => DataType::U16,
            VolumeBuffer::U32(_) => DataType::U32,
            VolumeBuffer::I8(_) => DataType::I8,
            VolumeBuffer::I16(_) => DataType::I16,
            VolumeBuffer::I32(_) => DataType::I32,
            VolumeBuffer::F32(_) => DataType::F32,
            VolumeBuffer::F64(_) => DataType::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_buffer!(self, a => a.shape())
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        with_buffer!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// C-ordered little-endian encoding
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.data_type().size_in_bytes());
        with_buffer!(self, a => {
            for v in a.iter() {
                v.write_le(&mut out);
            }
        });
        out
    }

    /// Copy of the samples inside `region` (relative to this buffer's origin)
    pub fn extract(&self, region: &Region) -> Result<Self> {
        if !region.fits_in(self.shape()) {
            return Err(ConvertError::Internal(format!(
                "region {} outside buffer of shape {:?}",
                region,
                self.shape()
            )));
        }
        Ok(map_buffer!(self, a => slice_region(a, region)))
    }

    /// Overwrite the samples inside `region` with `values`
    pub fn assign(&mut self, region: &Region, values: &VolumeBuffer) -> Result<()> {
        if !region.fits_in(self.shape()) || region.shape.as_slice() != values.shape() {
            return Err(ConvertError::Internal(format!(
                "cannot assign {:?} samples into region {} of buffer {:?}",
                values.shape(),
                region,
                self.shape()
            )));
        }
        macro_rules! assign_arm {
            ($dst:ident, $src:ident) => {{
                $dst.slice_each_axis_mut(|ax| {
                    let i = ax.axis.index();
                    Slice::from(region.start[i]..region.start[i] + region.shape[i])
                })
                .assign($src);
                Ok(())
            }};
        }
        match (self, values) {
            (VolumeBuffer::U8(d), VolumeBuffer::U8(s)) => assign_arm!(d, s),
            (VolumeBuffer::U16(d), VolumeBuffer::U16(s)) => assign_arm!(d, s),
            (VolumeBuffer::U32(d), VolumeBuffer::U32(s)) => assign_arm!(d, s),
            (VolumeBuffer::I8(d), VolumeBuffer::I8(s)) => assign_arm!(d, s),
            (VolumeBuffer::I16(d), VolumeBuffer::I16(s)) => assign_arm!(d, s),
            (VolumeBuffer::I32(d), VolumeBuffer::I32(s)) => assign_arm!(d, s),
            (VolumeBuffer::F32(d), VolumeBuffer::F32(s)) => assign_arm!(d, s),
            (VolumeBuffer::F64(d), VolumeBuffer::F64(s)) => assign_arm!(d, s),
            (d, s) => Err(ConvertError::malformed(format!(
                "sample type mismatch: {} vs {}",
                d.data_type(),
                s.data_type()
            ))),
        }
    }

    /// Zero-extend to `shape`, keeping the samples at the origin
    pub fn padded(&self, shape: &[usize]) -> Result<Self> {
        if shape == self.shape() {
            return Ok(self.clone());
        }
        let mut canvas = VolumeBuffer::zeros(self.data_type(), shape);
        canvas.assign(&Region::full(self.shape()), self)?;
        Ok(canvas)
    }

    /// Reorder axes: axis `i` of the result is axis `permutation[i]` of `self`
    pub fn permuted(&self, permutation: &[usize]) -> Self {
        map_buffer!(self, a => a
            .view()
            .permuted_axes(permutation.to_vec())
            .as_standard_layout()
            .into_owned())
    }

    /// Add a length-one axis at position `axis`
    pub fn insert_axis(self, axis: usize) -> Self {
        map_buffer!(self, a => a.insert_axis(ndarray::Axis(axis)))
    }

    /// All samples as `f64`, in C order
    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_buffer!(self, a => a.iter().map(|v| v.to_f64().unwrap_or(f64::NAN)).collect())
    }

    /// Borrow the typed array if the buffer holds samples of type `T`
    pub fn as_array<T: Element>(&self) -> Option<&ArrayD<T>> {
        T::buffer_ref(self)
    }
}

impl<T: Element> From<ArrayD<T>> for VolumeBuffer {
    fn from(array: ArrayD<T>) -> Self {
        T::into_buffer(array)
    }
}

/// A readable full-resolution volume, decoded region by region
pub trait VolumeSource: Send + Sync {
    /// Shape in the source's own axis order
    fn shape(&self) -> &[usize];

    /// Sample type produced by `read_region`
    fn data_type(&self) -> DataType;

    /// Decode the samples inside `region`
    fn read_region(&self, region: &Region) -> Result<VolumeBuffer>;
}

impl<S: VolumeSource + ?Sized> VolumeSource for std::sync::Arc<S> {
    fn shape(&self) -> &[usize] {
        (**self).shape()
    }

    fn data_type(&self) -> DataType {
        (**self).data_type()
    }

    fn read_region(&self, region: &Region) -> Result<VolumeBuffer> {
        (**self).read_region(region)
    }
}

/// A volume that is already resident in memory
#[derive(Debug, Clone)]
pub struct InMemorySource {
    buffer: VolumeBuffer,
}

impl InMemorySource {
    pub fn new(buffer: impl Into<VolumeBuffer>) -> Self {
        Self {
            buffer: buffer.into(),
        }
    }
}

impl VolumeSource for InMemorySource {
    fn shape(&self) -> &[usize] {
        self.buffer.shape()
    }

    fn data_type(&self) -> DataType {
        self.buffer.data_type()
    }

    fn read_region(&self, region: &Region) -> Result<VolumeBuffer> {
        self.buffer.extract(region)
    }
}

/// Presents a source in a different axis order.
///
/// Axis `i` of the permuted view is axis `permutation[i]` of the inner source.
pub struct PermutedSource<S> {
    inner: S,
    permutation: Vec<usize>,
    shape: Vec<usize>,
}

impl<S: VolumeSource> PermutedSource<S> {
    pub fn new(inner: S, permutation: Vec<usize>) -> Self {
        let shape = permutation.iter().map(|&p| inner.shape()[p]).collect();
        Self {
            inner,
            permutation,
            shape,
        }
    }
}

impl<S: VolumeSource> VolumeSource for PermutedSource<S> {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data_type(&self) -> DataType {
        self.inner.data_type()
    }

    fn read_region(&self, region: &Region) -> Result<VolumeBuffer> {
        let inner_region = region.unpermuted(&self.permutation);
        Ok(self
            .inner
            .read_region(&inner_region)?
            .permuted(&self.permutation))
    }
}
