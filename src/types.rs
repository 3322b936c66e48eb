//! Core data types shared by readers, writers and metadata

use crate::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sample types supported in converted stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8,
    /// Unsigned 16-bit integer
    U16,
    /// Unsigned 32-bit integer
    U32,
    /// Signed 8-bit integer
    I8,
    /// Signed 16-bit integer
    I16,
    /// Signed 32-bit integer
    I32,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// Little-endian Zarr v2 / NumPy type string
    pub fn zarr_dtype(&self) -> &'static str {
        match self {
            DataType::U8 => "|u1",
            DataType::U16 => "<u2",
            DataType::U32 => "<u4",
            DataType::I8 => "|i1",
            DataType::I16 => "<i2",
            DataType::I32 => "<i4",
            DataType::F32 => "<f4",
            DataType::F64 => "<f8",
        }
    }

    /// Parse a NumPy-style type string (`<u2`, `|u1`, `<f4`, ...).
    ///
    /// Only little-endian (or byte-order-free) types are accepted.
    pub fn from_zarr_dtype(dtype: &str) -> Result<Self> {
        let unsupported = || ConvertError::malformed(format!("unsupported sample type {:?}", dtype));
        let mut chars = dtype.chars();
        let code = match chars.next() {
            Some('<' | '|' | '=') => chars.as_str(),
            _ => return Err(unsupported()),
        };
        match code {
            "u1" | "b1" => Ok(DataType::U8),
            "u2" => Ok(DataType::U16),
            "u4" => Ok(DataType::U32),
            "i1" => Ok(DataType::I8),
            "i2" => Ok(DataType::I16),
            "i4" => Ok(DataType::I32),
            "f4" => Ok(DataType::F32),
            "f8" => Ok(DataType::F64),
            _ => Err(unsupported()),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Semantic kind of an axis, as understood by OME multiscales
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisKind {
    Time,
    Channel,
    Space,
}

/// Canonical axis labels, in canonical storage order
pub const CANONICAL_AXES: [char; 5] = ['t', 'c', 'z', 'y', 'x'];

impl AxisKind {
    /// Kind of a canonical axis label
    pub fn from_label(label: char) -> Option<Self> {
        match label {
            't' => Some(AxisKind::Time),
            'c' => Some(AxisKind::Channel),
            'z' | 'y' | 'x' => Some(AxisKind::Space),
            _ => None,
        }
    }
}

/// Position of a label in canonical `t, c, z, y, x` order
pub fn canonical_rank(label: char) -> Option<usize> {
    CANONICAL_AXES.iter().position(|&c| c == label)
}

/// Axis descriptor with name, kind, unit and physical scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    /// Axis label (`c`, `z`, `y`, `x`, ...)
    pub name: char,
    /// Axis kind
    pub kind: AxisKind,
    /// Number of samples along this axis at full resolution
    pub num_samples: usize,
    /// OME unit name (e.g. "micrometer"); `None` for channel axes
    pub unit: Option<String>,
    /// Physical size of one sample at full resolution
    pub scale: f64,
    /// Whether the pyramid downsamples along this axis
    pub pooled: bool,
}

impl Axis {
    /// Create a new spatial axis
    pub fn space(name: char, num_samples: usize, unit: impl Into<String>, scale: f64) -> Self {
        Self {
            name,
            kind: AxisKind::Space,
            num_samples,
            unit: Some(unit.into()),
            scale,
            pooled: true,
        }
    }

    /// Create a new channel axis
    pub fn channel(num_samples: usize) -> Self {
        Self {
            name: 'c',
            kind: AxisKind::Channel,
            num_samples,
            unit: None,
            scale: 1.0,
            pooled: false,
        }
    }

    /// Exclude this axis from downsampling
    pub fn unpooled(mut self) -> Self {
        self.pooled = false;
        self
    }

    /// Physical extent covered by the axis at full resolution
    pub fn extent(&self) -> f64 {
        self.num_samples as f64 * self.scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::U8.size_in_bytes(), 1);
        assert_eq!(DataType::U16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::F64.size_in_bytes(), 8);
    }

    #[test]
    fn test_zarr_dtype_roundtrip() {
        for dt in [
            DataType::U8,
            DataType::U16,
            DataType::U32,
            DataType::I8,
            DataType::I16,
            DataType::I32,
            DataType::F32,
            DataType::F64,
        ] {
            assert_eq!(DataType::from_zarr_dtype(dt.zarr_dtype()).unwrap(), dt);
        }
    }

    #[test]
    fn test_big_endian_rejected() {
        assert!(DataType::from_zarr_dtype(">u2").is_err());
        assert!(DataType::from_zarr_dtype("<c8").is_err());
        assert!(DataType::from_zarr_dtype("").is_err());
    }

    #[test]
    fn test_canonical_rank() {
        assert_eq!(canonical_rank('c'), Some(1));
        assert_eq!(canonical_rank('x'), Some(4));
        assert_eq!(canonical_rank('q'), None);
        assert_eq!(AxisKind::from_label('z'), Some(AxisKind::Space));
        assert_eq!(AxisKind::from_label('c'), Some(AxisKind::Channel));
    }

    #[test]
    fn test_axis_extent() {
        let axis = Axis::space('z', 100, "micrometer", 2.5);
        assert_eq!(axis.extent(), 250.0);
        assert!(axis.pooled);
        assert!(!axis.unpooled().pooled);
        assert!(!Axis::channel(3).pooled);
    }
}
