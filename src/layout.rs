//! Chunk layout - how a resolution level is divided into chunks

use crate::error::{ConvertError, Result};
use crate::types::DataType;
use crate::utils::{ceil_div, format_shape, grid_indices, ravel_index, unravel_index};
use crate::volume::Region;
use serde::{Deserialize, Serialize};

/// Layout of one resolution level: array shape, chunk shape and sample type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLayout {
    /// Array shape
    pub shape: Vec<usize>,

    /// Chunk shape, never larger than `shape` along any axis
    pub chunk_shape: Vec<usize>,

    /// Data type of the samples
    pub data_type: DataType,
}

impl ChunkLayout {
    /// Create a new layout, clamping the chunk shape to the array shape
    pub fn new(shape: Vec<usize>, chunk_shape: &[usize], data_type: DataType) -> Result<Self> {
        if shape.is_empty() {
            return Err(ConvertError::InvalidConfig(
                "array must have at least one dimension".to_string(),
            ));
        }
        if chunk_shape.len() != shape.len() {
            return Err(ConvertError::InvalidConfig(format!(
                "chunk shape {:?} does not match array dimensionality {}",
                chunk_shape,
                shape.len()
            )));
        }
        if shape.iter().any(|&n| n == 0) {
            return Err(ConvertError::malformed(format!(
                "array shape {:?} has an empty axis",
                shape
            )));
        }
        if chunk_shape.iter().any(|&c| c == 0) {
            return Err(ConvertError::InvalidConfig(
                "chunk sizes must be positive".to_string(),
            ));
        }

        let chunk_shape = chunk_shape
            .iter()
            .zip(&shape)
            .map(|(&c, &n)| c.min(n))
            .collect();

        Ok(Self {
            shape,
            chunk_shape,
            data_type,
        })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of chunks along each axis
    pub fn grid_shape(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.chunk_shape)
            .map(|(&n, &c)| ceil_div(n, c))
            .collect()
    }

    /// Total number of chunks
    pub fn total_chunks(&self) -> usize {
        self.grid_shape().iter().product()
    }

    /// Convert a linear chunk index to chunk coordinates
    pub fn chunk_index_to_coords(&self, index: usize) -> Vec<usize> {
        unravel_index(index, &self.grid_shape())
    }

    /// Convert chunk coordinates to a linear chunk index
    pub fn chunk_coords_to_index(&self, coords: &[usize]) -> usize {
        ravel_index(coords, &self.grid_shape())
    }

    /// All chunk coordinates in C order
    pub fn chunk_coords(&self) -> impl Iterator<Item = Vec<usize>> + Send + 'static {
        grid_indices(&self.grid_shape())
    }

    /// In-bounds samples covered by a chunk; edge chunks are truncated
    pub fn chunk_region(&self, coords: &[usize]) -> Region {
        let (start, shape) = coords
            .iter()
            .enumerate()
            .map(|(i, &coord)| {
                let start = coord * self.chunk_shape[i];
                let end = (start + self.chunk_shape[i]).min(self.shape[i]);
                (start, end - start)
            })
            .unzip();
        Region::new(start, shape)
    }

    /// Coordinates of every chunk overlapping `region`
    pub fn chunks_overlapping(&self, region: &Region) -> Vec<Vec<usize>> {
        if region.is_empty() {
            return Vec::new();
        }
        let first: Vec<usize> = region
            .start
            .iter()
            .zip(&self.chunk_shape)
            .map(|(&s, &c)| s / c)
            .collect();
        let counts: Vec<usize> = region
            .end()
            .iter()
            .zip(&self.chunk_shape)
            .zip(&first)
            .map(|((&e, &c), &f)| (e - 1) / c + 1 - f)
            .collect();
        grid_indices(&counts)
            .map(|offset| offset.iter().zip(&first).map(|(o, f)| o + f).collect())
            .collect()
    }

    /// Store key of a chunk relative to the level, using `/` separators
    pub fn chunk_key(coords: &[usize]) -> String {
        coords
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Size in bytes of a full (padded) chunk
    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_shape.iter().product::<usize>() * self.data_type.size_in_bytes()
    }

    /// Total level size in bytes (uncompressed)
    pub fn total_size_bytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.data_type.size_in_bytes()
    }

    /// Check if coordinates are within bounds
    pub fn is_in_bounds(&self, coords: &[usize]) -> bool {
        coords.len() == self.ndim() && coords.iter().zip(&self.shape).all(|(&c, &n)| c < n)
    }

    /// Get a summary string of the layout
    pub fn summary(&self) -> String {
        format!(
            "{} ({}), chunks {}, {} chunks, {:.2} MB uncompressed",
            format_shape(&self.shape),
            self.data_type,
            format_shape(&self.chunk_shape),
            self.total_chunks(),
            self.total_size_bytes() as f64 / (1024.0 * 1024.0)
        )
    }
}
