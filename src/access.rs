//! Read access to a written resolution level

use crate::compression::{get_compressor, CompressionMethod};
use crate::error::{ConvertError, Result};
use crate::io::{FileSystemIOManager, IOManager};
use crate::layout::ChunkLayout;
use crate::metadata::{read_array_metadata, ArrayMetadata};
use crate::types::DataType;
use crate::volume::{Region, VolumeBuffer};
use futures::future::try_join_all;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Reads regions of one level back from a store
pub struct LevelReader {
    io: Arc<dyn IOManager>,
    level: usize,
    metadata: ArrayMetadata,
    layout: ChunkLayout,
    compression: CompressionMethod,
}

impl LevelReader {
    /// Open a level of the store behind `io`
    pub async fn open(io: Arc<dyn IOManager>, level: usize) -> Result<Self> {
        let metadata = read_array_metadata(io.as_ref(), level).await?;
        let layout = metadata.layout()?;
        let (compression, _) = metadata.compression()?;
        Ok(Self {
            io,
            level,
            metadata,
            layout,
            compression,
        })
    }

    /// Open a level of a store on the local file system
    pub async fn open_path(store: impl AsRef<Path>, level: usize) -> Result<Self> {
        Self::open(Arc::new(FileSystemIOManager::new(store)), level).await
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub fn metadata(&self) -> &ArrayMetadata {
        &self.metadata
    }

    pub fn shape(&self) -> &[usize] {
        &self.layout.shape
    }

    pub fn data_type(&self) -> DataType {
        self.layout.data_type
    }

    /// Store key of a chunk of this level
    pub fn chunk_key(&self, coords: &[usize]) -> String {
        format!("{}/{}", self.level, ChunkLayout::chunk_key(coords))
    }

    /// Decode one full-size chunk. A chunk that was never written reads as fill.
    pub async fn read_chunk(&self, coords: &[usize]) -> Result<VolumeBuffer> {
        let key = self.chunk_key(coords);
        let data_type = self.layout.data_type;
        let chunk_shape = self.layout.chunk_shape.clone();

        if !self.io.exists(&key).await? {
            trace!(key = %key, "chunk missing, using fill value");
            return Ok(VolumeBuffer::zeros(data_type, &chunk_shape));
        }

        let compressed = self.io.read(&key).await?;
        let compressor = get_compressor(self.compression);
        let expected = self.layout.chunk_size_bytes();
        tokio::task::spawn_blocking(move || {
            let raw = compressor.decompress(&compressed, Some(expected))?;
            VolumeBuffer::from_le_bytes(data_type, &chunk_shape, &raw)
        })
        .await?
        .map_err(|e| match e {
            ConvertError::Codec(msg) => ConvertError::Codec(format!("{}: {}", key, msg)),
            other => other,
        })
    }

    /// Read an arbitrary region of the level
    pub async fn read_region(&self, region: &Region) -> Result<VolumeBuffer> {
        if !region.fits_in(&self.layout.shape) {
            return Err(ConvertError::Internal(format!(
                "region {} outside level {} of shape {:?}",
                region, self.level, self.layout.shape
            )));
        }

        let chunks = self.layout.chunks_overlapping(region);
        let futures: Vec<_> = chunks
            .iter()
            .map(|coords| async move {
                let chunk = self.read_chunk(coords).await?;
                Ok::<_, ConvertError>((coords, chunk))
            })
            .collect();
        let chunks = try_join_all(futures).await?;

        let mut out = VolumeBuffer::zeros(self.layout.data_type, &region.shape);
        for (coords, chunk) in chunks {
            let chunk_region = self.layout.chunk_region(coords);
            let Some(overlap) = chunk_region.intersect(region) else {
                continue;
            };
            let values = chunk.extract(&overlap.relative_to(&chunk_region.start))?;
            out.assign(&overlap.relative_to(&region.start), &values)?;
        }
        Ok(out)
    }

    /// Read the whole level into memory
    pub async fn read_all(&self) -> Result<VolumeBuffer> {
        self.read_region(&Region::full(&self.layout.shape)).await
    }

    /// Number of chunk files present for this level
    pub async fn stored_chunks(&self) -> Result<usize> {
        let mut count = 0;
        for coords in self.layout.chunk_coords() {
            if self.io.exists(&self.chunk_key(&coords)).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn stats(&self) -> LevelStats {
        LevelStats {
            level: self.level,
            shape: self.layout.shape.clone(),
            total_chunks: self.layout.total_chunks(),
            uncompressed_size: self.layout.total_size_bytes(),
            data_type: self.layout.data_type,
            compression: self.compression,
        }
    }
}

/// Level statistics
#[derive(Debug, Clone)]
pub struct LevelStats {
    pub level: usize,
    pub shape: Vec<usize>,
    pub total_chunks: usize,
    pub uncompressed_size: usize,
    pub data_type: DataType,
    pub compression: CompressionMethod,
}

impl LevelStats {
    pub fn summary(&self) -> String {
        format!(
            "level {}: {} ({}), {} chunks, {} uncompressed, {}",
            self.level,
            crate::utils::format_shape(&self.shape),
            self.data_type,
            self.total_chunks,
            crate::utils::format_bytes(self.uncompressed_size),
            self.compression,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{get_compressor, CompressionLevel};
    use crate::io::MemoryIOManager;
    use crate::metadata::MetadataEmitter;
    use ndarray::{ArrayD, IxDyn};

    async fn write_level(io: &Arc<MemoryIOManager>, data: &VolumeBuffer, chunks: &[usize]) {
        let layout = ChunkLayout::new(data.shape().to_vec(), chunks, data.data_type()).unwrap();
        let meta = ArrayMetadata::new(&layout, CompressionMethod::Zlib, CompressionLevel::new(4));
        MetadataEmitter::new(io.clone())
            .write_array(0, &meta)
            .await
            .unwrap();
        let compressor = get_compressor(CompressionMethod::Zlib);
        for coords in layout.chunk_coords() {
            let region = layout.chunk_region(&coords);
            let block = data
                .extract(&region)
                .unwrap()
                .padded(&layout.chunk_shape)
                .unwrap();
            let bytes = compressor
                .compress(&block.to_le_bytes(), CompressionLevel::new(4))
                .unwrap();
            io.write(&format!("0/{}", ChunkLayout::chunk_key(&coords)), &bytes)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_read_back_regions() {
        let io = Arc::new(MemoryIOManager::new());
        let data: VolumeBuffer =
            ArrayD::from_shape_fn(IxDyn(&[5, 7, 9]), |i| (i[0] * 100 + i[1] * 10 + i[2]) as u16)
                .into();
        write_level(&io, &data, &[2, 3, 4]).await;

        let reader = LevelReader::open(io.clone(), 0).await.unwrap();
        assert_eq!(reader.shape(), &[5, 7, 9]);
        assert_eq!(reader.layout().total_chunks(), 3 * 3 * 3);
        assert_eq!(reader.read_all().await.unwrap(), data);

        let region = Region::new(vec![1, 2, 3], vec![3, 4, 5]);
        assert_eq!(
            reader.read_region(&region).await.unwrap(),
            data.extract(&region).unwrap()
        );
        assert_eq!(reader.stored_chunks().await.unwrap(), 27);
        assert!(reader.stats().summary().contains("27 chunks"));
    }

    #[tokio::test]
    async fn test_missing_chunk_reads_as_fill() {
        let io = Arc::new(MemoryIOManager::new());
        let data: VolumeBuffer = ArrayD::from_elem(IxDyn(&[4, 4]), 9u8).into();
        write_level(&io, &data, &[2, 2]).await;
        io.delete("0/1/1").await.unwrap();

        let reader = LevelReader::open(io.clone(), 0).await.unwrap();
        let all = reader.read_all().await.unwrap().to_f64_vec();
        assert_eq!(all.iter().filter(|&&v| v == 0.0).count(), 4);
        assert_eq!(reader.stored_chunks().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_region_out_of_bounds() {
        let io = Arc::new(MemoryIOManager::new());
        let data: VolumeBuffer = ArrayD::from_elem(IxDyn(&[4, 4]), 1i32).into();
        write_level(&io, &data, &[4, 4]).await;
        let reader = LevelReader::open(io.clone(), 0).await.unwrap();
        assert!(reader
            .read_region(&Region::new(vec![2, 2], vec![3, 1]))
            .await
            .is_err());
    }
}
