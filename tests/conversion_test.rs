//! End-to-end conversions through the public API
//!
//! Inputs are generated on the fly in temporary directories: PNG sections,
//! TIFF mosaics and `.npy` volumes.

use async_trait::async_trait;
use bytes::Bytes;
use linc_convert::{
    convert::sidecar_path,
    metadata::{read_store_attributes, ATTRIBUTES_KEY},
    CancelToken, ConversionJob, ConvertConfig, ConvertError, DarkFieldParams, IOManager,
    InMemorySource, LevelReader, LightSheetParams, MemoryIOManager, PsOctParams, ReaderParams,
    Result, SourceMetadata, StorageBackend, VolumeSource,
};
use linc_convert::{FileSystemIOManager, Modality};
use ndarray::{ArrayD, IxDyn};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tiff::encoder::{colortype, TiffEncoder};

// =============================================================================
// Input writers
// =============================================================================

fn write_gray8_png(path: &Path, width: u32, height: u32, data: &[u8]) {
    write_gray8_png_with_density(path, width, height, None, data);
}

/// `pixels_per_metre` lands in the pHYs chunk
fn write_gray8_png_with_density(
    path: &Path,
    width: u32,
    height: u32,
    pixels_per_metre: Option<u32>,
    data: &[u8],
) {
    let file = std::io::BufWriter::new(File::create(path).unwrap());
    let mut encoder = png::Encoder::new(file, width, height);
    encoder.set_color(png::ColorType::Grayscale);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_pixel_dims(pixels_per_metre.map(|ppm| png::PixelDimensions {
        xppu: ppm,
        yppu: ppm,
        unit: png::Unit::Meter,
    }));
    let mut writer = encoder.write_header().unwrap();
    writer.write_image_data(data).unwrap();
}

fn write_tiff_pages(path: &Path, width: u32, height: u32, pages: &[Vec<u16>]) {
    let mut encoder = TiffEncoder::new(File::create(path).unwrap()).unwrap();
    for page in pages {
        encoder
            .write_image::<colortype::Gray16>(width, height, page)
            .unwrap();
    }
}

/// Light-sheet tile `(z, y)` of a mosaic whose tiles are `pages x height x width`.
/// Each sample holds `z * 100 + y * 10 + x` in mosaic coordinates.
fn write_mosaic_tile(dir: &Path, z: usize, y: usize, pages: usize, height: usize, width: usize) {
    let (z0, y0) = ((z - 1) * pages, (y - 1) * height);
    let data: Vec<Vec<u16>> = (0..pages)
        .map(|p| {
            (0..height * width)
                .map(|i| ((z0 + p) * 100 + (y0 + i / width) * 10 + i % width) as u16)
                .collect()
        })
        .collect();
    let path = dir.join(format!("mouse_z{:02}_y{:02}.tif", z, y));
    write_tiff_pages(&path, width as u32, height as u32, &data);
}

fn write_f32_npy(path: &Path, shape: &[usize], values: &[f32]) {
    let dims = shape.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(", ");
    let mut header = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}), }}",
        dims
    );
    while (10 + header.len() + 1) % 64 != 0 {
        header.push(' ');
    }
    header.push('\n');
    let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend(values.iter().flat_map(|v| v.to_le_bytes()));
    std::fs::write(path, bytes).unwrap();
}

fn read_attributes(store: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(store.join(ATTRIBUTES_KEY)).unwrap()).unwrap()
}

/// Every file below `root` except the root attributes, keyed by relative path
fn store_files(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else if path.file_name().unwrap() != ATTRIBUTES_KEY {
                let relative = path.strip_prefix(root).unwrap().to_path_buf();
                files.insert(relative, std::fs::read(&path).unwrap());
            }
        }
    }
    files
}

// =============================================================================
// I/O managers with injected behaviour
// =============================================================================

/// Cancels the job when a given key is written
struct CancelOnWrite {
    inner: Arc<MemoryIOManager>,
    trigger: String,
    cancel: CancelToken,
}

/// Fails every chunk write of one level
struct FailingLevel {
    inner: Arc<MemoryIOManager>,
    level: usize,
}

impl FailingLevel {
    fn is_chunk_of_level(&self, path: &str) -> bool {
        path.starts_with(&format!("{}/", self.level)) && !path.ends_with(".zarray")
    }
}

macro_rules! delegate_io {
    ($ty:ty, |$this:ident, $path:ident, $data:ident| $write:block) => {
        #[async_trait]
        impl IOManager for $ty {
            async fn read(&self, path: &str) -> Result<Bytes> {
                self.inner.read(path).await
            }

            async fn write(&self, $path: &str, $data: &[u8]) -> Result<()> {
                let $this = self;
                $write
            }

            async fn exists(&self, path: &str) -> Result<bool> {
                self.inner.exists(path).await
            }

            async fn delete(&self, path: &str) -> Result<()> {
                self.inner.delete(path).await
            }

            async fn list(&self, prefix: &str) -> Result<Vec<String>> {
                self.inner.list(prefix).await
            }

            async fn size(&self, path: &str) -> Result<usize> {
                self.inner.size(path).await
            }

            async fn clear(&self) -> Result<()> {
                self.inner.clear().await
            }

            fn backend(&self) -> StorageBackend {
                StorageBackend::Memory
            }
        }
    };
}

delegate_io!(CancelOnWrite, |this, path, data| {
    this.inner.write(path, data).await?;
    if path == this.trigger {
        this.cancel.cancel();
    }
    Ok(())
});

delegate_io!(FailingLevel, |this, path, data| {
    if this.is_chunk_of_level(path) {
        return Err(ConvertError::Io(std::io::Error::other("device full")));
    }
    this.inner.write(path, data).await
});

fn zeros_source(shape: &[usize]) -> Arc<dyn VolumeSource> {
    Arc::new(InMemorySource::new(ArrayD::<u8>::zeros(IxDyn(shape))))
}

fn ramp_source(shape: &[usize]) -> Arc<dyn VolumeSource> {
    let n = shape.iter().product::<usize>();
    let data = ArrayD::from_shape_vec(IxDyn(shape), (0..n).map(|i| (i % 4099) as u16).collect())
        .unwrap();
    Arc::new(InMemorySource::new(data))
}

// =============================================================================
// Modalities
// =============================================================================

#[tokio::test]
async fn test_dark_field_sections() {
    let dir = TempDir::new().unwrap();
    let mut inputs = Vec::new();
    for z in 0..3u8 {
        let path = dir.path().join(format!("section_{}.png", z));
        let data: Vec<u8> = (0..24u8).map(|i| z * 50 + i).collect();
        write_gray8_png(&path, 6, 4, &data);
        inputs.push(path);
    }
    let store = dir.path().join("sections.ome.zarr");
    let config = ConvertConfig::default()
        .with_chunk_shape(vec![2, 4, 4])
        .with_min_extent(1)
        .with_max_levels(2)
        .with_voxel_size(vec![2.0, 2.0]);
    let params = DarkFieldParams::new(inputs)
        .with_slice_thickness(50.0)
        .with_staining("Nissl");

    let report = ConversionJob::new(&store, config)
        .run_params(ReaderParams::DarkField(params))
        .await
        .unwrap();
    assert_eq!(report.modality, "darkfield");
    assert_eq!(report.shape, vec![3, 4, 6]);
    assert_eq!(report.levels.len(), 2);
    // z is never pooled for sections
    assert_eq!(report.levels[1].shape, vec![3, 2, 3]);

    let level0 = LevelReader::open_path(&store, 0).await.unwrap();
    let values = level0.read_all().await.unwrap().to_f64_vec();
    assert_eq!(values[0], 0.0);
    assert_eq!(values[24 + 7], 57.0);
    assert_eq!(values[2 * 24 + 23], 123.0);

    let attributes = read_attributes(&store);
    let multiscale = &attributes["multiscales"][0];
    assert_eq!(multiscale["version"], "0.4");
    assert_eq!(multiscale["name"], "section_0");
    assert_eq!(multiscale["type"], "1x2x2 mean window");
    let level1 = &multiscale["datasets"][1]["coordinateTransformations"];
    assert_eq!(level1[0]["scale"], json!([50.0, 4.0, 4.0]));
    assert_eq!(level1[1]["translation"], json!([0.0, 1.0, 1.0]));
    assert_eq!(attributes["linc_convert"]["modality"], "darkfield");

    let sidecar: Value =
        serde_json::from_slice(&std::fs::read(sidecar_path(&store)).unwrap()).unwrap();
    assert_eq!(sidecar["PixelSize"], json!([2.0, 2.0]));
    assert_eq!(sidecar["SliceThickness"], json!(50.0));
    assert_eq!(sidecar["SampleStaining"], "Nissl");
    assert_eq!(report.sidecar, Some(sidecar_path(&store)));
}

#[tokio::test]
async fn test_dark_field_pixel_size_from_sections() {
    let dir = TempDir::new().unwrap();
    let mut inputs = Vec::new();
    for z in 0..2u8 {
        let path = dir.path().join(format!("slide_{}.png", z));
        let data: Vec<u8> = (0..16u8).map(|i| z * 20 + i).collect();
        // 500000 pixels per metre is 2 micrometres per pixel
        write_gray8_png_with_density(&path, 4, 4, Some(500_000), &data);
        inputs.push(path);
    }
    let store = dir.path().join("slides.ome.zarr");
    let config = ConvertConfig::default()
        .with_chunk_shape(vec![2, 4, 4])
        .with_min_extent(1)
        .with_max_levels(2);

    let report = ConversionJob::new(&store, config)
        .run_params(ReaderParams::DarkField(DarkFieldParams::new(inputs)))
        .await
        .unwrap();
    assert_eq!(report.shape, vec![2, 4, 4]);

    let attributes = read_attributes(&store);
    let multiscale = &attributes["multiscales"][0];
    let level0 = &multiscale["datasets"][0]["coordinateTransformations"];
    assert_eq!(level0[0]["scale"], json!([1.0, 2.0, 2.0]));
    assert_eq!(multiscale["axes"][1]["unit"], "micrometer");

    let sidecar: Value =
        serde_json::from_slice(&std::fs::read(sidecar_path(&store)).unwrap()).unwrap();
    assert_eq!(sidecar["PixelSize"], json!([2.0, 2.0]));
    assert_eq!(sidecar["SliceThickness"], json!(1.0));
}

#[tokio::test]
async fn test_light_sheet_mosaic() {
    let dir = TempDir::new().unwrap();
    let tiles = dir.path().join("mouse");
    std::fs::create_dir(&tiles).unwrap();
    for z in 1..=2 {
        for y in 1..=2 {
            write_mosaic_tile(&tiles, z, y, 2, 3, 4);
        }
    }
    let store = dir.path().join("mouse.ome.zarr");
    let config = ConvertConfig::default()
        .with_chunk_shape(vec![3])
        .with_voxel_size(vec![1.0]);

    // Modality inferred from the directory contents
    let params = ReaderParams::detect(&[tiles.clone()]).unwrap();
    assert_eq!(params.modality(), Modality::LightSheet);
    let report = ConversionJob::new(&store, config)
        .run_params(params)
        .await
        .unwrap();
    assert_eq!(report.shape, vec![4, 6, 4]);
    assert_eq!(report.levels.len(), 1);
    assert_eq!(report.levels[0].chunks_total, 2 * 2 * 2);

    let level0 = LevelReader::open_path(&store, 0).await.unwrap();
    let values = level0.read_all().await.unwrap().to_f64_vec();
    for z in 0..4 {
        for y in 0..6 {
            for x in 0..4 {
                let expected = (z * 100 + y * 10 + x) as f64;
                assert_eq!(values[(z * 6 + y) * 4 + x], expected, "at z={} y={} x={}", z, y, x);
            }
        }
    }

    let attributes = read_attributes(&store);
    assert_eq!(attributes["multiscales"][0]["name"], "mouse");
    assert!(!sidecar_path(&store).exists());
}

#[tokio::test]
async fn test_ps_oct_channels() {
    let dir = TempDir::new().unwrap();
    let mut inputs = Vec::new();
    for (c, name) in ["retardance", "orientation"].iter().enumerate() {
        let path = dir.path().join(format!("{}.npy", name));
        let values: Vec<f32> = (0..24).map(|i| (c * 100 + i) as f32).collect();
        write_f32_npy(&path, &[2, 3, 4], &values);
        inputs.push(path);
    }
    let meta = dir.path().join("acquisition.txt");
    std::fs::write(&meta, "Voxel size: 2x4x4um\nModality: PS-OCT\n").unwrap();
    let store = dir.path().join("block.ome.zarr");

    let params = PsOctParams::new(inputs)
        .with_meta(meta)
        .with_polarization_channels(2);
    let report = ConversionJob::new(&store, ConvertConfig::default())
        .run_params(ReaderParams::PsOct(params))
        .await
        .unwrap();
    assert_eq!(report.axes, "czyx");
    assert_eq!(report.shape, vec![2, 2, 3, 4]);

    let level0 = LevelReader::open_path(&store, 0).await.unwrap();
    let values = level0.read_all().await.unwrap().to_f64_vec();
    assert_eq!(values[5], 5.0);
    assert_eq!(values[24 + 5], 105.0);

    let attributes = read_attributes(&store);
    let multiscale = &attributes["multiscales"][0];
    let names: Vec<&str> = multiscale["axes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["c", "z", "y", "x"]);
    assert_eq!(multiscale["axes"][0]["type"], "channel");
    assert_eq!(
        multiscale["datasets"][0]["coordinateTransformations"][0]["scale"],
        json!([1.0, 2.0, 4.0, 4.0])
    );
    assert_eq!(
        attributes["linc_convert"]["channel_names"],
        json!(["retardance", "orientation"])
    );
    assert_eq!(attributes["linc_convert"]["attributes"]["OCTModality"], "PS-OCT");
    assert!(sidecar_path(&store).exists());
}

// =============================================================================
// Store behaviour
// =============================================================================

#[tokio::test]
async fn test_zero_cube_pyramid() {
    let io = Arc::new(MemoryIOManager::new());
    let config = ConvertConfig::default()
        .with_chunk_shape(vec![64])
        .with_min_extent(64)
        .with_voxel_size(vec![1.0]);
    let job = ConversionJob::with_io(io.clone(), config);
    let report = job
        .run_source(
            zeros_source(&[256, 256, 256]),
            SourceMetadata::new("test", "zyx"),
            "zeros",
        )
        .await
        .unwrap();

    assert_eq!(report.levels.len(), 2);
    assert_eq!(report.levels[0].chunks_total, 64);
    assert_eq!(report.levels[1].chunks_total, 8);
    assert_eq!(report.levels[1].shape, vec![128, 128, 128]);

    let chunks_of = |level: &str| {
        io.keys()
            .iter()
            .filter(|k| k.starts_with(level) && !k.ends_with(".zarray"))
            .count()
    };
    assert_eq!(chunks_of("0/"), 64);
    assert_eq!(chunks_of("1/"), 8);

    let level1 = LevelReader::open(io.clone(), 1).await.unwrap();
    assert!(level1.read_all().await.unwrap().to_f64_vec().iter().all(|&v| v == 0.0));
    assert!(read_store_attributes(io.as_ref()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_rewrite_is_unchanged() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("ramp.ome.zarr");
    let config = ConvertConfig::default()
        .with_chunk_shape(vec![16])
        .with_min_extent(8)
        .with_voxel_size(vec![0.5]);
    let metadata = SourceMetadata::new("test", "zyx");

    let first = ConversionJob::new(&store, config.clone())
        .run_source(ramp_source(&[32, 32, 32]), metadata.clone(), "ramp")
        .await
        .unwrap();
    assert_eq!(first.levels.len(), 2);
    assert_eq!(first.chunks_written(), 8 + 1);
    let files = store_files(&store);
    let attributes = read_attributes(&store);

    let second = ConversionJob::new(&store, config)
        .run_source(ramp_source(&[32, 32, 32]), metadata, "ramp")
        .await
        .unwrap();
    assert_eq!(second.chunks_written(), 0);
    assert_eq!(second.chunks_unchanged(), first.chunks_written());
    assert_eq!(second.bytes_written(), 0);
    assert_eq!(store_files(&store), files);
    assert_eq!(read_attributes(&store)["multiscales"], attributes["multiscales"]);
}

#[tokio::test]
async fn test_interrupted_job_is_incomplete() {
    let memory = Arc::new(MemoryIOManager::new());
    let cancel = CancelToken::new();
    let io = Arc::new(CancelOnWrite {
        inner: memory.clone(),
        trigger: "1/.zarray".to_string(),
        cancel: cancel.clone(),
    });
    let config = ConvertConfig::default()
        .with_chunk_shape(vec![8])
        .with_min_extent(4)
        .with_voxel_size(vec![1.0]);
    let job = ConversionJob::with_io(io, config).with_cancel_token(cancel);

    let err = job
        .run_source(ramp_source(&[16, 16, 16]), SourceMetadata::new("test", "zyx"), "ramp")
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::Cancelled));
    assert_eq!(err.exit_code(), 130);
    assert!(memory.exists("0/.zarray").await.unwrap());
    assert!(!memory.exists(ATTRIBUTES_KEY).await.unwrap());
    assert!(!memory.exists(".zgroup").await.unwrap());
}

#[tokio::test]
async fn test_chunk_failure_aborts_job() {
    let memory = Arc::new(MemoryIOManager::new());
    let io = Arc::new(FailingLevel {
        inner: memory.clone(),
        level: 1,
    });
    let config = ConvertConfig::default()
        .with_chunk_shape(vec![8])
        .with_min_extent(4)
        .with_voxel_size(vec![1.0])
        .with_workers(2);

    let err = ConversionJob::with_io(io, config)
        .run_source(ramp_source(&[16, 16, 16]), SourceMetadata::new("test", "zyx"), "ramp")
        .await
        .unwrap_err();
    match &err {
        ConvertError::ChunkWriteFailure { level, chunk, .. } => {
            assert_eq!(*level, 1);
            assert_eq!(chunk.len(), 3);
        }
        other => panic!("expected a chunk write failure, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 3);
    assert!(!memory.exists(ATTRIBUTES_KEY).await.unwrap());
}

#[tokio::test]
async fn test_missing_tile_is_reported() {
    let dir = TempDir::new().unwrap();
    let tiles = dir.path().join("mouse");
    std::fs::create_dir(&tiles).unwrap();
    write_mosaic_tile(&tiles, 1, 1, 2, 3, 4);
    write_mosaic_tile(&tiles, 1, 2, 2, 3, 4);
    write_mosaic_tile(&tiles, 2, 1, 2, 3, 4);
    let store = dir.path().join("mouse.ome.zarr");

    let config = ConvertConfig::default().with_voxel_size(vec![1.0]);
    let err = ConversionJob::new(&store, config)
        .run_params(ReaderParams::LightSheet(LightSheetParams::new(tiles)))
        .await
        .unwrap_err();
    match &err {
        ConvertError::MalformedInput(message) => assert!(message.contains("z=02 y=02"), "{}", message),
        other => panic!("expected malformed input, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 2);
    assert!(!store.join("0").exists());
    assert!(!store.join(ATTRIBUTES_KEY).exists());
}

#[tokio::test]
async fn test_overwrite_replaces_store() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("cube.ome.zarr");
    let io = Arc::new(FileSystemIOManager::new(&store));
    let config = ConvertConfig::default()
        .with_chunk_shape(vec![4])
        .with_voxel_size(vec![1.0]);

    ConversionJob::with_io(io.clone(), config.clone())
        .run_source(zeros_source(&[8, 8, 8]), SourceMetadata::new("test", "zyx"), "cube")
        .await
        .unwrap();

    // A different shape needs an explicit overwrite
    let err = ConversionJob::with_io(io.clone(), config.clone())
        .run_source(zeros_source(&[8, 8, 4]), SourceMetadata::new("test", "zyx"), "cube")
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::InvalidConfig(_)));
    assert!(store.join(ATTRIBUTES_KEY).exists());

    let report = ConversionJob::with_io(io, config.with_overwrite(true))
        .run_source(zeros_source(&[8, 8, 4]), SourceMetadata::new("test", "zyx"), "cube")
        .await
        .unwrap();
    assert_eq!(report.shape, vec![8, 8, 4]);
    assert_eq!(report.chunks_written(), 4);
    assert!(!store.join("0").join("1").join("1").join("1").exists());
}

#[tokio::test]
async fn test_overwrite_keeps_foreign_directory() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("results");
    std::fs::create_dir(&target).unwrap();
    std::fs::write(target.join("analysis.csv"), "a,b\n1,2\n").unwrap();

    let config = ConvertConfig::default()
        .with_chunk_shape(vec![4])
        .with_voxel_size(vec![1.0])
        .with_overwrite(true);
    let err = ConversionJob::new(&target, config)
        .run_source(zeros_source(&[8, 8, 8]), SourceMetadata::new("test", "zyx"), "cube")
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::InvalidConfig(_)));
    assert!(target.join("analysis.csv").exists());
    assert!(!target.join("0").exists());
}
