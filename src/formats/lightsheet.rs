//! Light-sheet mosaic reader.
//!
//! A mosaic is a directory of multi-page grey TIFF tiles named
//! `<prefix>_z<ZZ>_y<YY><suffix>.tif`, indexed from 1. Tile `(z, y)` covers
//! grid row `z` (its pages are planes) and grid column `y` (its rows); every
//! tile spans the full width.

use super::cache::TileCache;
use super::image::{inspect_tiff, read_tiff_pages, tiff_spacing, PixelSpacing, TiffInfo};
use super::{check_region, copy_overlap, Modality};
use crate::error::{ConvertError, Result};
use crate::normalize::SourceMetadata;
use crate::types::DataType;
use crate::volume::{Region, VolumeBuffer, VolumeSource};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LightSheetParams {
    pub directory: PathBuf,
    /// Expected `(rows, columns)`; inferred from the largest indices when unset
    pub tile_grid: Option<(usize, usize)>,
}

impl LightSheetParams {
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            tile_grid: None,
        }
    }

    pub fn with_tile_grid(mut self, rows: usize, columns: usize) -> Self {
        self.tile_grid = Some((rows, columns));
        self
    }
}

/// Parsed `<prefix>_z<ZZ>_y<YY><suffix>` tile file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TileName {
    pub prefix: String,
    pub z: usize,
    pub y: usize,
    pub suffix: String,
}

fn leading_digits(s: &str) -> usize {
    s.len() - s.trim_start_matches(|c: char| c.is_ascii_digit()).len()
}

pub(crate) fn parse_tile_name(file_name: &str) -> Option<TileName> {
    let dot = file_name.rfind('.')?;
    let ext = file_name[dot + 1..].to_ascii_lowercase();
    if ext != "tif" && ext != "tiff" {
        return None;
    }
    let stem = &file_name[..dot];

    // The last `_z<digits>_y<digits>` wins, so prefixes may contain `_z`
    for (idx, _) in stem.match_indices("_z").collect::<Vec<_>>().into_iter().rev() {
        let rest = &stem[idx + 2..];
        let z_len = leading_digits(rest);
        if z_len == 0 {
            continue;
        }
        let Some(after) = rest[z_len..].strip_prefix("_y") else {
            continue;
        };
        let y_len = leading_digits(after);
        if y_len == 0 {
            continue;
        }
        let (Ok(z), Ok(y)) = (rest[..z_len].parse(), after[..y_len].parse()) else {
            continue;
        };
        return Some(TileName {
            prefix: stem[..idx].to_string(),
            z,
            y,
            suffix: after[y_len..].to_string(),
        });
    }
    None
}

/// Whether `dir` holds at least one file named like a mosaic tile
pub fn contains_tiles(dir: &Path) -> Result<bool> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if parse_tile_name(&entry.file_name().to_string_lossy()).is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug)]
struct Tile {
    path: PathBuf,
    info: TiffInfo,
    region: Region,
}

pub struct LightSheetReader {
    directory: PathBuf,
    grid: (usize, usize),
    tiles: Vec<Tile>,
    data_type: DataType,
    shape: Vec<usize>,
    spacing: PixelSpacing,
    cache: TileCache<usize>,
}

fn tile_label(z: usize, y: usize) -> String {
    format!("z={:02} y={:02}", z, y)
}

impl LightSheetReader {
    /// Scan the directory, check the tile grid and inspect every tile
    pub fn open(params: LightSheetParams, cache_capacity: usize) -> Result<Self> {
        let directory = params.directory;
        let mut named = Vec::new();
        for entry in std::fs::read_dir(&directory)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match parse_tile_name(&file_name) {
                Some(name) => named.push((name, path)),
                None => debug!(file = %file_name, "skipping non-tile file"),
            }
        }
        if named.is_empty() {
            return Err(ConvertError::malformed(format!(
                "{} holds no *_zNN_yNN*.tif tiles",
                directory.display()
            )));
        }
        named.sort_by(|a, b| (a.0.z, a.0.y, &a.1).cmp(&(b.0.z, b.0.y, &b.1)));

        let (pattern_prefix, pattern_suffix) = (named[0].0.prefix.clone(), named[0].0.suffix.clone());
        let mut by_index: BTreeMap<(usize, usize), PathBuf> = BTreeMap::new();
        for (name, path) in named {
            if name.prefix != pattern_prefix || name.suffix != pattern_suffix {
                return Err(ConvertError::malformed(format!(
                    "{} does not follow the naming of {}_zNN_yNN{}",
                    path.display(),
                    pattern_prefix,
                    pattern_suffix
                )));
            }
            if name.z == 0 || name.y == 0 {
                return Err(ConvertError::malformed(format!(
                    "{}: tile indices start at 1",
                    path.display()
                )));
            }
            if let Some(previous) = by_index.insert((name.z, name.y), path.clone()) {
                return Err(ConvertError::malformed(format!(
                    "tile {} appears twice: {} and {}",
                    tile_label(name.z, name.y),
                    previous.display(),
                    path.display()
                )));
            }
        }

        let inferred = (
            by_index.keys().map(|&(z, _)| z).max().unwrap_or(0),
            by_index.keys().map(|&(_, y)| y).max().unwrap_or(0),
        );
        let (rows, columns) = match params.tile_grid {
            Some((rows, columns)) => {
                if inferred.0 > rows || inferred.1 > columns {
                    let &(z, y) = by_index
                        .keys()
                        .find(|&&(z, y)| z > rows || y > columns)
                        .unwrap_or(&inferred);
                    return Err(ConvertError::malformed(format!(
                        "tile {} lies outside the {}x{} grid",
                        tile_label(z, y),
                        rows,
                        columns
                    )));
                }
                (rows, columns)
            }
            None => inferred,
        };

        for z in 1..=rows {
            for y in 1..=columns {
                if !by_index.contains_key(&(z, y)) {
                    return Err(ConvertError::malformed(format!(
                        "missing tile {} ({}_z{:02}_y{:02}{}.tif) in {}",
                        tile_label(z, y),
                        pattern_prefix,
                        z,
                        y,
                        pattern_suffix,
                        directory.display()
                    )));
                }
            }
        }

        let mut infos = BTreeMap::new();
        for (&index, path) in &by_index {
            let info = inspect_tiff(path)?;
            if info.format.channels != 1 {
                return Err(ConvertError::malformed(format!(
                    "{}: tiles must be single-channel, found {} channels",
                    path.display(),
                    info.format.channels
                )));
            }
            infos.insert(index, info);
        }

        let first = &infos[&(1, 1)];
        let (data_type, width) = (first.format.data_type, first.width);
        let mut z_offsets = vec![0; rows + 1];
        let mut y_offsets = vec![0; columns + 1];
        for z in 1..=rows {
            z_offsets[z] = z_offsets[z - 1] + infos[&(z, 1)].pages;
        }
        for y in 1..=columns {
            y_offsets[y] = y_offsets[y - 1] + infos[&(1, y)].height;
        }

        let mut tiles = Vec::with_capacity(rows * columns);
        for (&(z, y), info) in &infos {
            let path = &by_index[&(z, y)];
            let row_pages = infos[&(z, 1)].pages;
            let column_height = infos[&(1, y)].height;
            if info.pages != row_pages {
                return Err(ConvertError::malformed(format!(
                    "tile {} has {} planes, row z={:02} has {}",
                    tile_label(z, y),
                    info.pages,
                    z,
                    row_pages
                )));
            }
            if info.height != column_height {
                return Err(ConvertError::malformed(format!(
                    "tile {} is {} rows tall, column y={:02} is {}",
                    tile_label(z, y),
                    info.height,
                    y,
                    column_height
                )));
            }
            if info.width != width || info.format.data_type != data_type {
                return Err(ConvertError::malformed(format!(
                    "tile {} is {} wide with {} samples, tile {} is {} wide with {}",
                    tile_label(z, y),
                    info.width,
                    info.format.data_type,
                    tile_label(1, 1),
                    width,
                    data_type
                )));
            }
            tiles.push(Tile {
                path: path.clone(),
                info: info.clone(),
                region: Region::new(
                    vec![z_offsets[z - 1], y_offsets[y - 1], 0],
                    vec![info.pages, info.height, width],
                ),
            });
        }

        let spacing = tiff_spacing(first);
        for tile in &tiles[1..] {
            if tiff_spacing(&tile.info) != spacing {
                warn!(path = %tile.path.display(), "tile resolution differs from the first tile");
            }
        }

        let shape = vec![z_offsets[rows], y_offsets[columns], width];
        info!(
            directory = %directory.display(),
            rows,
            columns,
            shape = ?shape,
            %data_type,
            "opened light-sheet mosaic"
        );

        Ok(Self {
            directory,
            grid: (rows, columns),
            tiles,
            data_type,
            shape,
            spacing,
            cache: TileCache::new(cache_capacity),
        })
    }

    pub fn modality(&self) -> Modality {
        Modality::LightSheet
    }

    /// Grid size as `(rows, columns)`
    pub fn grid(&self) -> (usize, usize) {
        self.grid
    }

    pub fn name(&self) -> String {
        self.directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mosaic".to_string())
    }

    fn load(&self, index: usize) -> Result<VolumeBuffer> {
        let tile = &self.tiles[index];
        debug!(path = %tile.path.display(), "decoding tile");
        let pages = read_tiff_pages(&tile.path, &tile.info)?;
        let mut buffer = VolumeBuffer::zeros(self.data_type, &tile.region.shape);
        for (p, page) in pages.iter().enumerate() {
            buffer.assign(
                &Region::new(vec![p, 0, 0], vec![1, tile.info.height, tile.info.width]),
                page,
            )?;
        }
        Ok(buffer)
    }

    pub fn source_metadata(&self) -> SourceMetadata {
        let mut metadata = SourceMetadata::new(Modality::LightSheet.tag(), "zyx");
        for (axis, value) in [('z', self.spacing.z), ('y', self.spacing.y), ('x', self.spacing.x)] {
            if let Some(value) = value {
                metadata = metadata.with_spacing(axis, value);
            }
        }
        if let Some(unit) = &self.spacing.unit {
            metadata = metadata.with_unit(unit.clone());
        }
        metadata.with_attribute("TileGrid", json!([self.grid.0, self.grid.1]))
    }
}

impl VolumeSource for LightSheetReader {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn read_region(&self, region: &Region) -> Result<VolumeBuffer> {
        check_region(region, &self.shape)?;
        let mut out = VolumeBuffer::zeros(self.data_type, &region.shape);
        for (index, tile) in self.tiles.iter().enumerate() {
            if tile.region.intersect(region).is_none() {
                continue;
            }
            let samples = self.cache.get_or_load(&index, || self.load(index))?;
            copy_overlap(&mut out, region, &samples, &tile.region)?;
        }
        Ok(out)
    }
}
