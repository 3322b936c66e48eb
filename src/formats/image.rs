//! PNG and TIFF decoding into planar sample buffers

use crate::error::{ConvertError, Result};
use crate::types::DataType;
use crate::volume::{Element, VolumeBuffer};
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tiff::ColorType;

/// Sample layout of a decoded raster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PixelFormat {
    /// Interleaved samples per pixel in the file
    pub samples_per_pixel: usize,
    /// Samples kept per pixel (alpha is dropped)
    pub channels: usize,
    pub data_type: DataType,
}

/// Header-level facts about a TIFF file
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TiffInfo {
    pub width: usize,
    pub height: usize,
    pub pages: usize,
    pub format: PixelFormat,
    pub x_resolution: Option<f64>,
    pub y_resolution: Option<f64>,
    /// TIFF `ResolutionUnit`: 1 none, 2 inch, 3 centimetre
    pub resolution_unit: u16,
    pub description: Option<String>,
}

fn tiff_error(path: &Path, err: tiff::TiffError) -> ConvertError {
    match err {
        tiff::TiffError::IoError(e) => ConvertError::Io(e),
        other => ConvertError::malformed(format!("{}: {}", path.display(), other)),
    }
}

fn png_error(path: &Path, err: png::DecodingError) -> ConvertError {
    match err {
        png::DecodingError::IoError(e) => ConvertError::Io(e),
        other => ConvertError::malformed(format!("{}: {}", path.display(), other)),
    }
}

fn open_tiff(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = BufReader::new(File::open(path)?);
    Decoder::new(file)
        .map(|d| d.with_limits(Limits::unlimited()))
        .map_err(|e| tiff_error(path, e))
}

fn tag_u16(decoder: &mut Decoder<BufReader<File>>, tag: Tag) -> Option<u16> {
    match decoder.find_tag(tag).ok().flatten()? {
        tiff::decoder::ifd::Value::List(items) => items.into_iter().next()?.into_u16().ok(),
        value => value.into_u16().ok(),
    }
}

fn tag_rational(decoder: &mut Decoder<BufReader<File>>, tag: Tag) -> Option<f64> {
    match decoder.find_tag(tag).ok().flatten()? {
        tiff::decoder::ifd::Value::Rational(n, d) if d != 0 => Some(n as f64 / d as f64),
        value => value.into_f64().ok(),
    }
}

fn tiff_format(path: &Path, color: ColorType, sample_format: u16) -> Result<PixelFormat> {
    let (samples_per_pixel, channels, bits) = match color {
        ColorType::Gray(b) => (1, 1, b),
        ColorType::GrayA(b) => (2, 1, b),
        ColorType::RGB(b) => (3, 3, b),
        ColorType::RGBA(b) => (4, 3, b),
        other => {
            return Err(ConvertError::malformed(format!(
                "{}: unsupported colour type {:?}",
                path.display(),
                other
            )))
        }
    };
    // SampleFormat: 1 unsigned, 2 signed, 3 IEEE float
    let data_type = match (bits, sample_format) {
        (8, 2) => DataType::I8,
        (8, _) => DataType::U8,
        (16, 2) => DataType::I16,
        (16, _) => DataType::U16,
        (32, 2) => DataType::I32,
        (32, 3) => DataType::F32,
        (32, _) => DataType::U32,
        (64, 3) => DataType::F64,
        _ => {
            return Err(ConvertError::malformed(format!(
                "{}: unsupported {}-bit samples (format {})",
                path.display(),
                bits,
                sample_format
            )))
        }
    };
    Ok(PixelFormat {
        samples_per_pixel,
        channels,
        data_type,
    })
}

/// Read the header of every page without decoding samples.
///
/// All pages must share dimensions and sample layout.
pub(crate) fn inspect_tiff(path: &Path) -> Result<TiffInfo> {
    let mut decoder = open_tiff(path)?;
    let (width, height) = decoder.dimensions().map_err(|e| tiff_error(path, e))?;
    let color = decoder.colortype().map_err(|e| tiff_error(path, e))?;
    let sample_format = tag_u16(&mut decoder, Tag::SampleFormat).unwrap_or(1);
    let format = tiff_format(path, color, sample_format)?;
    let x_resolution = tag_rational(&mut decoder, Tag::XResolution);
    let y_resolution = tag_rational(&mut decoder, Tag::YResolution);
    let resolution_unit = tag_u16(&mut decoder, Tag::ResolutionUnit).unwrap_or(2);
    let description = decoder.get_tag_ascii_string(Tag::ImageDescription).ok();

    let mut pages = 1;
    while decoder.more_images() {
        decoder.next_image().map_err(|e| tiff_error(path, e))?;
        let dims = decoder.dimensions().map_err(|e| tiff_error(path, e))?;
        let page_color = decoder.colortype().map_err(|e| tiff_error(path, e))?;
        if dims != (width, height) || page_color != color {
            return Err(ConvertError::malformed(format!(
                "{}: page {} is {}x{} {:?}, first page is {}x{} {:?}",
                path.display(),
                pages,
                dims.0,
                dims.1,
                page_color,
                width,
                height,
                color
            )));
        }
        pages += 1;
    }

    Ok(TiffInfo {
        width: width as usize,
        height: height as usize,
        pages,
        format,
        x_resolution,
        y_resolution,
        resolution_unit,
        description,
    })
}

/// Physical sample spacing recovered from image headers
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PixelSpacing {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub unit: Option<String>,
}

/// `key=value` lines of an ImageJ `ImageDescription`
fn imagej_entries(description: &str) -> Option<BTreeMap<String, String>> {
    if !description.starts_with("ImageJ=") {
        return None;
    }
    Some(
        description
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect(),
    )
}

pub(crate) fn tiff_spacing(info: &TiffInfo) -> PixelSpacing {
    let imagej = info.description.as_deref().and_then(imagej_entries);
    let imagej_unit = imagej.as_ref().and_then(|e| e.get("unit")).map(|u| {
        // ImageJ escapes the micro sign
        if u == "\\u00B5m" || u == "micron" {
            "um".to_string()
        } else {
            u.clone()
        }
    });
    let z = imagej
        .as_ref()
        .and_then(|e| e.get("spacing"))
        .and_then(|s| s.parse::<f64>().ok());

    let invert = |resolution: Option<f64>, per_unit: f64| {
        resolution
            .filter(|r| r.is_finite() && *r > 0.0)
            .map(|r| per_unit / r)
    };

    match (info.resolution_unit, imagej_unit) {
        (1, Some(unit)) => PixelSpacing {
            x: invert(info.x_resolution, 1.0),
            y: invert(info.y_resolution, 1.0),
            z,
            unit: Some(unit),
        },
        // 72 dpi is the writer default, not a measurement
        (2, _) if info.x_resolution == Some(72.0) => PixelSpacing {
            z,
            ..Default::default()
        },
        (2, _) => PixelSpacing {
            x: invert(info.x_resolution, 25_400.0),
            y: invert(info.y_resolution, 25_400.0),
            z,
            unit: Some("micrometer".to_string()),
        },
        (3, _) => PixelSpacing {
            x: invert(info.x_resolution, 10_000.0),
            y: invert(info.y_resolution, 10_000.0),
            z,
            unit: Some("micrometer".to_string()),
        },
        (_, unit) => PixelSpacing {
            z,
            unit,
            ..Default::default()
        },
    }
}

/// Spacing from a PNG `pHYs` chunk; only metre-based densities are physical
pub(crate) fn png_spacing(info: &png::Info) -> PixelSpacing {
    let per_metre = |ppu: u32| (ppu > 0).then(|| 1e6 / ppu as f64);
    match info.pixel_dims {
        Some(dims) if matches!(dims.unit, png::Unit::Meter) => PixelSpacing {
            x: per_metre(dims.xppu),
            y: per_metre(dims.yppu),
            z: None,
            unit: Some("micrometer".to_string()),
        },
        _ => PixelSpacing::default(),
    }
}

/// Split interleaved pixels into `[channels, height, width]` planes
fn planes<T: Element>(
    values: Vec<T>,
    height: usize,
    width: usize,
    format: &PixelFormat,
) -> Result<VolumeBuffer> {
    let interleaved =
        ArrayD::from_shape_vec(IxDyn(&[height, width, format.samples_per_pixel]), values)
            .map_err(|e| ConvertError::malformed(format!("decoded image size mismatch: {}", e)))?;
    let planar = interleaved
        .slice_axis(Axis(2), Slice::from(0..format.channels))
        .permuted_axes(vec![2, 0, 1])
        .as_standard_layout()
        .into_owned();
    Ok(planar.into())
}

fn decoded_planes(
    path: &Path,
    result: DecodingResult,
    height: usize,
    width: usize,
    format: &PixelFormat,
) -> Result<VolumeBuffer> {
    let buffer = match result {
        DecodingResult::U8(v) => planes(v, height, width, format)?,
        DecodingResult::U16(v) => planes(v, height, width, format)?,
        DecodingResult::U32(v) => planes(v, height, width, format)?,
        DecodingResult::I8(v) => planes(v, height, width, format)?,
        DecodingResult::I16(v) => planes(v, height, width, format)?,
        DecodingResult::I32(v) => planes(v, height, width, format)?,
        DecodingResult::F32(v) => planes(v, height, width, format)?,
        DecodingResult::F64(v) => planes(v, height, width, format)?,
        _ => {
            return Err(ConvertError::malformed(format!(
                "{}: unsupported sample type",
                path.display()
            )))
        }
    };
    if buffer.data_type() != format.data_type {
        return Err(ConvertError::malformed(format!(
            "{}: decoded {} samples, header announced {}",
            path.display(),
            buffer.data_type(),
            format.data_type
        )));
    }
    Ok(buffer)
}

/// Decode every page of a TIFF, each as `[channels, height, width]`
pub(crate) fn read_tiff_pages(path: &Path, info: &TiffInfo) -> Result<Vec<VolumeBuffer>> {
    let mut decoder = open_tiff(path)?;
    let mut pages = Vec::with_capacity(info.pages);
    loop {
        let result = decoder.read_image().map_err(|e| tiff_error(path, e))?;
        pages.push(decoded_planes(
            path,
            result,
            info.height,
            info.width,
            &info.format,
        )?);
        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(|e| tiff_error(path, e))?;
    }
    if pages.len() != info.pages {
        return Err(ConvertError::malformed(format!(
            "{}: decoded {} pages, expected {}",
            path.display(),
            pages.len(),
            info.pages
        )));
    }
    Ok(pages)
}

fn open_png(path: &Path) -> Result<png::Reader<BufReader<File>>> {
    let mut decoder = png::Decoder::new(BufReader::new(File::open(path)?));
    // Palette and sub-byte images come out as 8-bit samples
    decoder.set_transformations(png::Transformations::EXPAND);
    decoder.read_info().map_err(|e| png_error(path, e))
}

fn png_format(path: &Path, reader: &png::Reader<BufReader<File>>) -> Result<PixelFormat> {
    let (color, depth) = reader.output_color_type();
    let (samples_per_pixel, channels) = match color {
        png::ColorType::Grayscale => (1, 1),
        png::ColorType::GrayscaleAlpha => (2, 1),
        png::ColorType::Rgb => (3, 3),
        png::ColorType::Rgba => (4, 3),
        png::ColorType::Indexed => {
            return Err(ConvertError::malformed(format!(
                "{}: palette was not expanded",
                path.display()
            )))
        }
    };
    let data_type = match depth {
        png::BitDepth::Sixteen => DataType::U16,
        _ => DataType::U8,
    };
    Ok(PixelFormat {
        samples_per_pixel,
        channels,
        data_type,
    })
}

/// Header-level facts about a PNG file
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PngInfo {
    pub width: usize,
    pub height: usize,
    pub format: PixelFormat,
    pub spacing: PixelSpacing,
}

/// Read a PNG header without decoding samples
pub(crate) fn inspect_png(path: &Path) -> Result<PngInfo> {
    let reader = open_png(path)?;
    let info = reader.info();
    Ok(PngInfo {
        width: info.width as usize,
        height: info.height as usize,
        format: png_format(path, &reader)?,
        spacing: png_spacing(info),
    })
}

/// Decode a PNG as `[channels, height, width]`
pub(crate) fn read_png(path: &Path) -> Result<VolumeBuffer> {
    let mut reader = open_png(path)?;
    let format = png_format(path, &reader)?;
    let size = reader.output_buffer_size().ok_or_else(|| {
        ConvertError::malformed(format!("{}: image too large to decode", path.display()))
    })?;
    let mut raw = vec![0u8; size];
    let frame = reader.next_frame(&mut raw).map_err(|e| png_error(path, e))?;
    raw.truncate(frame.buffer_size());
    let (height, width) = (frame.height as usize, frame.width as usize);
    let row = frame.line_size;
    let bytes_per_row = width * format.samples_per_pixel * format.data_type.size_in_bytes();

    // Rows may carry padding beyond the pixel data
    let packed: Vec<u8> = if row == bytes_per_row {
        raw
    } else {
        raw.chunks(row)
            .flat_map(|r| r[..bytes_per_row.min(r.len())].iter().copied())
            .collect()
    };

    match format.data_type {
        DataType::U16 => {
            let samples = packed
                .chunks_exact(2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .collect();
            planes::<u16>(samples, height, width, &format)
        }
        _ => planes::<u8>(packed, height, width, &format),
    }
}
