//! Chunk codecs, expressed as numcodecs compressor ids in `.zarray`

use crate::error::{ConvertError, Result};
use flate2::read::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

/// Compression methods supported for chunk payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// No compression (`"compressor": null`)
    None,
    /// zlib stream (numcodecs `zlib`)
    Zlib,
    /// gzip stream (numcodecs `gzip`)
    Gzip,
    /// Zstandard (numcodecs `zstd`)
    Zstd,
}

impl CompressionMethod {
    /// numcodecs compressor id, `None` for raw chunks
    pub fn codec_id(&self) -> Option<&'static str> {
        match self {
            CompressionMethod::None => None,
            CompressionMethod::Zlib => Some("zlib"),
            CompressionMethod::Gzip => Some("gzip"),
            CompressionMethod::Zstd => Some("zstd"),
        }
    }

    /// Default level for this method
    pub fn default_level(&self) -> CompressionLevel {
        match self {
            CompressionMethod::None => CompressionLevel::none(),
            CompressionMethod::Zstd => CompressionLevel(3),
            _ => CompressionLevel::default(),
        }
    }

    /// Highest accepted level for this method
    pub fn max_level(&self) -> u8 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Zstd => 22,
            _ => 9,
        }
    }

    /// `compressor` entry of a `.zarray` document
    pub fn to_metadata(&self, level: CompressionLevel) -> Value {
        match self.codec_id() {
            None => Value::Null,
            Some(id) => json!({ "id": id, "level": level.value() }),
        }
    }

    /// Parse a `compressor` entry of a `.zarray` document
    pub fn from_metadata(value: &Value) -> Result<(Self, CompressionLevel)> {
        if value.is_null() {
            return Ok((CompressionMethod::None, CompressionLevel::none()));
        }
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ConvertError::malformed("compressor entry without an id"))?;
        let method: CompressionMethod = id
            .parse()
            .map_err(|_| ConvertError::Codec(format!("unsupported compressor {:?}", id)))?;
        let level = value
            .get("level")
            .and_then(Value::as_u64)
            .map(|l| CompressionLevel(l.min(method.max_level() as u64) as u8))
            .unwrap_or_else(|| method.default_level());
        Ok((method, level))
    }
}

impl FromStr for CompressionMethod {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "none" => Ok(CompressionMethod::None),
            "zlib" => Ok(CompressionMethod::Zlib),
            "gzip" => Ok(CompressionMethod::Gzip),
            "zstd" => Ok(CompressionMethod::Zstd),
            "blosc" => Err(ConvertError::InvalidConfig(
                "blosc compression is not available; use zstd, zlib, gzip or raw".to_string(),
            )),
            other => Err(ConvertError::InvalidConfig(format!(
                "unknown compression {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.codec_id().unwrap_or("raw"))
    }
}

/// Compression level; the accepted range depends on the method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    pub fn new(level: u8) -> Self {
        Self(level.min(22))
    }

    pub fn none() -> Self {
        Self(0)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Check the level against the method's range
    pub fn validate_for(&self, method: CompressionMethod) -> Result<()> {
        if self.0 > method.max_level() {
            return Err(ConvertError::InvalidConfig(format!(
                "compression level {} out of range for {} (max {})",
                self.0,
                method,
                method.max_level()
            )));
        }
        Ok(())
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

/// Trait for compression/decompression operations
pub trait Compressor: Send + Sync {
    /// Compress data
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>>;

    /// Get the compression method
    fn method(&self) -> CompressionMethod;
}

fn read_all(mut reader: impl Read, expected_size: Option<usize>) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_size.unwrap_or(0));
    reader.read_to_end(&mut out)?;
    Ok(out)
}

/// Raw chunks
#[derive(Debug, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compress(&self, data: &[u8], _level: CompressionLevel) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }
}

#[derive(Debug, Default)]
pub struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let level = FlateCompression::new(level.value().min(9) as u32);
        read_all(ZlibEncoder::new(data, level), None)
            .map_err(|e| ConvertError::Codec(format!("zlib compression failed: {}", e)))
    }

    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
        read_all(ZlibDecoder::new(data), expected_size)
            .map_err(|e| ConvertError::Codec(format!("zlib decompression failed: {}", e)))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zlib
    }
}

#[derive(Debug, Default)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let level = FlateCompression::new(level.value().min(9) as u32);
        read_all(GzEncoder::new(data, level), None)
            .map_err(|e| ConvertError::Codec(format!("gzip compression failed: {}", e)))
    }

    fn decompress(&self, data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
        read_all(GzDecoder::new(data), expected_size)
            .map_err(|e| ConvertError::Codec(format!("gzip decompression failed: {}", e)))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Gzip
    }
}

/// Zstandard compression
#[derive(Debug, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        zstd::encode_all(data, level.value() as i32)
            .map_err(|e| ConvertError::Codec(format!("zstd compression failed: {}", e)))
    }

    fn decompress(&self, data: &[u8], _expected_size: Option<usize>) -> Result<Vec<u8>> {
        zstd::decode_all(data)
            .map_err(|e| ConvertError::Codec(format!("zstd decompression failed: {}", e)))
    }

    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }
}

/// Get a compressor for a given method
pub fn get_compressor(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::None => Box::new(NoneCompressor),
        CompressionMethod::Zlib => Box::new(ZlibCompressor),
        CompressionMethod::Gzip => Box::new(GzipCompressor),
        CompressionMethod::Zstd => Box::new(ZstdCompressor),
    }
}
