//! Chunk compressors.
//!
//! Every block payload is compressed independently with the dataset's
//! [`Compression`].  The compression setting is recorded in the dataset
//! metadata, so a generic reader can decode blocks without external hints.
//!
//! # Stream formats
//! - `Gzip` writes RFC 1952 gzip members (N5 `gzip`, numcodecs `gzip`).
//! - `Zstd` writes a single zstd frame.
//! - `Xz` writes an xz container (N5 `xz`).
//!
//! These codecs frame N5 blocks.  OME-Zarr chunks go through the zarrs codec
//! chain instead, configured from the same [`Compression`]; which layouts
//! accept which compression is decided by [`Layout`](crate::writer::Layout).

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default zstd level, matching the zstd CLI.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;
/// Default gzip level.
pub const DEFAULT_GZIP_LEVEL: i32 = 6;

// ── Compression setting ──────────────────────────────────────────────────────

/// Per-dataset compression setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Compression {
    Raw,
    Gzip { level: i32 },
    Zstd { level: i32 },
    Xz,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Gzip { level: DEFAULT_GZIP_LEVEL }
    }
}

impl Compression {
    /// Human-readable name, also the CLI spelling.
    pub fn name(self) -> &'static str {
        match self {
            Compression::Raw         => "raw",
            Compression::Gzip { .. } => "gzip",
            Compression::Zstd { .. } => "zstd",
            Compression::Xz          => "xz",
        }
    }

    /// Parse from a CLI string. `level` is ignored by codecs without levels;
    /// `None` selects the codec default.
    pub fn from_name(s: &str, level: Option<i32>) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "raw" | "none" => Some(Compression::Raw),
            "gzip"         => Some(Compression::Gzip { level: level.unwrap_or(DEFAULT_GZIP_LEVEL) }),
            "zstd"         => Some(Compression::Zstd { level: level.unwrap_or(DEFAULT_ZSTD_LEVEL) }),
            "xz" | "lzma"  => Some(Compression::Xz),
            _              => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn compression(&self) -> Compression;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct RawCodec;
impl Codec for RawCodec {
    fn compression(&self) -> Compression { Compression::Raw }
    fn compress(&self, data: &[u8])   -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub struct GzipCodec {
    pub level: i32,
}
impl Codec for GzipCodec {
    fn compression(&self) -> Compression { Compression::Gzip { level: self.level } }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        // N5 writes -1 for "library default".
        let level = if self.level < 0 { DEFAULT_GZIP_LEVEL } else { self.level.min(9) };
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::new(level as u32));
        enc.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        enc.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct ZstdCodec {
    pub level: i32,
}
impl Codec for ZstdCodec {
    fn compression(&self) -> Compression { Compression::Zstd { level: self.level } }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, self.level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct XzCodec;
impl Codec for XzCodec {
    fn compression(&self) -> Compression { Compression::Xz }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::xz_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::xz_decompress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a compression setting to its codec.
pub fn get_codec(compression: Compression) -> Box<dyn Codec> {
    match compression {
        Compression::Raw             => Box::new(RawCodec),
        Compression::Gzip { level }  => Box::new(GzipCodec { level }),
        Compression::Zstd { level }  => Box::new(ZstdCodec { level }),
        Compression::Xz              => Box::new(XzCodec),
    }
}
