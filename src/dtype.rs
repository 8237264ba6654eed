//! Pixel types.
//!
//! [`DataType`] is the runtime tag written into dataset metadata; [`Pixel`] is
//! the compile-time counterpart implemented for every supported primitive.
//! The export engine is generic over `T: Pixel`, so the per-sample work
//! (accumulation for averaging, byte-order conversion) is monomorphised.
//!
//! # Accumulation
//! Integer pixels accumulate in `i128` and floating-point pixels in `f64`.
//! Means of integer pixels are rounded half away from zero, which keeps the
//! result independent of summation order and never overflows for any
//! realistic cell size.

use byteorder::ByteOrder;
use std::fmt;
use zarrs::array::ElementOwned;

use crate::error::{ExportError, Result};

/// Runtime pixel type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float32,
    Float64,
}

impl DataType {
    pub const ALL: [DataType; 10] = [
        DataType::Uint8,  DataType::Int8,
        DataType::Uint16, DataType::Int16,
        DataType::Uint32, DataType::Int32,
        DataType::Uint64, DataType::Int64,
        DataType::Float32, DataType::Float64,
    ];

    /// Size of one sample in bytes.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            DataType::Uint8  | DataType::Int8                      => 1,
            DataType::Uint16 | DataType::Int16                     => 2,
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::Uint64 | DataType::Int64 | DataType::Float64 => 8,
        }
    }

    /// N5 `dataType` attribute value. Also used on the command line.
    pub fn name(self) -> &'static str {
        match self {
            DataType::Uint8   => "uint8",
            DataType::Int8    => "int8",
            DataType::Uint16  => "uint16",
            DataType::Int16   => "int16",
            DataType::Uint32  => "uint32",
            DataType::Int32   => "int32",
            DataType::Uint64  => "uint64",
            DataType::Int64   => "int64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }

    /// Zarr v2 `dtype` string. Multi-byte types are stored little-endian.
    pub fn zarr_dtype(self) -> &'static str {
        match self {
            DataType::Uint8   => "|u1",
            DataType::Int8    => "|i1",
            DataType::Uint16  => "<u2",
            DataType::Int16   => "<i2",
            DataType::Uint32  => "<u4",
            DataType::Int32   => "<i4",
            DataType::Uint64  => "<u8",
            DataType::Int64   => "<i8",
            DataType::Float32 => "<f4",
            DataType::Float64 => "<f8",
        }
    }

    /// Parse an N5-style type name. Unknown names are a configuration error.
    pub fn from_name(s: &str) -> Result<Self> {
        let lower = s.to_lowercase();
        DataType::ALL
            .iter()
            .copied()
            .find(|t| t.name() == lower)
            .ok_or_else(|| ExportError::UnsupportedPixelType(s.to_owned()))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Pixel trait ──────────────────────────────────────────────────────────────

/// A primitive sample type the engine can downsample and persist.
///
/// Every pixel type is also a zarrs element, so OME-Zarr arrays store and
/// retrieve it without a byte-level detour.
pub trait Pixel:
    Copy + Default + PartialEq + PartialOrd + fmt::Debug + Send + Sync + ElementOwned + 'static
{
    const DATA_TYPE: DataType;

    /// Accumulator used by averaging; wider than `Self`.
    type Sum: Copy + Default + Send;

    fn accumulate(sum: Self::Sum, value: Self) -> Self::Sum;

    /// Mean of `count` accumulated samples, converted back to `Self`.
    fn mean(sum: Self::Sum, count: u64) -> Self;

    /// Serialize `src` into `dst` (`dst.len() == src.len() * size_of::<Self>()`).
    fn encode<B: ByteOrder>(src: &[Self], dst: &mut [u8]);

    /// Deserialize `src` into `dst` (`src.len() == dst.len() * size_of::<Self>()`).
    fn decode<B: ByteOrder>(src: &[u8], dst: &mut [Self]);
}

#[inline]
fn round_div(sum: i128, count: i128) -> i128 {
    if sum >= 0 {
        (2 * sum + count) / (2 * count)
    } else {
        -((-2 * sum + count) / (2 * count))
    }
}

macro_rules! integer_pixel {
    (@impl $t:ty, $dt:expr, $($codec:tt)*) => {
        impl Pixel for $t {
            const DATA_TYPE: DataType = $dt;
            type Sum = i128;

            #[inline]
            fn accumulate(sum: i128, value: Self) -> i128 {
                sum + value as i128
            }

            #[inline]
            fn mean(sum: i128, count: u64) -> Self {
                round_div(sum, count.max(1) as i128) as $t
            }

            $($codec)*
        }
    };
    // one byte per sample: byte order does not apply
    ($t:ty, $dt:expr, single_byte) => {
        integer_pixel!(@impl $t, $dt,
            fn encode<B: ByteOrder>(src: &[Self], dst: &mut [u8]) {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = *s as u8;
                }
            }

            fn decode<B: ByteOrder>(src: &[u8], dst: &mut [Self]) {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = *s as $t;
                }
            }
        );
    };
    ($t:ty, $dt:expr, $write:ident, $read:ident) => {
        integer_pixel!(@impl $t, $dt,
            fn encode<B: ByteOrder>(src: &[Self], dst: &mut [u8]) {
                B::$write(src, dst)
            }

            fn decode<B: ByteOrder>(src: &[u8], dst: &mut [Self]) {
                B::$read(src, dst)
            }
        );
    };
}

macro_rules! float_pixel {
    ($t:ty, $dt:expr, $write:ident, $read:ident) => {
        impl Pixel for $t {
            const DATA_TYPE: DataType = $dt;
            type Sum = f64;

            #[inline]
            fn accumulate(sum: f64, value: Self) -> f64 {
                sum + value as f64
            }

            #[inline]
            fn mean(sum: f64, count: u64) -> Self {
                (sum / count.max(1) as f64) as $t
            }

            fn encode<B: ByteOrder>(src: &[Self], dst: &mut [u8]) {
                B::$write(src, dst)
            }

            fn decode<B: ByteOrder>(src: &[u8], dst: &mut [Self]) {
                B::$read(src, dst)
            }
        }
    };
}

integer_pixel!(u8,  DataType::Uint8,  single_byte);
integer_pixel!(i8,  DataType::Int8,   single_byte);
integer_pixel!(u16, DataType::Uint16, write_u16_into, read_u16_into);
integer_pixel!(i16, DataType::Int16,  write_i16_into, read_i16_into);
integer_pixel!(u32, DataType::Uint32, write_u32_into, read_u32_into);
integer_pixel!(i32, DataType::Int32,  write_i32_into, read_i32_into);
integer_pixel!(u64, DataType::Uint64, write_u64_into, read_u64_into);
integer_pixel!(i64, DataType::Int64,  write_i64_into, read_i64_into);
float_pixel!(f32, DataType::Float32, write_f32_into, read_f32_into);
float_pixel!(f64, DataType::Float64, write_f64_into, read_f64_into);

// ── Buffer helpers ───────────────────────────────────────────────────────────

/// Serialize samples with byte order `B`.
pub fn encode_samples<T: Pixel, B: ByteOrder>(samples: &[T]) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * T::DATA_TYPE.bytes_per_sample()];
    T::encode::<B>(samples, &mut out);
    out
}

/// Deserialize exactly `len` samples with byte order `B`.
pub fn decode_samples<T: Pixel, B: ByteOrder>(bytes: &[u8], len: usize) -> Result<Vec<T>> {
    let expected = len * T::DATA_TYPE.bytes_per_sample();
    if bytes.len() != expected {
        return Err(ExportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("expected {expected} bytes of {} samples, found {}", T::DATA_TYPE, bytes.len()),
        )));
    }
    let mut out = vec![T::default(); len];
    T::decode::<B>(bytes, &mut out);
    Ok(out)
}
