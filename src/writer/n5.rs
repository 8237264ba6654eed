//! N5 layout.
//!
//! # Layout
//! ```text
//! attributes.json                      {"n5": "4.0.0", ...}
//! [setup{s}/][timepoint{t}/]attributes.json   multiscale group attributes
//! [setup{s}/][timepoint{t}/]s{l}/attributes.json
//! [setup{s}/][timepoint{t}/]s{l}/{x}/{y}/{z}  blocks
//! ```
//! The `setup{s}` and `timepoint{t}` components appear only when the export
//! has more than one setup or timepoint respectively.
//!
//! # Block format (all fields big-endian)
//! ```text
//! Offset  Size     Field
//!      0     2     mode (0 = default)
//!      2     2     number of dimensions n
//!      4     4·n   block size per axis, x first
//!  4+4·n     …     compressed samples, big-endian, x fastest
//! ```
//! Boundary blocks are stored truncated to their true extent.
//!
//! Documents and blocks are plain keys of the zarrs [`Storage`]; zarrs has no
//! N5 array type, so blocks are framed and reassembled here.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;
use zarrs::storage::{ReadableStorageTraits, WritableStorageTraits};

use super::{
    axis_names, invalid_data, set_json, store_key, DatasetAttributes, DatasetHandle, DatasetKey, DatasetWriter,
    ExportDescription, Layout, Storage,
};
use crate::block::Block;
use crate::codec::{get_codec, Compression};
use crate::dtype::{decode_samples, encode_samples, Pixel};
use crate::error::{ExportError, Result};
use crate::region::{check_bounds, copy_overlap, num_elements};

/// N5 format version written into the root group.
pub const N5_VERSION: &str = "4.0.0";

const MODE_DEFAULT: u16 = 0;
const MODE_VARLENGTH: u16 = 1;

// ── Block header ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct N5BlockHeader {
    pub mode: u16,
    pub size: Vec<u32>,
}

impl N5BlockHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<BigEndian>(self.mode)?;
        writer.write_u16::<BigEndian>(self.size.len() as u16)?;
        for &s in &self.size {
            writer.write_u32::<BigEndian>(s)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mode = reader.read_u16::<BigEndian>()?;
        let rank = reader.read_u16::<BigEndian>()?;
        let size = (0..rank)
            .map(|_| reader.read_u32::<BigEndian>())
            .collect::<io::Result<Vec<u32>>>()?;
        if mode == MODE_VARLENGTH {
            // element count; equal to the product of the sizes for our types
            reader.read_u32::<BigEndian>()?;
        } else if mode != MODE_DEFAULT {
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown N5 block mode {mode}")));
        }
        Ok(Self { mode, size })
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        4 + 4 * self.size.len() + if self.mode == MODE_VARLENGTH { 4 } else { 0 }
    }
}

// ── Attributes ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasetAttributesJson<'a> {
    dimensions:           &'a [u64],
    block_size:           &'a [u32],
    data_type:            &'static str,
    compression:          Value,
    downsampling_factors: &'a [u32],
}

/// The `compression` object of an N5 dataset.
pub fn compression_json(compression: Compression) -> Value {
    match compression {
        Compression::Raw            => json!({ "type": "raw" }),
        Compression::Gzip { level } => json!({ "type": "gzip", "level": level, "useZlib": false }),
        Compression::Zstd { level } => json!({ "type": "zstd", "level": level }),
        Compression::Xz             => json!({ "type": "xz", "preset": 6 }),
    }
}

fn multiscale_attributes(description: &ExportDescription) -> Map<String, Value> {
    let mut attrs = Map::new();
    attrs.insert("multiScale".into(), json!(true));
    attrs.insert(
        "downsamplingFactors".into(),
        json!(description.levels.iter().map(|l| &l.factors_to_original).collect::<Vec<_>>()),
    );
    attrs.insert(
        "blockSizes".into(),
        json!(description.levels.iter().map(|l| &l.block_shape).collect::<Vec<_>>()),
    );
    attrs.insert("dataType".into(), json!(description.data_type.name()));
    attrs.insert("downsamplingMethod".into(), json!(description.method.name()));
    attrs.insert("resolution".into(), json!(description.voxel_size.size));
    attrs.insert("unit".into(), json!(description.voxel_size.unit));
    attrs.insert("axes".into(), json!(axis_names(description.dimensions.len())));
    if !description.name.is_empty() {
        attrs.insert("name".into(), json!(description.name));
    }
    attrs
}

fn join(group: &str, name: &str) -> String {
    if group.is_empty() {
        name.to_owned()
    } else {
        format!("{group}/{name}")
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct N5Writer {
    storage:        Storage,
    num_timepoints: usize,
    num_setups:     usize,
}

impl N5Writer {
    pub fn new(storage: Storage) -> Self {
        Self { storage, num_timepoints: 1, num_setups: 1 }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Group holding the levels of one timepoint/setup; `""` is the root.
    pub fn group_path(&self, timepoint: usize, setup: usize) -> String {
        let mut parts = Vec::new();
        if self.num_setups > 1 {
            parts.push(format!("setup{setup}"));
        }
        if self.num_timepoints > 1 {
            parts.push(format!("timepoint{timepoint}"));
        }
        parts.join("/")
    }

    pub fn dataset_path(&self, key: DatasetKey) -> String {
        join(&self.group_path(key.timepoint, key.setup), &format!("s{}", key.level))
    }

    fn set_json(&self, key: &str, value: &impl Serialize) -> Result<()> {
        set_json(&self.storage, key, value)
    }

    fn block_key(handle: &DatasetHandle, grid: &[u64]) -> String {
        let mut key = handle.path.clone();
        for g in grid {
            key.push('/');
            key.push_str(&g.to_string());
        }
        key
    }

    /// Samples of a written block, cropped to its true extent, or `None` if
    /// the block was never written.
    pub fn read_block<T: Pixel>(&self, handle: &DatasetHandle, grid: &[u64]) -> Result<Option<Vec<T>>> {
        let key = Self::block_key(handle, grid);
        let Some(bytes) = self.storage.get(&store_key(&key)?)? else {
            return Ok(None);
        };
        let mut cursor = io::Cursor::new(&bytes[..]);
        let header = N5BlockHeader::read(&mut cursor)?;
        let (_, size) = handle.attributes.block_interval(grid);
        if header.size.iter().map(|&s| s as u64).ne(size.iter().copied()) {
            return Err(invalid_data(format!(
                "block {key} has size {:?}, expected {size:?}",
                header.size
            )));
        }
        let payload = &bytes[cursor.position() as usize..];
        let raw = get_codec(handle.attributes.compression).decompress(payload)?;
        let len = size.iter().product::<u64>() as usize;
        decode_samples::<T, BigEndian>(&raw, len).map(Some)
    }
}

impl DatasetWriter for N5Writer {
    fn layout(&self) -> Layout {
        Layout::N5
    }

    fn begin_export(&mut self, description: &ExportDescription) -> Result<()> {
        self.num_timepoints = description.num_timepoints;
        self.num_setups     = description.num_setups;

        let multiscale = multiscale_attributes(description);
        let mut root = Map::new();
        root.insert("n5".into(), json!(N5_VERSION));
        if self.group_path(0, 0).is_empty() {
            root.extend(multiscale.clone());
        }
        self.set_json("attributes.json", &root)?;

        for setup in 0..description.num_setups {
            for timepoint in 0..description.num_timepoints {
                let group = self.group_path(timepoint, setup);
                if !group.is_empty() {
                    self.set_json(&join(&group, "attributes.json"), &multiscale)?;
                }
            }
        }
        Ok(())
    }

    fn create_dataset(&mut self, key: DatasetKey, attributes: &DatasetAttributes) -> Result<DatasetHandle> {
        let path = self.dataset_path(key);
        let json = DatasetAttributesJson {
            dimensions:           &attributes.dimensions,
            block_size:           &attributes.block_shape,
            data_type:            attributes.data_type.name(),
            compression:          compression_json(attributes.compression),
            downsampling_factors: &attributes.downsampling_factors,
        };
        self.set_json(&join(&path, "attributes.json"), &json)?;
        debug!(path = %path, dimensions = ?attributes.dimensions, "created N5 dataset");
        Ok(DatasetHandle {
            key,
            path,
            attributes: attributes.clone(),
            prefix:     Vec::new(),
        })
    }

    fn write_block<T: Pixel>(&mut self, handle: &DatasetHandle, block: &Block<T>) -> Result<()> {
        let (_, size) = handle.attributes.block_interval(&block.grid_position);
        if block.size_u64() != size || block.data.len() != block.num_elements() {
            return Err(ExportError::defect(format!(
                "block {:?} of {} has size {:?} and {} samples, expected size {size:?}",
                block.grid_position,
                handle.path,
                block.size,
                block.data.len()
            )));
        }
        if T::DATA_TYPE != handle.attributes.data_type {
            return Err(ExportError::defect(format!(
                "{} samples written to {} dataset {}",
                T::DATA_TYPE, handle.attributes.data_type, handle.path
            )));
        }

        let codec = get_codec(handle.attributes.compression);
        let payload = codec.compress(&encode_samples::<T, BigEndian>(&block.data))?;
        let header = N5BlockHeader { mode: MODE_DEFAULT, size: block.size.clone() };
        let mut bytes = Vec::with_capacity(header.encoded_len() + payload.len());
        header.write(&mut bytes)?;
        bytes.extend_from_slice(&payload);
        self.storage.set(&store_key(&Self::block_key(handle, &block.grid_position))?, bytes.into())?;
        Ok(())
    }

    /// Reassembled from every block the region touches.  A block missing
    /// inside the region is reported as invalid data.
    fn read_region<T: Pixel>(&self, handle: &DatasetHandle, min: &[u64], size: &[u64]) -> Result<Vec<T>> {
        let attrs = &handle.attributes;
        check_bounds(min, size, &attrs.dimensions)?;
        let mut out = vec![T::default(); num_elements(size) as usize];
        if out.is_empty() {
            return Ok(out);
        }

        let rank = attrs.rank();
        let first: Vec<u64> = (0..rank).map(|d| min[d] / attrs.block_shape[d] as u64).collect();
        let last:  Vec<u64> = (0..rank).map(|d| (min[d] + size[d] - 1) / attrs.block_shape[d] as u64).collect();
        let span:  Vec<u64> = first.iter().zip(&last).map(|(f, l)| l - f + 1).collect();

        for i in 0..num_elements(&span) {
            let mut rest = i;
            let grid: Vec<u64> = first
                .iter()
                .zip(&span)
                .map(|(&f, &s)| {
                    let g = f + rest % s;
                    rest /= s;
                    g
                })
                .collect();
            let data = self.read_block::<T>(handle, &grid)?.ok_or_else(|| {
                invalid_data(format!("block {grid:?} of {} has not been written", handle.path))
            })?;
            let (block_min, block_size) = attrs.block_interval(&grid);
            copy_overlap(&data, &block_min, &block_size, &mut out, min, size);
        }
        Ok(out)
    }
}
