//! Chunked dataset writers.
//!
//! A [`DatasetWriter`] turns pyramid levels into persisted datasets: one per
//! (timepoint, setup, level), each a grid of independently compressed blocks.
//! Two layouts are provided, [`n5::N5Writer`] and [`ome_zarr::OmeZarrWriter`],
//! both over a zarrs [`Storage`]: a directory through
//! [`directory_storage`] or memory through
//! [`MemoryStore`](zarrs::storage::store::MemoryStore).
//!
//! # Call order
//! ```text
//! begin_export ─┬─ create_dataset (every level of a pair) ─ write_block* ─┐
//!               └──────────────────────── next pair ◄─────────────────────┘
//! finish
//! ```
//! Writing happens on the coordinating thread through `&mut self`.  Workers
//! computing loopback levels only ever call [`DatasetWriter::read_region`]
//! through a shared reference.

pub mod n5;
pub mod ome_zarr;

pub use n5::N5Writer;
pub use ome_zarr::OmeZarrWriter;

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zarrs::filesystem::FilesystemStore;
use zarrs::storage::{ReadableWritableListableStorage, StoreKey, WritableStorageTraits};

use crate::block::{Block, RegionReader};
use crate::codec::Compression;
use crate::downsample::DownsamplingMethod;
use crate::dtype::{DataType, Pixel};
use crate::error::{ExportError, Result};
use crate::plan::PyramidLevel;
use crate::source::VoxelSize;

/// Shared key/value storage the writers persist into.
pub type Storage = ReadableWritableListableStorage;

/// Storage rooted at the directory `path`.
pub fn directory_storage<P: AsRef<Path>>(path: P) -> Result<Storage> {
    let store = FilesystemStore::new(path.as_ref())
        .map_err(|e| ExportError::Io(io::Error::other(format!("{}: {e}", path.as_ref().display()))))?;
    Ok(Arc::new(store))
}

/// Output layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    #[default]
    N5,
    OmeZarr,
}

impl Layout {
    pub fn name(self) -> &'static str {
        match self {
            Layout::N5      => "n5",
            Layout::OmeZarr => "ome-zarr",
        }
    }

    /// Whether blocks of this layout can be written with `compression`.
    /// OME-Zarr is limited to the numcodecs compressors zarrs reads back.
    pub fn supports(self, compression: Compression) -> bool {
        match self {
            Layout::N5      => true,
            Layout::OmeZarr => !matches!(compression, Compression::Xz),
        }
    }

    /// Fail with a configuration error unless an image of `rank` spatial axes
    /// compressed with `compression` can be written in this layout.
    pub fn validate(self, rank: usize, compression: Compression) -> Result<()> {
        if !self.supports(compression) {
            return Err(ExportError::UnsupportedCompression {
                layout:      self.name(),
                compression: compression.name(),
            });
        }
        if self == Layout::OmeZarr && !(2..=3).contains(&rank) {
            return Err(ExportError::config(format!(
                "OME-Zarr needs 2 or 3 spatial axes, image has {rank}"
            )));
        }
        Ok(())
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "n5"                            => Some(Layout::N5),
            "ome-zarr" | "omezarr" | "zarr" => Some(Layout::OmeZarr),
            _                               => None,
        }
    }
}

/// Identifies one dataset of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetKey {
    pub timepoint: usize,
    pub setup:     usize,
    pub level:     usize,
}

/// Metadata of one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetAttributes {
    pub dimensions:           Vec<u64>,
    pub block_shape:          Vec<u32>,
    pub data_type:            DataType,
    pub compression:          Compression,
    pub downsampling_factors: Vec<u32>,
}

impl DatasetAttributes {
    pub fn for_level(level: &PyramidLevel, data_type: DataType, compression: Compression) -> Self {
        Self {
            dimensions:           level.dimensions.clone(),
            block_shape:          level.block_shape.clone(),
            data_type,
            compression,
            downsampling_factors: level.factors_to_original.clone(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// Blocks per axis.
    pub fn grid_shape(&self) -> Vec<u64> {
        self.dimensions
            .iter()
            .zip(&self.block_shape)
            .map(|(&d, &b)| d.div_ceil(b as u64))
            .collect()
    }

    /// `[min, min + size)` of block `grid`, truncated at the boundary.
    pub fn block_interval(&self, grid: &[u64]) -> (Vec<u64>, Vec<u64>) {
        let min: Vec<u64> = grid.iter().zip(&self.block_shape).map(|(&g, &b)| g * b as u64).collect();
        let size = min
            .iter()
            .zip(&self.block_shape)
            .zip(&self.dimensions)
            .map(|((&m, &b), &d)| (b as u64).min(d.saturating_sub(m)))
            .collect();
        (min, size)
    }
}

/// Returned by [`DatasetWriter::create_dataset`]; addresses one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetHandle {
    pub key:        DatasetKey,
    /// Store path of the dataset.
    pub path:       String,
    pub attributes: DatasetAttributes,
    /// Leading chunk indices before the spatial ones (OME-Zarr time and
    /// channel); empty for N5.
    pub prefix:     Vec<u64>,
}

/// Everything a writer may record at group level.
#[derive(Debug, Clone)]
pub struct ExportDescription {
    pub name:           String,
    pub dimensions:     Vec<u64>,
    pub data_type:      DataType,
    pub voxel_size:     VoxelSize,
    pub levels:         Vec<PyramidLevel>,
    pub method:         DownsamplingMethod,
    pub compression:    Compression,
    pub num_timepoints: usize,
    pub num_setups:     usize,
}

pub trait DatasetWriter {
    fn layout(&self) -> Layout;

    /// Record group-level metadata. Called once, before any dataset.
    fn begin_export(&mut self, description: &ExportDescription) -> Result<()>;

    fn create_dataset(&mut self, key: DatasetKey, attributes: &DatasetAttributes) -> Result<DatasetHandle>;

    fn write_block<T: Pixel>(&mut self, handle: &DatasetHandle, block: &Block<T>) -> Result<()>;

    /// Samples of `[min, min + size)` of a dataset written earlier in this
    /// export, axis 0 fastest.
    fn read_region<T: Pixel>(&self, handle: &DatasetHandle, min: &[u64], size: &[u64]) -> Result<Vec<T>>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A level already written by the current export, read back as a source.
pub struct WrittenLevel<'a, W> {
    pub writer: &'a W,
    pub handle: &'a DatasetHandle,
}

impl<'a, T: Pixel, W: DatasetWriter + Sync> RegionReader<T> for WrittenLevel<'a, W> {
    fn dimensions(&self) -> &[u64] {
        &self.handle.attributes.dimensions
    }

    fn read(&self, min: &[u64], size: &[u64]) -> Result<Vec<T>> {
        self.writer.read_region(self.handle, min, size)
    }
}

/// Axis names, x first.
pub(crate) fn axis_names(rank: usize) -> Vec<String> {
    (0..rank)
        .map(|d| match d {
            0 => "x".to_owned(),
            1 => "y".to_owned(),
            2 => "z".to_owned(),
            _ => format!("dim{d}"),
        })
        .collect()
}

pub(crate) fn invalid_data(message: String) -> ExportError {
    ExportError::Io(io::Error::new(io::ErrorKind::InvalidData, message))
}

pub(crate) fn store_key(key: &str) -> Result<StoreKey> {
    StoreKey::new(key).map_err(|e| ExportError::defect(format!("invalid store key {key}: {e}")))
}

pub(crate) fn set_json(storage: &Storage, key: &str, value: &impl Serialize) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    storage.set(&store_key(key)?, bytes.into())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> DatasetAttributes {
        DatasetAttributes {
            dimensions:           vec![5, 3],
            block_shape:          vec![2, 2],
            data_type:            DataType::Uint16,
            compression:          Compression::Raw,
            downsampling_factors: vec![1, 1],
        }
    }

    #[test]
    fn grid_and_boundary_intervals() {
        let a = attrs();
        assert_eq!(a.grid_shape(), vec![3, 2]);
        assert_eq!(a.block_interval(&[2, 1]), (vec![4, 2], vec![1, 1]));
    }

    #[test]
    fn layout_names() {
        assert_eq!(Layout::from_name("OME-Zarr"), Some(Layout::OmeZarr));
        assert_eq!(Layout::N5.name(), "n5");
        assert_eq!(serde_json::to_string(&Layout::OmeZarr).unwrap(), "\"ome-zarr\"");
    }

    #[test]
    fn layouts_validate_rank_and_compression() {
        assert!(Layout::N5.validate(4, Compression::Xz).is_ok());
        assert!(Layout::OmeZarr.validate(3, Compression::Zstd { level: 3 }).is_ok());
        assert!(Layout::OmeZarr.validate(2, Compression::Raw).is_ok());

        let err = Layout::OmeZarr.validate(4, Compression::Raw).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("2 or 3 spatial axes"));
        assert!(Layout::OmeZarr.validate(1, Compression::Raw).unwrap_err().is_config());
        assert!(matches!(
            Layout::OmeZarr.validate(3, Compression::Xz),
            Err(ExportError::UnsupportedCompression { layout: "ome-zarr", compression: "xz" })
        ));
    }

    #[test]
    fn directory_storage_writes_json_documents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("out.n5");
        let storage = directory_storage(&root).unwrap();
        set_json(&storage, "attributes.json", &serde_json::json!({ "n5": "4.0.0" })).unwrap();
        assert!(root.join("attributes.json").is_file());
    }
}
