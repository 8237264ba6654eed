//! OME-Zarr layout (NGFF 0.4 over Zarr v2).
//!
//! # Layout
//! ```text
//! .zgroup                      {"zarr_format": 2}
//! .zattrs                      {"multiscales": [ ... ]}
//! s{l}/.zarray
//! s{l}/[t/][c/]{z}/{y}/{x}     chunks, dimension_separator "/"
//! ```
//! Every timepoint and setup of a level share one array: a leading `t` axis
//! exists when the export has more than one timepoint and a `c` axis when it
//! has more than one setup, each with chunk size 1.  Spatial axes are stored
//! slowest first (`z y x`), the reverse of the engine's x-first order, so the
//! in-memory x-fastest buffer is already in C order.
//!
//! Levels are zarrs arrays opened from V2 metadata.  zarrs pads boundary
//! chunks with the fill value 0 and encodes them little-endian through the
//! numcodecs compressor named in `.zarray`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use zarrs::array::{Array, ArrayMetadata};
use zarrs::array_subset::ArraySubset;
use zarrs::storage::ReadableWritableListableStorageTraits;

use super::{set_json, DatasetAttributes, DatasetHandle, DatasetKey, DatasetWriter, ExportDescription, Layout, Storage};
use crate::block::Block;
use crate::codec::Compression;
use crate::dtype::{DataType, Pixel};
use crate::error::{ExportError, Result};
use crate::region::check_bounds;

/// NGFF version written into `multiscales`.
pub const NGFF_VERSION: &str = "0.4";

// ── Metadata documents ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZArray {
    pub zarr_format:         u8,
    pub shape:               Vec<u64>,
    pub chunks:              Vec<u64>,
    pub dtype:               String,
    pub compressor:          Option<Value>,
    pub fill_value:          Value,
    pub order:               String,
    pub filters:             Option<Vec<Value>>,
    pub dimension_separator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    #[serde(rename = "type")]
    pub axis_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CoordinateTransformation {
    Scale { scale: Vec<f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiscaleDataset {
    pub path: String,
    #[serde(rename = "coordinateTransformations")]
    pub coordinate_transformations: Vec<CoordinateTransformation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Multiscale {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub downscaling_type: String,
    pub axes: Vec<Axis>,
    /// Ordered finest first.
    pub datasets: Vec<MultiscaleDataset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAttributes {
    pub multiscales: Vec<Multiscale>,
}

/// The numcodecs `compressor` object, `None` for raw chunks.
pub fn compressor_json(compression: Compression) -> Result<Option<Value>> {
    Ok(match compression {
        Compression::Raw            => None,
        Compression::Gzip { level } => Some(json!({ "id": "gzip", "level": level.clamp(0, 9) })),
        Compression::Zstd { level } => Some(json!({ "id": "zstd", "level": level })),
        Compression::Xz => {
            return Err(ExportError::UnsupportedCompression { layout: "ome-zarr", compression: "xz" })
        }
    })
}

fn fill_value(data_type: DataType) -> Value {
    match data_type {
        DataType::Float32 | DataType::Float64 => json!(0.0),
        _                                     => json!(0),
    }
}

/// NGFF unit name of a short unit spelling; `None` for pixels or unknown units.
pub fn ngff_unit(unit: &str) -> Option<&'static str> {
    match unit {
        "nm" | "nanometer" | "nanometers"                    => Some("nanometer"),
        "um" | "µm" | "μm" | "micron" | "micrometer" | "microns" => Some("micrometer"),
        "mm" | "millimeter"                                  => Some("millimeter"),
        "cm" | "centimeter"                                  => Some("centimeter"),
        "m" | "meter"                                        => Some("meter"),
        "angstrom" | "Å"                                     => Some("angstrom"),
        _                                                    => None,
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

type LevelArray = Array<dyn ReadableWritableListableStorageTraits>;

struct ExportLayout {
    has_time:       bool,
    has_channel:    bool,
    num_timepoints: u64,
    num_setups:     u64,
    /// Per-axis physical voxel size, x first.
    voxel_size:     Vec<f64>,
    attributes:     GroupAttributes,
}

pub struct OmeZarrWriter {
    storage: Storage,
    layout:  Option<ExportLayout>,
    /// Arrays created so far, by level.
    arrays:  BTreeMap<usize, (DatasetAttributes, LevelArray)>,
}

impl OmeZarrWriter {
    pub fn new(storage: Storage) -> Self {
        Self { storage, layout: None, arrays: BTreeMap::new() }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn layout(&self) -> Result<&ExportLayout> {
        self.layout
            .as_ref()
            .ok_or_else(|| ExportError::defect("OME-Zarr dataset created before begin_export"))
    }

    fn zarray(&self, attributes: &DatasetAttributes) -> Result<ZArray> {
        let layout = self.layout()?;
        let mut shape  = Vec::new();
        let mut chunks = Vec::new();
        if layout.has_time {
            shape.push(layout.num_timepoints);
            chunks.push(1);
        }
        if layout.has_channel {
            shape.push(layout.num_setups);
            chunks.push(1);
        }
        shape.extend(attributes.dimensions.iter().rev());
        chunks.extend(attributes.block_shape.iter().rev().map(|&b| b as u64));
        Ok(ZArray {
            zarr_format:         2,
            shape,
            chunks,
            dtype:               attributes.data_type.zarr_dtype().to_owned(),
            compressor:          compressor_json(attributes.compression)?,
            fill_value:          fill_value(attributes.data_type),
            order:               "C".to_owned(),
            filters:             None,
            dimension_separator: "/".to_owned(),
        })
    }

    fn handle(&self, key: DatasetKey, attributes: &DatasetAttributes) -> Result<DatasetHandle> {
        let layout = self.layout()?;
        let mut prefix = Vec::new();
        if layout.has_time {
            prefix.push(key.timepoint as u64);
        }
        if layout.has_channel {
            prefix.push(key.setup as u64);
        }
        Ok(DatasetHandle {
            key,
            path:       format!("s{}", key.level),
            attributes: attributes.clone(),
            prefix,
        })
    }

    fn array(&self, handle: &DatasetHandle) -> Result<&LevelArray> {
        self.arrays
            .get(&handle.key.level)
            .map(|(_, array)| array)
            .ok_or_else(|| ExportError::defect(format!("array {} used before it was created", handle.path)))
    }

    /// `[min, min + size)` of one timepoint/setup in array order.
    fn subset(handle: &DatasetHandle, min: &[u64], size: &[u64]) -> Result<ArraySubset> {
        let start: Vec<u64> = handle.prefix.iter().copied().chain(min.iter().rev().copied()).collect();
        let shape: Vec<u64> = handle.prefix.iter().map(|_| 1).chain(size.iter().rev().copied()).collect();
        ArraySubset::new_with_start_shape(start, shape)
            .map_err(|e| ExportError::defect(format!("subset of {}: {e}", handle.path)))
    }
}

impl DatasetWriter for OmeZarrWriter {
    fn layout(&self) -> Layout {
        Layout::OmeZarr
    }

    fn begin_export(&mut self, description: &ExportDescription) -> Result<()> {
        let rank = description.dimensions.len();
        Layout::OmeZarr.validate(rank, description.compression)?;
        let has_time    = description.num_timepoints > 1;
        let has_channel = description.num_setups > 1;

        let unit = ngff_unit(&description.voxel_size.unit).map(str::to_owned);
        let mut axes = Vec::new();
        if has_time {
            axes.push(Axis { name: "t".into(), axis_type: "time".into(), unit: None });
        }
        if has_channel {
            axes.push(Axis { name: "c".into(), axis_type: "channel".into(), unit: None });
        }
        for name in ["x", "y", "z"][..rank].iter().rev() {
            axes.push(Axis { name: (*name).into(), axis_type: "space".into(), unit: unit.clone() });
        }

        let multiscale = Multiscale {
            version:          NGFF_VERSION.to_owned(),
            name:             (!description.name.is_empty()).then(|| description.name.clone()),
            downscaling_type: description.method.name().to_owned(),
            axes,
            datasets:         Vec::new(),
        };
        self.layout = Some(ExportLayout {
            has_time,
            has_channel,
            num_timepoints: description.num_timepoints as u64,
            num_setups:     description.num_setups as u64,
            voxel_size: description.voxel_size.size.clone(),
            attributes: GroupAttributes { multiscales: vec![multiscale] },
        });
        self.arrays.clear();

        set_json(&self.storage, ".zgroup", &json!({ "zarr_format": 2 }))?;
        let layout = self.layout()?;
        set_json(&self.storage, ".zattrs", &layout.attributes)?;
        Ok(())
    }

    fn create_dataset(&mut self, key: DatasetKey, attributes: &DatasetAttributes) -> Result<DatasetHandle> {
        if let Some((existing, _)) = self.arrays.get(&key.level) {
            if existing != attributes {
                return Err(ExportError::defect(format!(
                    "level {} created twice with different attributes",
                    key.level
                )));
            }
            return self.handle(key, attributes);
        }

        let zarray = self.zarray(attributes)?;
        let path = format!("s{}", key.level);
        let metadata: ArrayMetadata = serde_json::from_value(serde_json::to_value(&zarray)?)?;
        let array = Array::new_with_metadata(self.storage.clone(), &format!("/{path}"), metadata)?;
        array.store_metadata()?;

        let layout = self
            .layout
            .as_mut()
            .ok_or_else(|| ExportError::defect("OME-Zarr dataset created before begin_export"))?;
        let mut scale: Vec<f64> = Vec::new();
        if layout.has_time {
            scale.push(1.0);
        }
        if layout.has_channel {
            scale.push(1.0);
        }
        scale.extend(
            layout
                .voxel_size
                .iter()
                .zip(&attributes.downsampling_factors)
                .map(|(&v, &f)| v * f as f64)
                .rev(),
        );
        let datasets = &mut layout.attributes.multiscales[0].datasets;
        datasets.push(MultiscaleDataset {
            path:                       path.clone(),
            coordinate_transformations: vec![CoordinateTransformation::Scale { scale }],
        });
        datasets.sort_by_key(|d| d.path[1..].parse::<usize>().unwrap_or(usize::MAX));

        set_json(&self.storage, ".zattrs", &layout.attributes)?;
        self.arrays.insert(key.level, (attributes.clone(), array));
        debug!(path = %path, shape = ?zarray.shape, "created OME-Zarr array");
        self.handle(key, attributes)
    }

    fn write_block<T: Pixel>(&mut self, handle: &DatasetHandle, block: &Block<T>) -> Result<()> {
        let attrs = &handle.attributes;
        let (min, size) = attrs.block_interval(&block.grid_position);
        if block.size_u64() != size || block.data.len() != block.num_elements() {
            return Err(ExportError::defect(format!(
                "block {:?} of {} has size {:?} and {} samples, expected size {size:?}",
                block.grid_position,
                handle.path,
                block.size,
                block.data.len()
            )));
        }
        if T::DATA_TYPE != attrs.data_type {
            return Err(ExportError::defect(format!(
                "{} samples written to {} array {}",
                T::DATA_TYPE, attrs.data_type, handle.path
            )));
        }

        let subset = Self::subset(handle, &min, &size)?;
        self.array(handle)?.store_array_subset_elements::<T>(&subset, &block.data)?;
        Ok(())
    }

    /// Chunks that were never written read as the fill value.
    fn read_region<T: Pixel>(&self, handle: &DatasetHandle, min: &[u64], size: &[u64]) -> Result<Vec<T>> {
        check_bounds(min, size, &handle.attributes.dimensions)?;
        let subset = Self::subset(handle, min, size)?;
        Ok(self.array(handle)?.retrieve_array_subset_elements::<T>(&subset)?)
    }
}
