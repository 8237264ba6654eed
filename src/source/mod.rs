//! Image sources the engine reads from.
//!
//! [`SourceImage`] is the whole contract between the export engine and the
//! code that owns the pixels: geometry, pixel type, timepoint/setup counts and
//! random-access region reads.  Virtual sources additionally expose a plane
//! cache through [`CacheControl`]; the coordinator (never a worker) decides
//! when to clear it.

mod virtual_stack;

pub use virtual_stack::{PlaneLoader, RawPlaneLoader, VirtualImage};

use serde::{Deserialize, Serialize};

use crate::dtype::{DataType, Pixel};
use crate::error::{ExportError, Result};
use crate::region::{check_bounds, copy_region, num_elements};

/// Physical size of one voxel, per axis (x first), in `unit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelSize {
    pub unit: String,
    pub size: Vec<f64>,
}

impl VoxelSize {
    pub fn new(unit: impl Into<String>, size: Vec<f64>) -> Self {
        Self { unit: unit.into(), size }
    }

    /// One "pixel" per voxel on every axis.
    pub fn unit_pixels(rank: usize) -> Self {
        Self::new("pixel", vec![1.0; rank])
    }
}

/// Cache control exposed by sources with an internal plane/tile cache.
///
/// `clear_cache` must be safe to call while other threads read: it evicts
/// only entries no reader is currently holding.
pub trait CacheControl {
    fn is_virtual(&self) -> bool {
        false
    }

    fn clear_cache(&self) {}
}

/// Randomly addressable N-dimensional pixel source.
pub trait SourceImage: CacheControl + Sync {
    type Pixel: Pixel;

    /// Spatial dimensions, x first.
    fn dimensions(&self) -> &[u64];

    fn voxel_size(&self) -> &VoxelSize;

    fn num_timepoints(&self) -> usize {
        1
    }

    fn num_setups(&self) -> usize {
        1
    }

    fn data_type(&self) -> DataType {
        <Self::Pixel as Pixel>::DATA_TYPE
    }

    /// Read `[min, min + size)` of one timepoint/setup, axis 0 fastest.
    /// Regions outside the image are an error, never clamped.
    fn read_region(
        &self,
        timepoint: usize,
        setup:     usize,
        min:       &[u64],
        size:      &[u64],
    ) -> Result<Vec<Self::Pixel>>;
}

// ── InMemoryImage ────────────────────────────────────────────────────────────

/// Fully resident image series: one buffer per (timepoint, setup).
#[derive(Debug, Clone)]
pub struct InMemoryImage<T> {
    dimensions: Vec<u64>,
    voxel_size: VoxelSize,
    setups:     usize,
    /// Indexed `timepoint * setups + setup`.
    volumes:    Vec<Vec<T>>,
}

impl<T: Pixel> InMemoryImage<T> {
    /// Single timepoint, single setup.
    pub fn new(dimensions: Vec<u64>, data: Vec<T>) -> Result<Self> {
        Self::series(dimensions, vec![vec![data]])
    }

    /// `volumes[timepoint][setup]`.
    pub fn series(dimensions: Vec<u64>, volumes: Vec<Vec<Vec<T>>>) -> Result<Self> {
        if dimensions.is_empty() || dimensions.contains(&0) {
            return Err(ExportError::config(format!("invalid image dimensions {dimensions:?}")));
        }
        let setups = volumes.first().map(Vec::len).unwrap_or(0);
        if setups == 0 || volumes.iter().any(|t| t.len() != setups) {
            return Err(ExportError::config(
                "every timepoint must hold the same, non-zero number of setups",
            ));
        }
        let expected = num_elements(&dimensions) as usize;
        if let Some(bad) = volumes.iter().flatten().find(|v| v.len() != expected) {
            return Err(ExportError::config(format!(
                "volume holds {} samples, dimensions {dimensions:?} need {expected}",
                bad.len()
            )));
        }
        let rank = dimensions.len();
        Ok(Self {
            dimensions,
            voxel_size: VoxelSize::unit_pixels(rank),
            setups,
            volumes: volumes.into_iter().flatten().collect(),
        })
    }

    /// Build a single volume from a function of the voxel position.
    pub fn from_fn(dimensions: Vec<u64>, mut f: impl FnMut(&[u64]) -> T) -> Result<Self> {
        let n = num_elements(&dimensions) as usize;
        let mut data = Vec::with_capacity(n);
        let mut pos = vec![0u64; dimensions.len()];
        for _ in 0..n {
            data.push(f(&pos));
            for (p, &d) in pos.iter_mut().zip(&dimensions) {
                *p += 1;
                if *p < d {
                    break;
                }
                *p = 0;
            }
        }
        Self::new(dimensions, data)
    }

    pub fn with_voxel_size(mut self, voxel_size: VoxelSize) -> Self {
        self.voxel_size = voxel_size;
        self
    }
}

impl<T> CacheControl for InMemoryImage<T> {}

impl<T: Pixel> SourceImage for InMemoryImage<T> {
    type Pixel = T;

    fn dimensions(&self) -> &[u64] {
        &self.dimensions
    }

    fn voxel_size(&self) -> &VoxelSize {
        &self.voxel_size
    }

    fn num_timepoints(&self) -> usize {
        self.volumes.len() / self.setups
    }

    fn num_setups(&self) -> usize {
        self.setups
    }

    fn read_region(&self, timepoint: usize, setup: usize, min: &[u64], size: &[u64]) -> Result<Vec<T>> {
        if timepoint >= self.num_timepoints() || setup >= self.setups {
            return Err(ExportError::defect(format!(
                "timepoint {timepoint} / setup {setup} not in image"
            )));
        }
        check_bounds(min, size, &self.dimensions)?;
        let volume = &self.volumes[timepoint * self.setups + setup];
        Ok(copy_region(volume, &self.dimensions, min, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn from_fn_fills_x_fastest() {
        let img = InMemoryImage::from_fn(vec![3, 2], |p| (p[0] + 10 * p[1]) as u16).unwrap();
        let all = img.read_region(0, 0, &[0, 0], &[3, 2]).unwrap();
        assert_eq!(all, vec![0, 1, 2, 10, 11, 12]);
    }

    #[test]
    fn out_of_bounds_reads_fail_fast() {
        let img = InMemoryImage::new(vec![4, 4], vec![0u8; 16]).unwrap();
        let err = img.read_region(0, 0, &[2, 2], &[3, 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Defect);
    }

    #[test]
    fn series_geometry_is_validated() {
        assert!(InMemoryImage::<u8>::series(vec![2, 2], vec![]).is_err());
        assert!(InMemoryImage::series(vec![2, 2], vec![vec![vec![0u8; 3]]]).is_err());
        let img = InMemoryImage::series(
            vec![2, 2],
            vec![vec![vec![1u8; 4], vec![2u8; 4]], vec![vec![3u8; 4], vec![4u8; 4]]],
        ).unwrap();
        assert_eq!(img.num_timepoints(), 2);
        assert_eq!(img.num_setups(), 2);
        assert_eq!(img.read_region(1, 0, &[0, 0], &[1, 1]).unwrap(), vec![3]);
        assert_eq!(img.data_type(), DataType::Uint8);
    }
}
