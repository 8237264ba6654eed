//! Blocks and block computation.
//!
//! A [`Block`] is one chunk of one pyramid level, computed from a source
//! region by [`BlockComputer`] and consumed once by a dataset writer.  The
//! source is anything implementing [`RegionReader`]: the original image
//! ([`OriginalRegion`]) or a level already written by the same export.

use crate::downsample::{downsample, DownsamplingMethod};
use crate::dtype::Pixel;
use crate::error::{ExportError, Result};
use crate::plan::{downsampled_dimensions, PyramidLevel};
use crate::region::check_bounds;
use crate::source::SourceImage;

/// One computed chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Block<T> {
    pub level:         usize,
    pub grid_position: Vec<u64>,
    /// Actual extent; smaller than the block shape at the far boundary.
    pub size:          Vec<u32>,
    pub data:          Vec<T>,
}

impl<T> Block<T> {
    pub fn num_elements(&self) -> usize {
        self.size.iter().map(|&s| s as usize).product()
    }

    /// Extent as `u64`, for region arithmetic.
    pub fn size_u64(&self) -> Vec<u64> {
        self.size.iter().map(|&s| s as u64).collect()
    }
}

/// Interval `[min, min + size)` covered by block `grid` of `level`.
pub fn block_interval(level: &PyramidLevel, grid: &[u64]) -> (Vec<u64>, Vec<u64>) {
    let mut min  = Vec::with_capacity(level.rank());
    let mut size = Vec::with_capacity(level.rank());
    for ((&g, &b), &d) in grid.iter().zip(&level.block_shape).zip(&level.dimensions) {
        let start = g * b as u64;
        min.push(start);
        size.push((b as u64).min(d.saturating_sub(start)));
    }
    (min, size)
}

/// Grid positions of `level`, grouped into planes along the last grid axis.
/// Within a plane positions are in grid order, axis 0 fastest.
pub fn planes_of_blocks(level: &PyramidLevel) -> Vec<Vec<Vec<u64>>> {
    let grid = level.grid_shape();
    let Some((&depth, plane_grid)) = grid.split_last() else {
        return Vec::new();
    };
    let per_plane: u64 = plane_grid.iter().product();
    (0..depth)
        .map(|z| {
            (0..per_plane)
                .map(|mut i| {
                    let mut pos = Vec::with_capacity(grid.len());
                    for &g in plane_grid {
                        pos.push(i % g);
                        i /= g;
                    }
                    pos.push(z);
                    pos
                })
                .collect()
        })
        .collect()
}

// ── Region readers ───────────────────────────────────────────────────────────

/// Read-only access to a region of some image at some resolution.
pub trait RegionReader<T>: Sync {
    fn dimensions(&self) -> &[u64];

    fn read(&self, min: &[u64], size: &[u64]) -> Result<Vec<T>>;
}

/// One timepoint/setup of the original image.
pub struct OriginalRegion<'a, S> {
    pub source:    &'a S,
    pub timepoint: usize,
    pub setup:     usize,
}

impl<'a, S: SourceImage> RegionReader<S::Pixel> for OriginalRegion<'a, S> {
    fn dimensions(&self) -> &[u64] {
        self.source.dimensions()
    }

    fn read(&self, min: &[u64], size: &[u64]) -> Result<Vec<S::Pixel>> {
        self.source.read_region(self.timepoint, self.setup, min, size)
    }
}

// ── BlockComputer ────────────────────────────────────────────────────────────

/// Computes blocks of one level from one reader.
pub struct BlockComputer<'a, T, R: ?Sized> {
    level:   &'a PyramidLevel,
    reader:  &'a R,
    factors: Vec<u32>,
    method:  DownsamplingMethod,
    _pixel:  std::marker::PhantomData<fn() -> T>,
}

impl<'a, T: Pixel, R: RegionReader<T> + ?Sized> BlockComputer<'a, T, R> {
    /// `factors` map the reader's resolution to `level`; the level's
    /// dimensions must be the reader's dimensions divided by them, rounded up.
    pub fn new(
        level:   &'a PyramidLevel,
        reader:  &'a R,
        factors: Vec<u32>,
        method:  DownsamplingMethod,
    ) -> Result<Self> {
        let src_dims = reader.dimensions();
        if factors.len() != src_dims.len()
            || factors.contains(&0)
            || downsampled_dimensions(src_dims, &factors) != level.dimensions
        {
            return Err(ExportError::defect(format!(
                "level {} {:?} is not {src_dims:?} downsampled by {factors:?}",
                level.index, level.dimensions
            )));
        }
        Ok(Self { level, reader, factors, method, _pixel: std::marker::PhantomData })
    }

    pub fn compute(&self, grid: &[u64]) -> Result<Block<T>> {
        let (min, size) = block_interval(self.level, grid);
        check_bounds(&min, &size, &self.level.dimensions)?;

        let src_dims = self.reader.dimensions();
        let mut src_min  = Vec::with_capacity(min.len());
        let mut src_size = Vec::with_capacity(min.len());
        for d in 0..min.len() {
            let f = self.factors[d] as u64;
            let start = min[d] * f;
            src_min.push(start);
            src_size.push((size[d] * f).min(src_dims[d].saturating_sub(start)));
        }

        let src = self.reader.read(&src_min, &src_size)?;
        let data = downsample(self.method, &src, &src_size, &self.factors, &size)?;
        Ok(Block {
            level:         self.level.index,
            grid_position: grid.to_vec(),
            size:          size.iter().map(|&s| s as u32).collect(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::LevelPlan;
    use crate::source::InMemoryImage;

    fn plan() -> LevelPlan {
        LevelPlan::from_arrays(
            &[10, 6, 5],
            &[vec![1, 1, 1], vec![2, 2, 2]],
            &[vec![4, 4, 4], vec![2, 2, 2]],
        ).unwrap()
    }

    #[test]
    fn boundary_blocks_are_truncated() {
        let p = plan();
        let (min, size) = block_interval(&p.levels()[0], &[2, 1, 1]);
        assert_eq!(min, vec![8, 4, 4]);
        assert_eq!(size, vec![2, 2, 1]);
    }

    #[test]
    fn planes_run_along_the_last_axis() {
        let p = plan();
        let planes = planes_of_blocks(&p.levels()[0]);
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0].len(), 6);
        assert_eq!(planes[0][0], vec![0, 0, 0]);
        assert_eq!(planes[0][1], vec![1, 0, 0]);
        assert_eq!(planes[0][3], vec![0, 1, 0]);
        assert_eq!(planes[1][5], vec![2, 1, 1]);
    }

    #[test]
    fn computes_downsampled_boundary_block() {
        let p = plan();
        let img = InMemoryImage::from_fn(vec![10, 6, 5], |_| 7u16).unwrap();
        let reader = OriginalRegion { source: &img, timepoint: 0, setup: 0 };
        let level = &p.levels()[1];
        let computer = BlockComputer::new(level, &reader, vec![2, 2, 2], DownsamplingMethod::Average).unwrap();
        // level 1 is 5 x 3 x 3; block (2,1,1) covers x 4..5, y 2..3, z 2..3
        let block = computer.compute(&[2, 1, 1]).unwrap();
        assert_eq!(block.size, vec![1, 1, 1]);
        assert_eq!(block.data, vec![7]);
        assert_eq!(block.level, 1);
    }

    #[test]
    fn level_zero_copies_the_source() {
        let p = plan();
        let img = InMemoryImage::from_fn(vec![10, 6, 5], |q| (q[0] + 10 * q[1] + 100 * q[2]) as u32).unwrap();
        let reader = OriginalRegion { source: &img, timepoint: 0, setup: 0 };
        let computer = BlockComputer::new(&p.levels()[0], &reader, vec![1, 1, 1], DownsamplingMethod::Nearest).unwrap();
        let block = computer.compute(&[2, 0, 1]).unwrap();
        assert_eq!(block.size, vec![2, 4, 1]);
        assert_eq!(&block.data[..3], &[408, 409, 418]);
    }

    #[test]
    fn mismatched_factors_are_a_defect() {
        let p = plan();
        let img = InMemoryImage::from_fn(vec![10, 6, 5], |_| 0u8).unwrap();
        let reader = OriginalRegion { source: &img, timepoint: 0, setup: 0 };
        assert!(BlockComputer::new(&p.levels()[1], &reader, vec![4, 2, 2], DownsamplingMethod::Average).is_err());
    }

    #[test]
    fn blocks_outside_the_grid_fail_fast() {
        let p = plan();
        let img = InMemoryImage::from_fn(vec![10, 6, 5], |_| 0u8).unwrap();
        let reader = OriginalRegion { source: &img, timepoint: 0, setup: 0 };
        let computer = BlockComputer::new(&p.levels()[0], &reader, vec![1, 1, 1], DownsamplingMethod::Average).unwrap();
        let err = computer.compute(&[3, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Defect);
    }
}
