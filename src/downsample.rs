//! Numeric downsampling of one block.
//!
//! The source region is aligned so that destination voxel `p` covers source
//! cell `[p * f, min((p + 1) * f, src_size))` on every axis.  Cells at the
//! far image boundary may be partial; `Average` divides by the number of
//! samples actually present.

use serde::{Deserialize, Serialize};

use crate::dtype::Pixel;
use crate::error::{ExportError, Result};
use crate::region::{for_each_row, num_elements};

/// Closed set of downsampling rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownsamplingMethod {
    /// Arithmetic mean of the cell.
    #[default]
    Average,
    /// First sample of the cell (decimation).
    Nearest,
}

impl DownsamplingMethod {
    /// Name written into multiscale metadata.
    pub fn name(self) -> &'static str {
        match self {
            DownsamplingMethod::Average => "average",
            DownsamplingMethod::Nearest => "nearest",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "average" | "mean" => Some(DownsamplingMethod::Average),
            "nearest" | "sample" | "decimate" => Some(DownsamplingMethod::Nearest),
            _ => None,
        }
    }
}

/// Downsample `src` (shape `src_size`) by `factors` into shape `dst_size`.
///
/// `dst_size` must equal `ceil(src_size / factors)`; anything else means the
/// caller's interval arithmetic is wrong and is reported as a defect.
pub fn downsample<T: Pixel>(
    method:   DownsamplingMethod,
    src:      &[T],
    src_size: &[u64],
    factors:  &[u32],
    dst_size: &[u64],
) -> Result<Vec<T>> {
    let rank = src_size.len();
    let consistent = factors.len() == rank
        && dst_size.len() == rank
        && !factors.contains(&0)
        && src.len() as u64 == num_elements(src_size)
        && src_size
            .iter()
            .zip(factors)
            .zip(dst_size)
            .all(|((&s, &f), &d)| s.div_ceil(f as u64) == d);
    if !consistent {
        return Err(ExportError::defect(format!(
            "cannot downsample {src_size:?} ({} samples) by {factors:?} into {dst_size:?}",
            src.len()
        )));
    }

    if factors.iter().all(|&f| f == 1) {
        return Ok(src.to_vec());
    }

    Ok(match method {
        DownsamplingMethod::Average => average(src, src_size, factors, dst_size),
        DownsamplingMethod::Nearest => nearest(src, src_size, factors, dst_size),
    })
}

fn strides(size: &[u64]) -> Vec<u64> {
    let mut acc = 1;
    size.iter()
        .map(|&s| {
            let stride = acc;
            acc *= s;
            stride
        })
        .collect()
}

fn average<T: Pixel>(src: &[T], src_size: &[u64], factors: &[u32], dst_size: &[u64]) -> Vec<T> {
    let n = num_elements(dst_size) as usize;
    let mut sums = vec![T::Sum::default(); n];
    let dst_strides = strides(dst_size);
    let f0 = factors[0] as usize;
    let row = src_size[0] as usize;

    // Every source sample is added to exactly one destination accumulator.
    let mut src_offset = 0usize;
    for_each_row(src_size, |pos| {
        let dst_row: u64 = pos
            .iter()
            .zip(factors)
            .zip(&dst_strides)
            .skip(1)
            .map(|((&p, &f), &s)| (p / f as u64) * s)
            .sum();
        let dst_row = dst_row as usize;
        for (x, &v) in src[src_offset..src_offset + row].iter().enumerate() {
            let acc = &mut sums[dst_row + x / f0];
            *acc = T::accumulate(*acc, v);
        }
        src_offset += row;
    });

    // Cell extents per axis; only the last cell of an axis can be short.
    let extents: Vec<Vec<u64>> = (0..src_size.len())
        .map(|d| {
            let f = factors[d] as u64;
            (0..dst_size[d])
                .map(|p| ((p + 1) * f).min(src_size[d]) - p * f)
                .collect()
        })
        .collect();

    let mut out = Vec::with_capacity(n);
    let mut i = 0usize;
    for_each_row(dst_size, |pos| {
        let row_count: u64 = pos.iter().enumerate().skip(1).map(|(d, &p)| extents[d][p as usize]).product();
        for &e0 in &extents[0] {
            out.push(T::mean(sums[i], row_count * e0));
            i += 1;
        }
    });
    out
}

fn nearest<T: Pixel>(src: &[T], src_size: &[u64], factors: &[u32], dst_size: &[u64]) -> Vec<T> {
    let mut out = Vec::with_capacity(num_elements(dst_size) as usize);
    let src_strides = strides(src_size);
    let f0 = factors[0] as usize;
    let row = dst_size[0] as usize;
    for_each_row(dst_size, |pos| {
        let base: u64 = pos
            .iter()
            .zip(factors)
            .zip(&src_strides)
            .skip(1)
            .map(|((&p, &f), &s)| p * f as u64 * s)
            .sum();
        let base = base as usize;
        out.extend((0..row).map(|x| src[base + x * f0]));
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_of_2x2_cells() {
        let src: Vec<u8> = vec![
            1, 3, 10, 10,
            5, 7, 10, 11,
        ];
        let out = downsample(DownsamplingMethod::Average, &src, &[4, 2], &[2, 2], &[2, 1]).unwrap();
        assert_eq!(out, vec![4, 10]);
    }

    #[test]
    fn partial_boundary_cells_average_present_samples() {
        let src: Vec<u16> = vec![2, 4, 9];
        let out = downsample(DownsamplingMethod::Average, &src, &[3], &[2], &[2]).unwrap();
        assert_eq!(out, vec![3, 9]);
    }

    #[test]
    fn nearest_takes_cell_origin() {
        let src: Vec<i32> = (0..16).collect();
        let out = downsample(DownsamplingMethod::Nearest, &src, &[4, 4], &[2, 2], &[2, 2]).unwrap();
        assert_eq!(out, vec![0, 2, 8, 10]);
    }

    #[test]
    fn float_average_is_exact_mean() {
        let src = vec![0.5f32, 1.0, 1.5, 2.0];
        let out = downsample(DownsamplingMethod::Average, &src, &[4], &[4], &[1]).unwrap();
        assert_eq!(out, vec![1.25]);
    }

    #[test]
    fn anisotropic_factors() {
        // 2 x 1 x 2 cells over a 4 x 2 x 2 ramp
        let src: Vec<u32> = (0..16).collect();
        let out = downsample(DownsamplingMethod::Average, &src, &[4, 2, 2], &[2, 1, 2], &[2, 2, 1]).unwrap();
        // cell (0,0): {0,1,8,9} -> 4.5 -> 5
        assert_eq!(out, vec![5, 7, 9, 11]);
    }

    #[test]
    fn inconsistent_geometry_is_a_defect() {
        let src = vec![0u8; 8];
        let err = downsample(DownsamplingMethod::Average, &src, &[8], &[2], &[3]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Defect);
    }

    #[test]
    fn method_names() {
        assert_eq!(DownsamplingMethod::from_name("Average"), Some(DownsamplingMethod::Average));
        assert_eq!(DownsamplingMethod::Nearest.name(), "nearest");
        assert_eq!(DownsamplingMethod::from_name("median"), None);
    }
}
