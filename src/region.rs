//! N-dimensional region arithmetic over flat buffers.
//!
//! Buffers are stored with axis 0 varying fastest (x, then y, then z ...),
//! which is N5's block order.  In-memory and virtual sources cut regions out
//! of their planes here, and N5 regions are reassembled from blocks; OME-Zarr
//! subsets go through zarrs.  Copies move whole axis-0 rows at a time.

use crate::error::{ExportError, Result};

/// Number of elements of a region.
pub fn num_elements(size: &[u64]) -> u64 {
    size.iter().product()
}

/// Fail with [`ExportError::OutOfBounds`] unless `[min, min + size)` lies
/// inside `dimensions`.
pub fn check_bounds(min: &[u64], size: &[u64], dimensions: &[u64]) -> Result<()> {
    let inside = min.len() == dimensions.len()
        && size.len() == dimensions.len()
        && min
            .iter()
            .zip(size)
            .zip(dimensions)
            .all(|((&m, &s), &d)| m.checked_add(s).is_some_and(|end| end <= d));
    if inside {
        Ok(())
    } else {
        Err(ExportError::OutOfBounds {
            min:        min.to_vec(),
            size:       size.to_vec(),
            dimensions: dimensions.to_vec(),
        })
    }
}

fn strides(dimensions: &[u64]) -> Vec<u64> {
    let mut strides = Vec::with_capacity(dimensions.len());
    let mut acc = 1u64;
    for &d in dimensions {
        strides.push(acc);
        acc *= d;
    }
    strides
}

/// Call `f` with the position (axis 0 fixed at zero) of every axis-0 row of
/// a region of shape `size`, in buffer order.
pub fn for_each_row(size: &[u64], mut f: impl FnMut(&[u64])) {
    if size.is_empty() || size.contains(&0) {
        return;
    }
    let rank = size.len();
    let mut pos = vec![0u64; rank];
    loop {
        f(&pos);
        let mut d = 1;
        loop {
            if d >= rank {
                return;
            }
            pos[d] += 1;
            if pos[d] < size[d] {
                break;
            }
            pos[d] = 0;
            d += 1;
        }
    }
}

fn offset(strides: &[u64], origin: &[u64], pos: &[u64]) -> usize {
    strides
        .iter()
        .zip(origin)
        .zip(pos)
        .map(|((&s, &o), &p)| (o + p) * s)
        .sum::<u64>() as usize
}

/// Copy the region `[min, min + size)` out of `src` (shape `src_dims`).
/// Callers check bounds first.
pub fn copy_region<T: Copy>(src: &[T], src_dims: &[u64], min: &[u64], size: &[u64]) -> Vec<T> {
    let mut out = Vec::with_capacity(num_elements(size) as usize);
    let src_strides = strides(src_dims);
    let row = size.first().copied().unwrap_or(0) as usize;
    for_each_row(size, |pos| {
        let o = offset(&src_strides, min, pos);
        out.extend_from_slice(&src[o..o + row]);
    });
    out
}

/// Write `src` (shape `size`) into `dst` (shape `dst_dims`) at `dst_min`.
fn paste_region<T: Copy>(dst: &mut [T], dst_dims: &[u64], dst_min: &[u64], src: &[T], size: &[u64]) {
    let dst_strides = strides(dst_dims);
    let row = size.first().copied().unwrap_or(0) as usize;
    let mut src_offset = 0usize;
    for_each_row(size, |pos| {
        let o = offset(&dst_strides, dst_min, pos);
        dst[o..o + row].copy_from_slice(&src[src_offset..src_offset + row]);
        src_offset += row;
    });
}

/// Copy the part of `src` (shape `src_size`, placed at `src_min` in a common
/// coordinate space) that overlaps `[dst_min, dst_min + dst_size)` into `dst`.
pub fn copy_overlap<T: Copy>(
    src:      &[T],
    src_min:  &[u64],
    src_size: &[u64],
    dst:      &mut [T],
    dst_min:  &[u64],
    dst_size: &[u64],
) {
    let rank = src_min.len();
    let mut lo   = Vec::with_capacity(rank);
    let mut size = Vec::with_capacity(rank);
    for d in 0..rank {
        let start = src_min[d].max(dst_min[d]);
        let end = (src_min[d] + src_size[d]).min(dst_min[d] + dst_size[d]);
        if end <= start {
            return;
        }
        lo.push(start);
        size.push(end - start);
    }
    let in_src: Vec<u64> = lo.iter().zip(src_min).map(|(l, m)| l - m).collect();
    let in_dst: Vec<u64> = lo.iter().zip(dst_min).map(|(l, m)| l - m).collect();
    let part = copy_region(src, src_size, &in_src, &size);
    paste_region(dst, dst_size, &in_dst, &part, &size);
}
