//! Pyramid level planning.
//!
//! A [`LevelPlan`] is the validated, ordered list of [`PyramidLevel`]s of one
//! export.  It is built either from explicit `resolutions`/`subdivisions`
//! arrays (one row per level: subsampling factors and block shape) or from a
//! [`MipmapProposal`] computed by [`propose_mipmaps`].
//!
//! # Proposal rule
//! Starting from factors 1, the factor is doubled on every axis whose
//! physical voxel size (native size × current factor) is less than twice the
//! smallest one, so voxels stay roughly isotropic as levels coarsen.  Axes
//! already reduced to a single element are left alone.  Levels stop as soon
//! as the downsampled image fits in the block-element budget.

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

/// Default block-element budget: 64³.
pub const DEFAULT_MAX_BLOCK_ELEMENTS: u64 = 64 * 64 * 64;
/// Default maximum block edge.
pub const DEFAULT_MAX_BLOCK_EDGE: u32 = 64;

// ── PyramidLevel ─────────────────────────────────────────────────────────────

/// One resolution level. All vectors have the image rank, x first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PyramidLevel {
    pub index:               usize,
    pub factors_to_original: Vec<u32>,
    pub block_shape:         Vec<u32>,
    pub dimensions:          Vec<u64>,
}

impl PyramidLevel {
    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// Number of blocks along each axis.
    pub fn grid_shape(&self) -> Vec<u64> {
        self.dimensions
            .iter()
            .zip(&self.block_shape)
            .map(|(&d, &b)| d.div_ceil(b as u64))
            .collect()
    }

    pub fn num_blocks(&self) -> u64 {
        self.grid_shape().iter().product()
    }

    /// Product of the per-axis factors.
    pub fn total_factor(&self) -> u64 {
        self.factors_to_original.iter().map(|&f| f as u64).product()
    }
}

// ── Planner ──────────────────────────────────────────────────────────────────

/// Planner limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub max_block_elements: u64,
    pub max_block_edge:     u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_block_elements: DEFAULT_MAX_BLOCK_ELEMENTS,
            max_block_edge:     DEFAULT_MAX_BLOCK_EDGE,
        }
    }
}

/// Parallel arrays of per-level subsampling factors and block shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MipmapProposal {
    pub resolutions:  Vec<Vec<u32>>,
    pub subdivisions: Vec<Vec<u32>>,
}

/// Propose resolutions and block shapes for an image.
pub fn propose_mipmaps(
    dimensions: &[u64],
    voxel_size: &[f64],
    config:     &PlannerConfig,
) -> Result<MipmapProposal> {
    validate_dimensions(dimensions)?;
    if voxel_size.len() != dimensions.len() {
        return Err(ExportError::config(format!(
            "voxel size has {} axes, image has {}",
            voxel_size.len(),
            dimensions.len()
        )));
    }
    if voxel_size.iter().any(|v| !v.is_finite() || *v <= 0.0) {
        return Err(ExportError::config(format!("voxel size {voxel_size:?} must be positive")));
    }
    if config.max_block_edge == 0 || config.max_block_elements == 0 {
        return Err(ExportError::config("planner limits must be non-zero"));
    }

    let rank = dimensions.len();
    let mut factors = vec![1u32; rank];
    let mut resolutions  = Vec::new();
    let mut subdivisions = Vec::new();

    loop {
        let level_dims = downsampled_dimensions(dimensions, &factors);
        resolutions.push(factors.clone());
        subdivisions.push(
            level_dims
                .iter()
                .map(|&d| d.min(config.max_block_edge as u64) as u32)
                .collect(),
        );

        let elements = level_dims.iter().fold(1u64, |acc, &d| acc.saturating_mul(d));
        if elements <= config.max_block_elements {
            break;
        }

        let candidates: Vec<usize> = (0..rank).filter(|&d| level_dims[d] > 1).collect();
        if candidates.is_empty() {
            break;
        }
        let physical: Vec<f64> = candidates.iter().map(|&d| voxel_size[d] * factors[d] as f64).collect();
        let smallest = physical.iter().copied().fold(f64::INFINITY, f64::min);
        for (&d, &size) in candidates.iter().zip(&physical) {
            if size < 2.0 * smallest {
                factors[d] *= 2;
            }
        }
    }

    Ok(MipmapProposal { resolutions, subdivisions })
}

// ── LevelPlan ────────────────────────────────────────────────────────────────

/// Validated pyramid levels of one export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelPlan {
    levels: Vec<PyramidLevel>,
}

impl LevelPlan {
    /// Build a plan from explicit arrays.
    ///
    /// Rejects empty or mismatched arrays, rank mismatches, zero entries,
    /// a level 0 that is not full resolution, and levels that do not coarsen.
    pub fn from_arrays(
        dimensions:   &[u64],
        resolutions:  &[Vec<u32>],
        subdivisions: &[Vec<u32>],
    ) -> Result<Self> {
        validate_dimensions(dimensions)?;
        if resolutions.is_empty() {
            return Err(ExportError::config("no pyramid levels given"));
        }
        if resolutions.len() != subdivisions.len() {
            return Err(ExportError::config(format!(
                "{} resolutions but {} subdivisions",
                resolutions.len(),
                subdivisions.len()
            )));
        }

        let rank = dimensions.len();
        let mut levels: Vec<PyramidLevel> = Vec::with_capacity(resolutions.len());
        for (index, (factors, block)) in resolutions.iter().zip(subdivisions).enumerate() {
            if factors.len() != rank || block.len() != rank {
                return Err(ExportError::config(format!(
                    "level {index}: expected {rank} axes, got factors {factors:?} and block shape {block:?}"
                )));
            }
            if factors.contains(&0) || block.contains(&0) {
                return Err(ExportError::config(format!(
                    "level {index}: factors {factors:?} and block shape {block:?} must be non-zero"
                )));
            }
            if index == 0 && factors.iter().any(|&f| f != 1) {
                return Err(ExportError::config(format!(
                    "level 0 must be full resolution, got factors {factors:?}"
                )));
            }
            let level = PyramidLevel {
                index,
                factors_to_original: factors.clone(),
                block_shape:         block.clone(),
                dimensions:          downsampled_dimensions(dimensions, factors),
            };
            if let Some(prev) = levels.last() {
                let coarsens = level.total_factor() > prev.total_factor()
                    && factors.iter().zip(&prev.factors_to_original).all(|(f, p)| f >= p);
                if !coarsens {
                    return Err(ExportError::config(format!(
                        "level {index}: factors {factors:?} do not coarsen level {} {:?}",
                        prev.index, prev.factors_to_original
                    )));
                }
            }
            levels.push(level);
        }
        Ok(Self { levels })
    }

    pub fn from_proposal(dimensions: &[u64], proposal: &MipmapProposal) -> Result<Self> {
        Self::from_arrays(dimensions, &proposal.resolutions, &proposal.subdivisions)
    }

    /// Propose and validate in one step.
    pub fn propose(dimensions: &[u64], voxel_size: &[f64], config: &PlannerConfig) -> Result<Self> {
        let proposal = propose_mipmaps(dimensions, voxel_size, config)?;
        Self::from_proposal(dimensions, &proposal)
    }

    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.levels[0].rank()
    }

    pub fn full_resolution(&self) -> &[u64] {
        &self.levels[0].dimensions
    }

    pub fn resolutions(&self) -> Vec<Vec<u32>> {
        self.levels.iter().map(|l| l.factors_to_original.clone()).collect()
    }

    pub fn subdivisions(&self) -> Vec<Vec<u32>> {
        self.levels.iter().map(|l| l.block_shape.clone()).collect()
    }

    /// The finest already-written level a loopback for `level` could read:
    /// the closest coarser-than-original level whose factors divide
    /// `level`'s factors on every axis.  Level 0 is the original image and is
    /// never returned.
    pub fn previous_level(&self, level: usize) -> Option<usize> {
        let target = &self.levels.get(level)?.factors_to_original;
        (1..level).rev().find(|&p| {
            self.levels[p]
                .factors_to_original
                .iter()
                .zip(target)
                .all(|(&f, &t)| t % f == 0)
        })
    }

    /// Per-axis factors from `previous` to `level`.
    pub fn factors_between(&self, previous: usize, level: usize) -> Vec<u32> {
        self.levels[level]
            .factors_to_original
            .iter()
            .zip(&self.levels[previous].factors_to_original)
            .map(|(&t, &f)| t / f)
            .collect()
    }
}

fn validate_dimensions(dimensions: &[u64]) -> Result<()> {
    if dimensions.is_empty() || dimensions.contains(&0) {
        return Err(ExportError::config(format!(
            "image dimensions {dimensions:?} must be non-empty and non-zero"
        )));
    }
    Ok(())
}

/// `ceil(dimensions / factors)` elementwise.
pub fn downsampled_dimensions(dimensions: &[u64], factors: &[u32]) -> Vec<u64> {
    dimensions
        .iter()
        .zip(factors)
        .map(|(&d, &f)| d.div_ceil(f as u64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isotropic_volume_halves_every_axis() {
        let p = propose_mipmaps(&[256, 256, 256], &[1.0, 1.0, 1.0], &PlannerConfig::default()).unwrap();
        assert_eq!(p.resolutions, vec![vec![1, 1, 1], vec![2, 2, 2], vec![4, 4, 4]]);
        assert_eq!(p.subdivisions, vec![vec![64, 64, 64]; 3]);
    }

    #[test]
    fn anisotropic_volume_catches_up_on_fine_axes() {
        let p = propose_mipmaps(&[1024, 1024, 64], &[0.5, 0.5, 2.0], &PlannerConfig::default()).unwrap();
        assert_eq!(p.resolutions[1], vec![2, 2, 1]);
        assert_eq!(p.resolutions[2], vec![4, 4, 1]);
        assert_eq!(p.resolutions[3], vec![8, 8, 2]);
    }

    #[test]
    fn flat_image_never_doubles_singleton_axis() {
        let p = propose_mipmaps(&[2048, 2048, 1], &[1.0, 1.0, 1.0], &PlannerConfig::default()).unwrap();
        assert!(p.resolutions.iter().all(|r| r[2] == 1));
        let last = p.resolutions.last().unwrap();
        let dims = downsampled_dimensions(&[2048, 2048, 1], last);
        assert!(dims.iter().product::<u64>() <= DEFAULT_MAX_BLOCK_ELEMENTS);
    }

    #[test]
    fn small_image_has_single_level_with_clamped_blocks() {
        let p = propose_mipmaps(&[30, 100, 5], &[1.0, 1.0, 1.0], &PlannerConfig::default()).unwrap();
        assert_eq!(p.resolutions, vec![vec![1, 1, 1]]);
        assert_eq!(p.subdivisions, vec![vec![30, 64, 5]]);
    }

    #[test]
    fn plan_dimensions_are_ceiled() {
        let plan = LevelPlan::from_arrays(
            &[100, 51, 7],
            &[vec![1, 1, 1], vec![2, 2, 2], vec![4, 4, 2]],
            &vec![vec![32, 32, 32]; 3],
        ).unwrap();
        assert_eq!(plan.levels()[1].dimensions, vec![50, 26, 4]);
        assert_eq!(plan.levels()[2].dimensions, vec![25, 13, 4]);
        assert_eq!(plan.levels()[0].grid_shape(), vec![4, 2, 1]);
    }

    #[test]
    fn rejects_bad_arrays() {
        let dims = [64, 64, 64];
        assert!(LevelPlan::from_arrays(&dims, &[], &[]).unwrap_err().is_config());
        assert!(LevelPlan::from_arrays(&dims, &[vec![1, 1, 1]], &[]).unwrap_err().is_config());
        assert!(LevelPlan::from_arrays(&dims, &[vec![1, 1]], &[vec![8, 8]]).unwrap_err().is_config());
        assert!(LevelPlan::from_arrays(&dims, &[vec![2, 2, 2]], &[vec![8, 8, 8]]).unwrap_err().is_config());
        assert!(LevelPlan::from_arrays(&dims, &[vec![1, 1, 1]], &[vec![8, 0, 8]]).unwrap_err().is_config());
        let not_coarser = LevelPlan::from_arrays(
            &dims,
            &[vec![1, 1, 1], vec![2, 2, 2], vec![2, 2, 2]],
            &vec![vec![8, 8, 8]; 3],
        );
        assert!(not_coarser.unwrap_err().is_config());
    }

    #[test]
    fn previous_level_skips_original_and_non_divisors() {
        let plan = LevelPlan::from_arrays(
            &[512, 512, 512],
            &[vec![1, 1, 1], vec![2, 2, 1], vec![3, 3, 3], vec![4, 4, 4], vec![8, 8, 8]],
            &vec![vec![32, 32, 32]; 5],
        ).unwrap();
        assert_eq!(plan.previous_level(0), None);
        assert_eq!(plan.previous_level(1), None);
        assert_eq!(plan.previous_level(2), None);
        assert_eq!(plan.previous_level(3), Some(1));
        assert_eq!(plan.factors_between(1, 3), vec![2, 2, 4]);
        assert_eq!(plan.previous_level(4), Some(3));
        assert_eq!(plan.factors_between(3, 4), vec![2, 2, 2]);
    }
}
