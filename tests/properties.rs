//! Property-based tests for planning, downsampling and block enumeration.

use proptest::prelude::*;
use pyramid_export::block::{block_interval, planes_of_blocks};
use pyramid_export::downsample::{downsample, DownsamplingMethod};
use pyramid_export::loopback::{DefaultLoopbackHeuristic, LoopbackHeuristic, LoopbackInput};
use pyramid_export::plan::{downsampled_dimensions, propose_mipmaps, LevelPlan, PlannerConfig};
use std::collections::HashSet;

fn dims_strategy() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..300, 2..=3)
}

fn method_strategy() -> impl Strategy<Value = DownsamplingMethod> {
    prop_oneof![Just(DownsamplingMethod::Average), Just(DownsamplingMethod::Nearest)]
}

// =============================================================================
// Planner
// =============================================================================

proptest! {
    /// Every proposed level is `ceil(dims / factors)`, coarsens its predecessor
    /// and has blocks no larger than the level or the edge limit.
    #[test]
    fn proposed_levels_are_well_formed(
        dims in dims_strategy(),
        edge in 1u32..96,
        max_elements in 1u64..20_000,
    ) {
        let config = PlannerConfig { max_block_elements: max_elements, max_block_edge: edge };
        let voxel = vec![1.0; dims.len()];
        let plan = LevelPlan::propose(&dims, &voxel, &config).unwrap();

        prop_assert_eq!(plan.full_resolution(), &dims[..]);
        for level in plan.levels() {
            let expected: Vec<u64> = dims
                .iter()
                .zip(&level.factors_to_original)
                .map(|(&d, &f)| d.div_ceil(f as u64))
                .collect();
            prop_assert_eq!(&level.dimensions, &expected);
            for (&b, &d) in level.block_shape.iter().zip(&level.dimensions) {
                prop_assert!(b >= 1 && b <= edge && b as u64 <= d);
            }
        }
        for pair in plan.levels().windows(2) {
            prop_assert!(pair[1].total_factor() > pair[0].total_factor());
        }
    }

    /// Anisotropic voxels are downsampled along the finer axes first.
    #[test]
    fn coarse_axes_wait_for_fine_ones(
        xy in 64u64..512,
        z in 8u64..64,
    ) {
        let dims = [xy, xy, z];
        let proposal = propose_mipmaps(&dims, &[1.0, 1.0, 4.0], &PlannerConfig::default()).unwrap();
        prop_assert_eq!(&proposal.resolutions[0], &vec![1, 1, 1]);
        if proposal.resolutions.len() > 1 {
            prop_assert_eq!(&proposal.resolutions[1], &vec![2, 2, 1]);
        }
    }
}

// =============================================================================
// Downsampling
// =============================================================================

proptest! {
    /// A constant region stays constant under every method and factor.
    #[test]
    fn constant_input_stays_constant(
        dims in prop::collection::vec(1u64..24, 1..=3),
        factor in 1u32..5,
        value in any::<u16>(),
        method in method_strategy(),
    ) {
        let factors = vec![factor; dims.len()];
        let dst = downsampled_dimensions(&dims, &factors);
        let src = vec![value; dims.iter().product::<u64>() as usize];
        let out = downsample(method, &src, &dims, &factors, &dst).unwrap();
        prop_assert_eq!(out.len() as u64, dst.iter().product::<u64>());
        prop_assert!(out.iter().all(|&v| v == value));
    }

    /// Averages never leave the range of their inputs.
    #[test]
    fn averages_stay_within_input_range(
        src in prop::collection::vec(any::<u8>(), 60),
        fx in 1u32..6,
        fy in 1u32..6,
    ) {
        let dims = [12u64, 5];
        let factors = [fx, fy];
        let dst = downsampled_dimensions(&dims, &factors);
        let out = downsample(DownsamplingMethod::Average, &src, &dims, &factors, &dst).unwrap();
        let lo = *src.iter().min().unwrap();
        let hi = *src.iter().max().unwrap();
        prop_assert!(out.iter().all(|&v| v >= lo && v <= hi));
    }
}

// =============================================================================
// Block enumeration
// =============================================================================

proptest! {
    /// Planes of blocks enumerate every grid position once, and the block
    /// intervals tile the level exactly.
    #[test]
    fn blocks_tile_the_level(
        dims in dims_strategy(),
        edge in 1u32..64,
    ) {
        let block: Vec<u32> = dims.iter().map(|&d| (d as u32).min(edge)).collect();
        let plan = LevelPlan::from_arrays(&dims, &[vec![1; dims.len()]], &[block]).unwrap();
        let level = &plan.levels()[0];

        let planes = planes_of_blocks(level);
        prop_assert_eq!(planes.len() as u64, *level.grid_shape().last().unwrap());

        let mut seen = HashSet::new();
        let mut covered = 0u64;
        for (z, plane) in planes.iter().enumerate() {
            for grid in plane {
                prop_assert_eq!(*grid.last().unwrap(), z as u64);
                prop_assert!(seen.insert(grid.clone()));
                let (_, size) = block_interval(level, grid);
                covered += size.iter().product::<u64>();
            }
        }
        prop_assert_eq!(seen.len() as u64, level.num_blocks());
        prop_assert_eq!(covered, dims.iter().product::<u64>());
    }
}

// =============================================================================
// Loopback
// =============================================================================

proptest! {
    /// The stock heuristic is a pure function of its input and never loops
    /// back without a previous level.
    #[test]
    fn default_heuristic_is_pure(
        to_original in prop::collection::vec(1u32..16, 3),
        to_previous in prop::collection::vec(1u32..4, 3),
        has_previous in any::<bool>(),
        is_virtual in any::<bool>(),
        plane_size_bytes in 0u64..(1 << 30),
        max_memory_bytes in 0u64..(1 << 34),
    ) {
        let block = [64u32, 64, 64];
        let input = LoopbackInput {
            previous_level:      has_previous.then_some(1),
            factors_to_original: &to_original,
            factors_to_previous: has_previous.then_some(&to_previous[..]),
            block_shape:         &block,
            is_virtual,
            plane_size_bytes,
            max_memory_bytes,
        };
        let heuristic = DefaultLoopbackHeuristic::default();
        let first = heuristic.decide(&input);
        prop_assert_eq!(first, heuristic.decide(&input));
        if !has_previous {
            prop_assert!(!first);
        }
    }
}
