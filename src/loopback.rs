//! Loopback decision: read a level from the original image, or from an
//! already-written coarser level.
//!
//! Reading the original is exact but reads `elements(factors_to_original)`
//! source samples per destination sample.  Reading a previous level reads only
//! `elements(factors_to_previous)` but compounds rounding.  For virtual
//! sources the original planes of one plane-of-blocks must also fit in
//! memory.
//!
//! Heuristics receive everything they may consult in [`LoopbackInput`]; the
//! coordinator queries the memory budget and passes the figure in, so a
//! heuristic never reads mutable external state.

/// Inputs of one loopback decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopbackInput<'a> {
    /// Level that could be read instead of the original, if any.
    pub previous_level:      Option<usize>,
    pub factors_to_original: &'a [u32],
    /// Factors from `previous_level` to the current level.
    pub factors_to_previous: Option<&'a [u32]>,
    pub block_shape:         &'a [u32],
    pub is_virtual:          bool,
    /// Bytes of one original-resolution plane (all axes but the last).
    pub plane_size_bytes:    u64,
    pub max_memory_bytes:    u64,
}

pub trait LoopbackHeuristic: Send + Sync {
    fn decide(&self, input: &LoopbackInput<'_>) -> bool;
}

impl<F> LoopbackHeuristic for F
where
    F: Fn(&LoopbackInput<'_>) -> bool + Send + Sync,
{
    fn decide(&self, input: &LoopbackInput<'_>) -> bool {
        self(input)
    }
}

/// The stock rule set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefaultLoopbackHeuristic {
    /// Loop back once the original is this many times larger than the
    /// previous level.
    pub element_ratio:   u64,
    /// Share of the maximum memory one plane-of-blocks of original planes
    /// may take before a virtual source loops back.
    pub memory_fraction: f64,
}

impl Default for DefaultLoopbackHeuristic {
    fn default() -> Self {
        Self {
            element_ratio:   8,
            memory_fraction: 0.25,
        }
    }
}

impl DefaultLoopbackHeuristic {
    pub fn with_memory_fraction(memory_fraction: f64) -> Self {
        Self { memory_fraction, ..Self::default() }
    }
}

fn elements(factors: &[u32]) -> u64 {
    factors.iter().map(|&f| f as u64).product()
}

impl LoopbackHeuristic for DefaultLoopbackHeuristic {
    fn decide(&self, input: &LoopbackInput<'_>) -> bool {
        let factors_to_previous = match (input.previous_level, input.factors_to_previous) {
            (Some(_), Some(f)) => f,
            _ => return false,
        };

        let ratio = elements(input.factors_to_original) / elements(factors_to_previous).max(1);
        if ratio >= self.element_ratio {
            return true;
        }

        if input.is_virtual {
            let last = input.block_shape.len().saturating_sub(1);
            let depth = input.factors_to_original.get(last).copied().unwrap_or(1) as u128
                * input.block_shape.get(last).copied().unwrap_or(1) as u128;
            let required = input.plane_size_bytes as u128 * depth;
            let allowed = input.max_memory_bytes as f64 * self.memory_fraction;
            if required as f64 > allowed {
                return true;
            }
        }

        false
    }
}

/// Always read the original image.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverLoopback;

impl LoopbackHeuristic for NeverLoopback {
    fn decide(&self, _: &LoopbackInput<'_>) -> bool {
        false
    }
}
