//! Progress reporting by sub-range composition.
//!
//! A [`ProgressRange`] is a plain value naming the slice `[start, end)` of the
//! overall export that a piece of work owns.  Work reports a local fraction in
//! `0..=1`; the range maps it into the global fraction before it reaches the
//! [`ProgressSink`].  Nested work receives a sub-range of its parent's range,
//! so the same mapping is reused at every level of nesting:
//!
//! ```text
//! export            [0.00, 1.00)
//!  └ pair 1 of 4    [0.25, 0.50)
//!     ├ datasets    [0.25, 0.2625)   first 5 %
//!     └ blocks      [0.2625, 0.50)   remaining 95 %
//! ```

use tracing::info;

/// Receiver of global progress fractions.
pub trait ProgressSink {
    fn set_progress(&mut self, fraction: f64);

    fn message(&mut self, _text: &str) {}
}

impl<F: FnMut(f64)> ProgressSink for F {
    fn set_progress(&mut self, fraction: f64) {
        self(fraction)
    }
}

/// Discards all progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn set_progress(&mut self, _: f64) {}
}

/// Logs progress through `tracing` whenever another tenth completes.
#[derive(Debug, Clone, Default)]
pub struct TracingProgress {
    last_decile: u32,
}

impl ProgressSink for TracingProgress {
    fn set_progress(&mut self, fraction: f64) {
        let decile = (fraction.clamp(0.0, 1.0) * 10.0).floor() as u32;
        if decile > self.last_decile {
            self.last_decile = decile;
            info!("export {}% complete", decile * 10);
        }
    }

    fn message(&mut self, text: &str) {
        info!("{text}");
    }
}

/// The slice `[start, end)` of global progress owned by one piece of work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressRange {
    start: f64,
    end:   f64,
}

impl Default for ProgressRange {
    fn default() -> Self {
        Self::FULL
    }
}

impl ProgressRange {
    pub const FULL: ProgressRange = ProgressRange { start: 0.0, end: 1.0 };

    pub fn new(start: f64, end: f64) -> Self {
        let start = start.clamp(0.0, 1.0);
        Self { start, end: end.clamp(start, 1.0) }
    }

    pub fn start(self) -> f64 {
        self.start
    }

    pub fn end(self) -> f64 {
        self.end
    }

    /// The part of this range between local fractions `from` and `to`.
    pub fn sub_range(self, from: f64, to: f64) -> Self {
        Self::new(self.map(from), self.map(to))
    }

    /// Part `index` of `count` equal parts.
    pub fn split(self, index: usize, count: usize) -> Self {
        let count = count.max(1) as f64;
        self.sub_range(index as f64 / count, (index + 1) as f64 / count)
    }

    /// Global fraction of local fraction `local`.
    pub fn map(self, local: f64) -> f64 {
        self.start + (self.end - self.start) * local.clamp(0.0, 1.0)
    }

    pub fn report(self, sink: &mut dyn ProgressSink, local: f64) {
        sink.set_progress(self.map(local));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn nested_ranges_compose() {
        let pair = ProgressRange::FULL.split(1, 4);
        assert!(close(pair.start(), 0.25) && close(pair.end(), 0.5));
        let blocks = pair.sub_range(0.05, 1.0);
        assert!(close(blocks.start(), 0.2625));
        assert!(close(blocks.map(1.0), 0.5));
        assert!(close(blocks.map(0.5), 0.2625 + 0.11875));
    }

    #[test]
    fn local_fractions_are_clamped() {
        let r = ProgressRange::new(0.2, 0.4);
        assert!(close(r.map(-1.0), 0.2));
        assert!(close(r.map(3.0), 0.4));
    }

    #[test]
    fn closures_receive_global_fractions() {
        let mut seen = Vec::new();
        {
            let mut sink = |f: f64| seen.push(f);
            ProgressRange::new(0.5, 1.0).report(&mut sink, 0.5);
        }
        assert_eq!(seen, vec![0.75]);
    }

    #[test]
    fn tracing_sink_tracks_deciles() {
        let mut sink = TracingProgress::default();
        sink.set_progress(0.05);
        assert_eq!(sink.last_decile, 0);
        sink.set_progress(0.31);
        assert_eq!(sink.last_decile, 3);
        sink.set_progress(0.2);
        assert_eq!(sink.last_decile, 3);
    }
}
