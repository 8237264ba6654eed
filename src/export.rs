//! Export coordination, the primary embedding surface.
//!
//! ```no_run
//! use pyramid_export::export::{export_to_directory, ExportOptions};
//! use pyramid_export::progress::TracingProgress;
//! use pyramid_export::source::InMemoryImage;
//!
//! let image = InMemoryImage::from_fn(vec![256, 256, 64], |p| (p[0] ^ p[1]) as u16)?;
//! let summary = export_to_directory(&image, "out.n5", &ExportOptions::default(), &mut TracingProgress::default())?;
//! println!("{} blocks written", summary.blocks_written);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Algorithm
//! For every (timepoint, setup) pair, in order:
//! 1. create the dataset of every level (first 5 % of the pair's progress);
//! 2. for every level, decide whether to read the original image or loop back
//!    to a written level, then for every plane of blocks along the last axis
//!    compute all blocks on the worker pool, wait for all of them, write them
//!    in grid order, run the after-plane callback and report progress.
//!
//! Only the coordinating thread writes.  Output is independent of the number
//! of workers.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{planes_of_blocks, Block, BlockComputer, OriginalRegion, RegionReader};
use crate::codec::Compression;
use crate::downsample::DownsamplingMethod;
use crate::error::{ExportError, Result};
use crate::loopback::{DefaultLoopbackHeuristic, LoopbackHeuristic, LoopbackInput};
use crate::memory::{AfterPlaneCallback, CacheEvictionPolicy, MemoryBudget, SystemMemoryBudget, DEFAULT_EVICTION_THRESHOLD};
use crate::plan::{LevelPlan, PlannerConfig, PyramidLevel};
use crate::progress::{ProgressRange, ProgressSink};
use crate::region::num_elements;
use crate::source::SourceImage;
use crate::writer::{
    directory_storage, DatasetAttributes, DatasetHandle, DatasetKey, DatasetWriter, ExportDescription, Layout,
    N5Writer, OmeZarrWriter, WrittenLevel,
};

/// Share of a pair's progress spent creating datasets.
const DATASET_PROGRESS: f64 = 0.05;

// ── ExportOptions ────────────────────────────────────────────────────────────

/// Serializable export configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub layout:                   Layout,
    pub compression:              Compression,
    pub method:                   DownsamplingMethod,
    /// `None` selects [`default_worker_count`].
    pub workers:                  Option<usize>,
    pub planner:                  PlannerConfig,
    pub loopback_memory_fraction: f64,
    pub eviction_threshold:       f64,
    /// Written into multiscale metadata when non-empty.
    pub name:                     String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            layout:                   Layout::default(),
            compression:              Compression::default(),
            method:                   DownsamplingMethod::default(),
            workers:                  None,
            planner:                  PlannerConfig::default(),
            loopback_memory_fraction: DefaultLoopbackHeuristic::default().memory_fraction,
            eviction_threshold:       DEFAULT_EVICTION_THRESHOLD,
            name:                     String::new(),
        }
    }
}

impl ExportOptions {
    /// Read options from a JSON file; missing fields keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Available parallelism minus one for the coordinator, at least one.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(2)
        .saturating_sub(1)
        .max(1)
}

// ── Cancellation, state, summary ─────────────────────────────────────────────

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Observable coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Planning,
    Writing { timepoint: usize, setup: usize, level: usize },
    Done,
    Failed,
}

/// What an export produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub datasets:        usize,
    pub blocks_written:  u64,
    /// Levels (summed over all pairs) computed from a written level.
    pub loopback_levels: usize,
    pub pairs:           usize,
}

// ── ExportJob ────────────────────────────────────────────────────────────────

/// One configured export of one source.
pub struct ExportJob<'a, S: SourceImage> {
    source:             &'a S,
    plan:               LevelPlan,
    method:             DownsamplingMethod,
    compression:        Compression,
    workers:            usize,
    loopback:           Box<dyn LoopbackHeuristic + 'a>,
    /// `None` selects a [`CacheEvictionPolicy`] over `memory`.
    after_plane:        Option<Box<dyn AfterPlaneCallback + 'a>>,
    memory:             Arc<dyn MemoryBudget>,
    eviction_threshold: f64,
    cancel:             CancellationToken,
    name:               String,
    state:              ExportState,
}

impl<'a, S: SourceImage> ExportJob<'a, S> {
    /// Export `source` with the levels of `plan` and default settings.
    pub fn new(source: &'a S, plan: LevelPlan) -> Result<Self> {
        let job = Self {
            source,
            plan,
            method:             DownsamplingMethod::default(),
            compression:        Compression::default(),
            workers:            default_worker_count(),
            loopback:           Box::new(DefaultLoopbackHeuristic::default()),
            after_plane:        None,
            memory:             Arc::new(SystemMemoryBudget::new()),
            eviction_threshold: DEFAULT_EVICTION_THRESHOLD,
            cancel:             CancellationToken::new(),
            name:               String::new(),
            state:              ExportState::Planning,
        };
        job.validate_source()?;
        Ok(job)
    }

    /// Plan levels with the proposal rule and apply `options`.
    pub fn from_options(source: &'a S, options: &ExportOptions) -> Result<Self> {
        let plan = LevelPlan::propose(source.dimensions(), &source.voxel_size().size, &options.planner)?;
        let job = Self::new(source, plan)?
            .with_method(options.method)
            .with_compression(options.compression)
            .with_workers(options.workers.unwrap_or_else(default_worker_count))
            .with_loopback(DefaultLoopbackHeuristic::with_memory_fraction(options.loopback_memory_fraction))
            .with_eviction_threshold(options.eviction_threshold)
            .with_name(options.name.clone());
        Ok(job)
    }

    pub fn with_method(mut self, method: DownsamplingMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Zero is rejected when the export runs.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_loopback(mut self, heuristic: impl LoopbackHeuristic + 'a) -> Self {
        self.loopback = Box::new(heuristic);
        self
    }

    pub fn with_after_plane(mut self, callback: impl AfterPlaneCallback + 'a) -> Self {
        self.after_plane = Some(Box::new(callback));
        self
    }

    /// The budget behind both the loopback decision and the default cache
    /// eviction.
    pub fn with_memory_budget(mut self, budget: Arc<dyn MemoryBudget>) -> Self {
        self.memory = budget;
        self
    }

    /// Available-memory fraction below which the default after-plane
    /// callback evicts a virtual source's cache.
    pub fn with_eviction_threshold(mut self, threshold: f64) -> Self {
        self.eviction_threshold = threshold;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn plan(&self) -> &LevelPlan {
        &self.plan
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn state(&self) -> ExportState {
        self.state
    }

    fn validate_source(&self) -> Result<()> {
        let dims = self.source.dimensions();
        if self.plan.full_resolution() != dims {
            return Err(ExportError::config(format!(
                "levels are planned for {:?}, image is {dims:?}",
                self.plan.full_resolution()
            )));
        }
        if self.source.voxel_size().size.len() != dims.len() {
            return Err(ExportError::config(format!(
                "voxel size has {} axes, image has {}",
                self.source.voxel_size().size.len(),
                dims.len()
            )));
        }
        if self.source.num_timepoints() == 0 || self.source.num_setups() == 0 {
            return Err(ExportError::config("image has no timepoints or setups"));
        }
        Ok(())
    }

    /// Every check that can fail without touching the destination, for an
    /// export in `layout`.
    pub fn validate(&self, layout: Layout) -> Result<()> {
        self.validate_source()?;
        if self.workers == 0 {
            return Err(ExportError::config("worker count must be at least 1"));
        }
        layout.validate(self.source.dimensions().len(), self.compression)
    }

    /// Run the export into `writer`.
    ///
    /// Configuration errors are reported before any dataset is created.  Any
    /// error aborts the export and leaves the state at [`ExportState::Failed`].
    pub fn run<W: DatasetWriter + Sync>(
        &mut self,
        writer:   &mut W,
        progress: &mut dyn ProgressSink,
    ) -> Result<ExportSummary> {
        self.state = ExportState::Planning;
        let mut callback: Box<dyn AfterPlaneCallback + 'a> = match self.after_plane.take() {
            Some(callback) => callback,
            None => Box::new(CacheEvictionPolicy::with_threshold(self.memory.clone(), self.eviction_threshold)),
        };
        let result = self.run_pairs(writer, progress, callback.as_mut());
        self.after_plane = Some(callback);

        match &result {
            Ok(summary) => {
                self.state = ExportState::Done;
                info!(
                    datasets = summary.datasets,
                    blocks = summary.blocks_written,
                    loopback_levels = summary.loopback_levels,
                    "export complete"
                );
            }
            Err(e) => {
                warn!(state = ?self.state, error = %e, "export failed");
                self.state = ExportState::Failed;
            }
        }
        result
    }

    fn run_pairs<W: DatasetWriter + Sync>(
        &mut self,
        writer:   &mut W,
        progress: &mut dyn ProgressSink,
        callback: &mut dyn AfterPlaneCallback,
    ) -> Result<ExportSummary> {
        self.validate(writer.layout())?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("pyramid-worker-{i}"))
            .build()
            .map_err(|e| ExportError::WorkerPool(e.to_string()))?;

        let timepoints = self.source.num_timepoints();
        let setups     = self.source.num_setups();
        info!(
            dimensions = ?self.source.dimensions(),
            data_type = %self.source.data_type(),
            levels = self.plan.len(),
            timepoints,
            setups,
            workers = self.workers,
            layout = writer.layout().name(),
            compression = self.compression.name(),
            "starting export"
        );

        writer.begin_export(&ExportDescription {
            name:           self.name.clone(),
            dimensions:     self.source.dimensions().to_vec(),
            data_type:      self.source.data_type(),
            voxel_size:     self.source.voxel_size().clone(),
            levels:         self.plan.levels().to_vec(),
            method:         self.method,
            compression:    self.compression,
            num_timepoints: timepoints,
            num_setups:     setups,
        })?;

        let max_memory = self.memory.max_memory();
        let pairs = timepoints * setups;
        let mut summary = ExportSummary::default();
        for timepoint in 0..timepoints {
            for setup in 0..setups {
                if self.cancel.is_cancelled() {
                    return Err(ExportError::Cancelled);
                }
                let index = timepoint * setups + setup;
                let range = ProgressRange::FULL.split(index, pairs);
                progress.message(&format!("timepoint {timepoint}, setup {setup}"));
                self.export_pair(&pool, writer, timepoint, setup, range, progress, callback, max_memory, &mut summary)?;
                summary.pairs += 1;
            }
        }

        writer.finish()?;
        progress.set_progress(1.0);
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn export_pair<W: DatasetWriter + Sync>(
        &mut self,
        pool:       &ThreadPool,
        writer:     &mut W,
        timepoint:  usize,
        setup:      usize,
        range:      ProgressRange,
        progress:   &mut dyn ProgressSink,
        callback:   &mut dyn AfterPlaneCallback,
        max_memory: u64,
        summary:    &mut ExportSummary,
    ) -> Result<()> {
        info!(timepoint, setup, "exporting pair");
        let levels = self.plan.levels().to_vec();
        let data_type = self.source.data_type();

        let dataset_range = range.sub_range(0.0, DATASET_PROGRESS);
        let mut handles: Vec<DatasetHandle> = Vec::with_capacity(levels.len());
        for level in &levels {
            let key = DatasetKey { timepoint, setup, level: level.index };
            let attributes = DatasetAttributes::for_level(level, data_type, self.compression);
            handles.push(writer.create_dataset(key, &attributes)?);
            summary.datasets += 1;
            dataset_range.report(progress, handles.len() as f64 / levels.len() as f64);
        }

        let block_range = range.sub_range(DATASET_PROGRESS, 1.0);
        let total_blocks: u64 = levels.iter().map(PyramidLevel::num_blocks).sum();
        let mut written = 0u64;

        for level in &levels {
            self.state = ExportState::Writing { timepoint, setup, level: level.index };
            let previous = self.choose_loopback(level, max_memory)?;
            if previous.is_some() {
                summary.loopback_levels += 1;
            }
            info!(level = level.index, dimensions = ?level.dimensions, loopback = ?previous, "writing level");

            for (z, plane) in planes_of_blocks(level).iter().enumerate() {
                let blocks = match previous {
                    Some(p) => {
                        let reader = WrittenLevel { writer: &*writer, handle: &handles[p] };
                        let factors = self.plan.factors_between(p, level.index);
                        self.compute_plane(pool, level, &reader, factors, plane)?
                    }
                    None => {
                        let reader = OriginalRegion { source: self.source, timepoint, setup };
                        let factors = level.factors_to_original.clone();
                        self.compute_plane(pool, level, &reader, factors, plane)?
                    }
                };

                let handle = &handles[level.index];
                for block in &blocks {
                    writer.write_block(handle, block)?;
                }
                written += blocks.len() as u64;
                summary.blocks_written += blocks.len() as u64;

                callback.after_plane(previous.is_some(), self.source);
                block_range.report(progress, written as f64 / total_blocks.max(1) as f64);
                debug!(level = level.index, plane = z, blocks = blocks.len(), "plane written");
            }
        }
        Ok(())
    }

    /// The level to read instead of the original, if the heuristic asks for one.
    fn choose_loopback(&self, level: &PyramidLevel, max_memory: u64) -> Result<Option<usize>> {
        if level.index == 0 {
            return Ok(None);
        }
        let previous = self.plan.previous_level(level.index);
        let factors_to_previous = previous.map(|p| self.plan.factors_between(p, level.index));
        let dims = self.source.dimensions();
        let plane_size_bytes =
            num_elements(&dims[..dims.len() - 1]) * self.source.data_type().bytes_per_sample() as u64;

        let input = LoopbackInput {
            previous_level:      previous,
            factors_to_original: &level.factors_to_original,
            factors_to_previous: factors_to_previous.as_deref(),
            block_shape:         &level.block_shape,
            is_virtual:          self.source.is_virtual(),
            plane_size_bytes,
            max_memory_bytes:    max_memory,
        };
        let decision = self.loopback.decide(&input);
        if self.loopback.decide(&input) != decision {
            return Err(ExportError::defect(format!(
                "loopback heuristic gave two answers for level {}",
                level.index
            )));
        }
        debug!(level = level.index, previous = ?previous, decision, "loopback decision");

        match (decision, previous) {
            (false, _)      => Ok(None),
            (true, Some(p)) => Ok(Some(p)),
            (true, None)    => Err(ExportError::defect(format!(
                "loopback requested for level {} which has no previous level",
                level.index
            ))),
        }
    }

    /// Compute every block of one plane on the pool, in grid order.
    fn compute_plane<R>(
        &self,
        pool:    &ThreadPool,
        level:   &PyramidLevel,
        reader:  &R,
        factors: Vec<u32>,
        plane:   &[Vec<u64>],
    ) -> Result<Vec<Block<S::Pixel>>>
    where
        R: RegionReader<S::Pixel> + ?Sized,
    {
        let computer = BlockComputer::new(level, reader, factors, self.method)?;
        let cancel = &self.cancel;
        pool.install(|| {
            plane
                .par_iter()
                .map(|grid| {
                    if cancel.is_cancelled() {
                        return Err(ExportError::Cancelled);
                    }
                    computer.compute(grid)
                })
                .collect()
        })
    }
}

// ── Convenience entry points ─────────────────────────────────────────────────

/// Plan and export `source` into `writer`.
pub fn export_pyramid<S: SourceImage, W: DatasetWriter + Sync>(
    source:   &S,
    writer:   &mut W,
    options:  &ExportOptions,
    progress: &mut dyn ProgressSink,
) -> Result<ExportSummary> {
    ExportJob::from_options(source, options)?.run(writer, progress)
}

/// Plan and export `source` into a directory, in `options.layout`.
///
/// The job is validated against the layout before the directory is opened,
/// so a configuration error leaves the file system untouched.
pub fn export_to_directory<S: SourceImage, P: AsRef<Path>>(
    source:   &S,
    path:     P,
    options:  &ExportOptions,
    progress: &mut dyn ProgressSink,
) -> Result<ExportSummary> {
    let mut job = ExportJob::from_options(source, options)?;
    job.validate(options.layout)?;
    let storage = directory_storage(path)?;
    match options.layout {
        Layout::N5 => {
            let mut writer = N5Writer::new(storage);
            job.run(&mut writer, progress)
        }
        Layout::OmeZarr => {
            let mut writer = OmeZarrWriter::new(storage);
            job.run(&mut writer, progress)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FixedMemoryBudget;
    use crate::progress::NoProgress;
    use crate::source::InMemoryImage;
    use crate::writer::Storage;
    use zarrs::storage::store::MemoryStore;
    use zarrs::storage::ListableStorageTraits;

    fn memory() -> Storage {
        Arc::new(MemoryStore::new())
    }

    fn ramp() -> InMemoryImage<u16> {
        InMemoryImage::from_fn(vec![20, 12, 9], |p| (p[0] + 3 * p[1] + 7 * p[2]) as u16).unwrap()
    }

    fn plan() -> LevelPlan {
        LevelPlan::from_arrays(
            &[20, 12, 9],
            &[vec![1, 1, 1], vec![2, 2, 2], vec![4, 4, 4], vec![8, 8, 8]],
            &vec![vec![8, 8, 4]; 4],
        ).unwrap()
    }

    #[test]
    fn default_workers_leave_one_core() {
        assert!(default_worker_count() >= 1);
    }

    #[test]
    fn options_fill_missing_fields() {
        let opts: ExportOptions = serde_json::from_str(
            r#"{"layout": "ome-zarr", "compression": {"type": "zstd", "level": 5}, "planner": {"max_block_edge": 32}}"#,
        ).unwrap();
        assert_eq!(opts.layout, Layout::OmeZarr);
        assert_eq!(opts.compression, Compression::Zstd { level: 5 });
        assert_eq!(opts.planner.max_block_edge, 32);
        assert_eq!(opts.planner.max_block_elements, PlannerConfig::default().max_block_elements);
        assert_eq!(opts.method, DownsamplingMethod::Average);
    }

    #[test]
    fn counts_datasets_blocks_and_loopback_levels() {
        let img = ramp();
        let mut job = ExportJob::new(&img, plan()).unwrap()
            .with_workers(2)
            .with_compression(Compression::Raw)
            .with_memory_budget(Arc::new(FixedMemoryBudget::new(1 << 30)));
        let mut writer = N5Writer::new(memory());
        let summary = job.run(&mut writer, &mut NoProgress).unwrap();
        // grids: 3x2x3, 2x1x2, 1x1x1, 1x1x1
        assert_eq!(summary.datasets, 4);
        assert_eq!(summary.blocks_written, 18 + 4 + 1 + 1);
        // level 2 loops back to level 1 (ratio 8); level 3 to level 2
        assert_eq!(summary.loopback_levels, 2);
        assert_eq!(job.state(), ExportState::Done);
    }

    #[test]
    fn zero_workers_fail_before_any_output() {
        let img = ramp();
        let mut job = ExportJob::new(&img, plan()).unwrap().with_workers(0);
        let storage = memory();
        let err = job.run(&mut N5Writer::new(storage.clone()), &mut NoProgress).unwrap_err();
        assert!(err.is_config());
        assert!(storage.list().unwrap().is_empty());
        assert_eq!(job.state(), ExportState::Failed);
    }

    #[test]
    fn options_share_one_memory_budget() {
        let img = ramp();
        let options = ExportOptions { eviction_threshold: 0.4, ..ExportOptions::default() };
        let job = ExportJob::from_options(&img, &options).unwrap();
        assert_eq!(Arc::strong_count(&job.memory), 1);
        assert!(job.after_plane.is_none());
        assert_eq!(job.eviction_threshold, 0.4);
    }

    #[test]
    fn layout_checks_run_before_any_output() {
        let flat = InMemoryImage::from_fn(vec![4, 4, 2, 2], |p| p[0] as u8).unwrap();
        let plan = LevelPlan::from_arrays(&[4, 4, 2, 2], &[vec![1, 1, 1, 1]], &[vec![4, 4, 2, 2]]).unwrap();
        let mut job = ExportJob::new(&flat, plan).unwrap().with_compression(Compression::Raw);
        assert!(job.validate(Layout::N5).is_ok());
        assert!(job.validate(Layout::OmeZarr).unwrap_err().is_config());

        let storage = memory();
        let err = job.run(&mut OmeZarrWriter::new(storage.clone()), &mut NoProgress).unwrap_err();
        assert!(err.is_config());
        assert!(storage.list().unwrap().is_empty());
    }

    #[test]
    fn mismatched_plan_is_rejected_at_construction() {
        let img = ramp();
        let other = LevelPlan::from_arrays(&[20, 12, 10], &[vec![1, 1, 1]], &[vec![8, 8, 8]]).unwrap();
        assert!(ExportJob::new(&img, other).err().is_some_and(|e| e.is_config()));
    }

    #[test]
    fn inconsistent_heuristic_is_a_defect() {
        use std::sync::atomic::AtomicUsize;

        struct Flip(AtomicUsize);
        impl LoopbackHeuristic for Flip {
            fn decide(&self, _: &LoopbackInput<'_>) -> bool {
                self.0.fetch_add(1, Ordering::Relaxed) % 2 == 0
            }
        }

        let img = ramp();
        let mut job = ExportJob::new(&img, plan()).unwrap()
            .with_loopback(Flip(AtomicUsize::new(0)))
            .with_workers(1);
        let err = job.run(&mut N5Writer::new(memory()), &mut NoProgress).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Defect);
    }

    #[test]
    fn progress_is_monotonic_and_complete() {
        let img = ramp();
        let mut seen = Vec::new();
        {
            let mut sink = |f: f64| seen.push(f);
            let mut job = ExportJob::new(&img, plan()).unwrap().with_workers(3);
            job.run(&mut N5Writer::new(memory()), &mut sink).unwrap();
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(1.0));
        assert!(seen.iter().any(|&f| (f - 0.05).abs() < 1e-9));
    }
}
