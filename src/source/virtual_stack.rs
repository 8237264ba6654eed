//! Lazily loaded image stacks.
//!
//! A [`VirtualImage`] holds no pixels up front.  Planes (all axes but the
//! last) are loaded on first access by a [`PlaneLoader`] and kept in a shared
//! cache until [`CacheControl::clear_cache`] evicts them.  Eviction skips any
//! plane a reader still holds, so clearing is safe during concurrent reads.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::LittleEndian;
use parking_lot::Mutex;
use tracing::debug;

use super::{CacheControl, SourceImage, VoxelSize};
use crate::dtype::{decode_samples, Pixel};
use crate::error::{ExportError, Result};
use crate::region::{check_bounds, copy_region, num_elements};

/// Loads one plane of one timepoint/setup.
pub trait PlaneLoader<T>: Send + Sync {
    /// Returns `num_elements(plane_dimensions)` samples, axis 0 fastest.
    fn load_plane(&self, timepoint: usize, setup: usize, plane: u64) -> Result<Vec<T>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PlaneKey {
    timepoint: usize,
    setup:     usize,
    plane:     u64,
}

/// Image whose planes are paged in on demand.
pub struct VirtualImage<T, L> {
    dimensions:   Vec<u64>,
    voxel_size:   VoxelSize,
    timepoints:   usize,
    setups:       usize,
    loader:       L,
    cache:        Mutex<HashMap<PlaneKey, Arc<Vec<T>>>>,
    planes_loaded: AtomicU64,
}

impl<T: Pixel, L: PlaneLoader<T>> VirtualImage<T, L> {
    pub fn new(dimensions: Vec<u64>, timepoints: usize, setups: usize, loader: L) -> Result<Self> {
        if dimensions.len() < 2 || dimensions.contains(&0) {
            return Err(ExportError::config(format!(
                "virtual images need at least two non-zero axes, got {dimensions:?}"
            )));
        }
        if timepoints == 0 || setups == 0 {
            return Err(ExportError::config("virtual image needs at least one timepoint and setup"));
        }
        let rank = dimensions.len();
        Ok(Self {
            dimensions,
            voxel_size: VoxelSize::unit_pixels(rank),
            timepoints,
            setups,
            loader,
            cache: Mutex::new(HashMap::new()),
            planes_loaded: AtomicU64::new(0),
        })
    }

    pub fn with_voxel_size(mut self, voxel_size: VoxelSize) -> Self {
        self.voxel_size = voxel_size;
        self
    }

    fn plane_dimensions(&self) -> &[u64] {
        &self.dimensions[..self.dimensions.len() - 1]
    }

    /// Planes currently resident.
    pub fn cached_planes(&self) -> usize {
        self.cache.lock().len()
    }

    /// Planes loaded since creation, including reloads after eviction.
    pub fn planes_loaded(&self) -> u64 {
        self.planes_loaded.load(Ordering::Relaxed)
    }

    fn plane(&self, key: PlaneKey) -> Result<Arc<Vec<T>>> {
        if let Some(plane) = self.cache.lock().get(&key) {
            return Ok(Arc::clone(plane));
        }
        // Loaded outside the lock; a racing reader may load the same plane,
        // the first insert wins.
        let data = self.loader.load_plane(key.timepoint, key.setup, key.plane)?;
        let expected = num_elements(self.plane_dimensions()) as usize;
        if data.len() != expected {
            return Err(ExportError::defect(format!(
                "plane loader returned {} samples, expected {expected}",
                data.len()
            )));
        }
        self.planes_loaded.fetch_add(1, Ordering::Relaxed);
        let mut cache = self.cache.lock();
        Ok(Arc::clone(cache.entry(key).or_insert_with(|| Arc::new(data))))
    }
}

impl<T: Pixel, L: PlaneLoader<T>> CacheControl for VirtualImage<T, L> {
    fn is_virtual(&self) -> bool {
        true
    }

    fn clear_cache(&self) {
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, plane| Arc::strong_count(plane) > 1);
        debug!(evicted = before - cache.len(), retained = cache.len(), "cleared plane cache");
    }
}

impl<T: Pixel, L: PlaneLoader<T>> SourceImage for VirtualImage<T, L> {
    type Pixel = T;

    fn dimensions(&self) -> &[u64] {
        &self.dimensions
    }

    fn voxel_size(&self) -> &VoxelSize {
        &self.voxel_size
    }

    fn num_timepoints(&self) -> usize {
        self.timepoints
    }

    fn num_setups(&self) -> usize {
        self.setups
    }

    fn read_region(&self, timepoint: usize, setup: usize, min: &[u64], size: &[u64]) -> Result<Vec<T>> {
        if timepoint >= self.timepoints || setup >= self.setups {
            return Err(ExportError::defect(format!(
                "timepoint {timepoint} / setup {setup} not in image"
            )));
        }
        check_bounds(min, size, &self.dimensions)?;
        let last = self.dimensions.len() - 1;
        let mut out = Vec::with_capacity(num_elements(size) as usize);
        for plane in min[last]..min[last] + size[last] {
            let data = self.plane(PlaneKey { timepoint, setup, plane })?;
            out.extend(copy_region(&data, self.plane_dimensions(), &min[..last], &size[..last]));
        }
        Ok(out)
    }
}

// ── Raw files ────────────────────────────────────────────────────────────────

/// Reads planes from an uncompressed little-endian volume file laid out
/// `[timepoint][setup][plane][...][x]`.
pub struct RawPlaneLoader<T> {
    path:        PathBuf,
    file:        Mutex<File>,
    plane_bytes: u64,
    planes:      u64,
    setups:      usize,
    _pixel:      PhantomData<fn() -> T>,
}

impl<T: Pixel> RawPlaneLoader<T> {
    /// Open `path` and check its length against the declared geometry.
    pub fn open<P: AsRef<Path>>(path: P, dimensions: &[u64], timepoints: usize, setups: usize) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = File::open(&path)?;
        let Some((&planes, plane_dims)) = dimensions.split_last() else {
            return Err(ExportError::config("raw volume needs at least one axis"));
        };
        let plane_bytes = num_elements(plane_dims) * T::DATA_TYPE.bytes_per_sample() as u64;
        let expected = plane_bytes * planes * (timepoints * setups) as u64;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(ExportError::config(format!(
                "{} holds {actual} bytes, {dimensions:?} x {timepoints} timepoints x {setups} setups of {} needs {expected}",
                path.display(),
                T::DATA_TYPE,
            )));
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
            plane_bytes,
            planes,
            setups,
            _pixel: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: Pixel> fmt::Debug for RawPlaneLoader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPlaneLoader")
            .field("path", &self.path)
            .field("data_type", &T::DATA_TYPE)
            .field("plane_bytes", &self.plane_bytes)
            .field("planes", &self.planes)
            .field("setups", &self.setups)
            .finish_non_exhaustive()
    }
}

impl<T: Pixel> PlaneLoader<T> for RawPlaneLoader<T> {
    fn load_plane(&self, timepoint: usize, setup: usize, plane: u64) -> Result<Vec<T>> {
        let index = (timepoint * self.setups + setup) as u64 * self.planes + plane;
        let mut bytes = vec![0u8; self.plane_bytes as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(index * self.plane_bytes))?;
            file.read_exact(&mut bytes)?;
        }
        let samples = self.plane_bytes as usize / T::DATA_TYPE.bytes_per_sample();
        decode_samples::<T, LittleEndian>(&bytes, samples)
    }
}
