use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use glam::DVec3;
use pointree_lib::storage::{BlobStore, MemoryStore};

use crate::error::{Error, Result};

/// Receives the absolute number of points merged so far.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Maps positions to another coordinate system; must return exactly one position per input.
pub type ReprojectFn = Arc<dyn Fn(&[DVec3]) -> Vec<DVec3> + Send + Sync>;

/// Settings for building and merging point cloud octrees.
///
/// All `with_*` methods return a modified copy, so a base configuration can be shared.
#[derive(Clone)]
pub struct ImportConfig {
    /// The maximum number of points a leaf may hold.
    pub split_limit: usize,
    /// Points closer than this are thinned out; zero keeps all points.
    pub min_dist: f64,
    /// Whether to thin out points to [`ImportConfig::min_dist`] whenever leaves are rebuilt during
    /// merging, not only when batches are imported.
    pub normalize_density_globally: bool,
    /// The number of worker threads; zero uses all available cores.
    pub max_parallelism: usize,
    /// Whether to remove duplicate positions from each imported batch.
    pub deduplicate_batches: bool,
    /// Larger incoming batches are cut into batches of at most this many points.
    pub max_batch_point_count: usize,
    /// Logs summaries of what the import did.
    pub verbose: bool,
    /// Verifies the post-conditions of every merge step.
    pub check_invariants: bool,
    pub progress: Option<ProgressFn>,
    pub reproject: Option<ReprojectFn>,
    /// Checked between batches; set it to stop an import early.
    pub cancellation: Arc<AtomicBool>,
    /// Where the final tree is written to.
    pub storage: Arc<dyn BlobStore>,
}

impl ImportConfig {
    pub const DEFAULT_SPLIT_LIMIT: usize = 8192;

    pub fn with_split_limit(&self, split_limit: usize) -> Self {
        Self {
            split_limit,
            ..self.clone()
        }
    }

    pub fn with_min_dist(&self, min_dist: f64) -> Self {
        Self {
            min_dist,
            ..self.clone()
        }
    }

    pub fn with_normalize_density_globally(&self, normalize_density_globally: bool) -> Self {
        Self {
            normalize_density_globally,
            ..self.clone()
        }
    }

    pub fn with_max_parallelism(&self, max_parallelism: usize) -> Self {
        Self {
            max_parallelism,
            ..self.clone()
        }
    }

    pub fn with_deduplicate_batches(&self, deduplicate_batches: bool) -> Self {
        Self {
            deduplicate_batches,
            ..self.clone()
        }
    }

    pub fn with_max_batch_point_count(&self, max_batch_point_count: usize) -> Self {
        Self {
            max_batch_point_count,
            ..self.clone()
        }
    }

    pub fn with_verbose(&self, verbose: bool) -> Self {
        Self {
            verbose,
            ..self.clone()
        }
    }

    pub fn with_check_invariants(&self, check_invariants: bool) -> Self {
        Self {
            check_invariants,
            ..self.clone()
        }
    }

    pub fn with_progress(&self, progress: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            progress: Some(Arc::new(progress)),
            ..self.clone()
        }
    }

    pub fn with_reproject(
        &self,
        reproject: impl Fn(&[DVec3]) -> Vec<DVec3> + Send + Sync + 'static,
    ) -> Self {
        Self {
            reproject: Some(Arc::new(reproject)),
            ..self.clone()
        }
    }

    pub fn with_cancellation(&self, cancellation: Arc<AtomicBool>) -> Self {
        Self {
            cancellation,
            ..self.clone()
        }
    }

    pub fn with_storage(&self, storage: Arc<dyn BlobStore>) -> Self {
        Self {
            storage,
            ..self.clone()
        }
    }

    /// Fails with [`Error::InvalidArgument`] for settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.split_limit == 0 {
            return Err(Error::InvalidArgument("split limit must not be zero".into()));
        }
        if !(self.min_dist >= 0.0 && self.min_dist.is_finite()) {
            return Err(Error::InvalidArgument(format!(
                "min distance must be finite and not negative, but is {}",
                self.min_dist
            )));
        }
        if self.max_batch_point_count == 0 {
            return Err(Error::InvalidArgument(
                "max batch point count must not be zero".into(),
            ));
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::Relaxed)
    }

    /// Requests running imports using this configuration to stop.
    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::Relaxed);
    }

    /// A dedicated thread pool if [`ImportConfig::max_parallelism`] limits the number of threads.
    pub fn thread_pool(&self) -> Result<Option<rayon::ThreadPool>> {
        if self.max_parallelism == 0 {
            return Ok(None);
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_parallelism)
            .build()
            .map(Some)
            .map_err(|error| Error::InvalidArgument(format!("cannot build thread pool: {error}")))
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            split_limit: Self::DEFAULT_SPLIT_LIMIT,
            min_dist: 0.0,
            normalize_density_globally: false,
            max_parallelism: 0,
            deduplicate_batches: true,
            max_batch_point_count: usize::MAX,
            verbose: false,
            check_invariants: cfg!(debug_assertions),
            progress: None,
            reproject: None,
            cancellation: Arc::default(),
            storage: Arc::new(MemoryStore::new()),
        }
    }
}

impl fmt::Debug for ImportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportConfig")
            .field("split_limit", &self.split_limit)
            .field("min_dist", &self.min_dist)
            .field("normalize_density_globally", &self.normalize_density_globally)
            .field("max_parallelism", &self.max_parallelism)
            .field("deduplicate_batches", &self.deduplicate_batches)
            .field("max_batch_point_count", &self.max_batch_point_count)
            .field("verbose", &self.verbose)
            .field("check_invariants", &self.check_invariants)
            .field("progress", &self.progress.is_some())
            .field("reproject", &self.reproject.is_some())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
