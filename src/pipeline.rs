//! # Index Build Pipeline
//!
//! Track directory → per-file tallies (parallel) → single-writer merge into a
//! [`PopularityStore`] → flush.
//!
//! ## Concurrency
//! Matching runs on a fixed-size rayon pool. Every worker returns an isolated
//! [`Tally`] over a channel and the calling thread is the only one that ever
//! touches the store, merging results in completion order. Merging is a
//! per-edge sum, so the final index does not depend on file order or on
//! scheduling.
//!
//! ## Failures
//! What happens when a track file cannot be read is a [`FailurePolicy`]:
//! abort the whole build (nothing is flushed), or skip the file and report it
//! in [`BuildSummary::failures`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{PopularityError, Result};
use crate::matcher::{EdgeMatcher, Tally, MAX_SNAP_DISTANCE};
use crate::network::{EdgeLocator, RoadNetwork};
use crate::store::PopularityStore;
use crate::track::TrackFileSource;

// ============================================================================
// Configuration
// ============================================================================

/// What to do when a single track file cannot be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failed file and leave no index behind.
    #[default]
    AbortOnFirstError,
    /// Skip failed files, keep going and list them in the summary.
    BestEffort,
}

/// Configuration for an index build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Points farther than this from every edge are ignored (meters, exclusive).
    /// Default: 5.0
    pub max_snap_distance: f64,

    /// Worker threads used for matching. 0 means one per logical CPU.
    /// Default: 0
    pub workers: usize,

    /// Default: abort on the first failed file
    pub failure_policy: FailurePolicy,

    /// Log progress every N merged files.
    /// Default: 1000
    pub progress_interval: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            max_snap_distance: MAX_SNAP_DISTANCE,
            workers: 0,
            failure_policy: FailurePolicy::AbortOnFirstError,
            progress_interval: 1000,
        }
    }
}

impl BuildConfig {
    /// Read a config from JSON. Missing fields keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read(path).map_err(|e| PopularityError::io(path, e))?;
        let config: Self = serde_json::from_slice(&content).map_err(|e| {
            PopularityError::Configuration(format!("invalid build config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.max_snap_distance.is_finite() || self.max_snap_distance <= 0.0 {
            return Err(PopularityError::Configuration(format!(
                "max_snap_distance must be a positive number of meters, got {}",
                self.max_snap_distance
            )));
        }
        Ok(())
    }

    /// Effective size of the worker pool.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

// ============================================================================
// Progress and summary
// ============================================================================

/// Running counters of a build. Informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildProgress {
    pub files_done: usize,
    pub files_total: usize,
    pub increments_applied: u64,
}

/// A track file that was skipped under [`FailurePolicy::BestEffort`].
#[derive(Debug)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: PopularityError,
}

/// Outcome of a build.
#[derive(Debug, Default)]
pub struct BuildSummary {
    pub files_total: usize,
    pub files_merged: usize,
    pub increments_applied: u64,
    /// Edges with a non-zero raw counter after the build
    pub edges_with_evidence: usize,
    pub failures: Vec<FileFailure>,
}

impl BuildSummary {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Receives progress events of one build. Called from the merging thread
/// only.
pub trait ProgressReporter {
    fn file_merged(&mut self, _progress: &BuildProgress) {}

    fn file_failed(&mut self, _path: &Path, _error: &PopularityError) {}

    fn finished(&mut self, _summary: &BuildSummary) {}
}

/// Discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Logs progress every `interval` files, plus failures and the final summary.
#[derive(Debug, Clone)]
pub struct LogReporter {
    interval: usize,
    /// Index of the last `interval`-sized block of files that was logged
    logged_block: usize,
    started: Instant,
}

impl LogReporter {
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
            logged_block: 0,
            started: Instant::now(),
        }
    }
}

impl ProgressReporter for LogReporter {
    fn file_merged(&mut self, progress: &BuildProgress) {
        // Failed files also advance files_done, so a block boundary can be
        // crossed between two merges.
        let block = progress.files_done / self.interval;
        if block > self.logged_block {
            self.logged_block = block;
            info!(
                "Processed {}/{} track files, {} increments applied ({:.1}s)",
                progress.files_done,
                progress.files_total,
                progress.increments_applied,
                self.started.elapsed().as_secs_f64()
            );
        }
    }

    fn file_failed(&mut self, path: &Path, error: &PopularityError) {
        warn!("Skipping track file {}: {}", path.display(), error);
    }

    fn finished(&mut self, summary: &BuildSummary) {
        info!(
            "Tallied {} of {} track files in {:.1}s: {} increments over {} edges, {} failed",
            summary.files_merged,
            summary.files_total,
            self.started.elapsed().as_secs_f64(),
            summary.increments_applied,
            summary.edges_with_evidence,
            summary.failures.len()
        );
    }
}

// ============================================================================
// Strategies
// ============================================================================

/// One way of filling a freshly created store.
///
/// Each on-disk popularity source the index has been built from over time is
/// a strategy; they all write raw counters through the same store API.
pub trait PopularityBuildStrategy {
    fn name(&self) -> &str;

    fn load_data(
        &self,
        store: &mut PopularityStore,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<BuildSummary>;
}

/// Current strategy: snap a directory of GPS tracks and count confirmed
/// traversals per edge.
pub struct EdgeTallyStrategy<L> {
    source: TrackFileSource,
    matcher: EdgeMatcher<L>,
    config: BuildConfig,
}

impl<L: EdgeLocator> EdgeTallyStrategy<L> {
    pub fn new(source: TrackFileSource, locator: L, config: BuildConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            matcher: EdgeMatcher::new(locator, config.max_snap_distance),
            config,
        })
    }
}

impl<L: EdgeLocator> PopularityBuildStrategy for EdgeTallyStrategy<L> {
    fn name(&self) -> &str {
        "edge-tally"
    }

    fn load_data(
        &self,
        store: &mut PopularityStore,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<BuildSummary> {
        let files = self.source.files()?;
        info!(
            "Tallying {} track files from {} on {} workers",
            files.len(),
            self.source.root().display(),
            self.config.worker_count()
        );
        tally_files(&files, &self.matcher, &self.config, store, reporter)
    }
}

// ============================================================================
// Fan-out / fan-in
// ============================================================================

/// Add every increment of `tally` to the store. Returns the number of
/// increments applied.
pub fn merge_tally(store: &mut PopularityStore, tally: &Tally) -> u64 {
    let mut applied = 0u64;
    for (&edge_id, &count) in tally {
        store.add_raw(edge_id, count);
        applied += u64::from(count);
    }
    applied
}

/// Match `files` in parallel and merge every tally into `store`.
pub fn tally_files<L: EdgeLocator>(
    files: &[PathBuf],
    matcher: &EdgeMatcher<L>,
    config: &BuildConfig,
    store: &mut PopularityStore,
    reporter: &mut dyn ProgressReporter,
) -> Result<BuildSummary> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_count())
        .thread_name(|i| format!("popularity-worker-{i}"))
        .build()
        .map_err(|e| PopularityError::Configuration(format!("cannot start worker pool: {e}")))?;

    let cancelled = AtomicBool::new(false);
    let (tx, rx) = crossbeam_channel::unbounded::<(usize, Result<Tally>)>();

    let mut summary = BuildSummary {
        files_total: files.len(),
        ..BuildSummary::default()
    };
    let mut progress = BuildProgress {
        files_total: files.len(),
        ..BuildProgress::default()
    };

    thread::scope(|scope| {
        let cancelled = &cancelled;
        scope.spawn(move || {
            pool.install(|| {
                files
                    .par_iter()
                    .enumerate()
                    .for_each_with(tx, |tx, (idx, path)| {
                        if cancelled.load(Ordering::Relaxed) {
                            return;
                        }
                        // A closed receiver means the build was aborted.
                        let _ = tx.send((idx, matcher.match_file(path)));
                    });
            });
        });

        for (idx, result) in rx.iter() {
            let path = &files[idx];
            match result {
                Ok(tally) => {
                    let applied = merge_tally(store, &tally);
                    debug!("{}: {} increments on {} edges", path.display(), applied, tally.len());

                    summary.files_merged += 1;
                    summary.increments_applied += applied;
                    progress.files_done += 1;
                    progress.increments_applied += applied;
                    reporter.file_merged(&progress);
                }
                Err(error) => {
                    reporter.file_failed(path, &error);
                    match config.failure_policy {
                        FailurePolicy::AbortOnFirstError => {
                            cancelled.store(true, Ordering::Relaxed);
                            return Err(PopularityError::TrackFile {
                                path: path.clone(),
                                source: Box::new(error),
                            });
                        }
                        FailurePolicy::BestEffort => {
                            progress.files_done += 1;
                            summary.failures.push(FileFailure {
                                path: path.clone(),
                                error,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    })?;

    summary.edges_with_evidence = store.raw_records().iter().filter(|&&raw| raw > 0).count();
    // Completion order is arbitrary; report failures in file order.
    summary.failures.sort_by(|a, b| a.path.cmp(&b.path));
    reporter.finished(&summary);
    Ok(summary)
}

/// Create the index for `network` at `path`, fill it with `strategy` (or
/// leave it empty when there is none) and flush it.
///
/// If the strategy or the flush fails, the partially written file is removed.
pub fn prepare_index<P, N>(
    path: P,
    network: &N,
    strategy: Option<&dyn PopularityBuildStrategy>,
    reporter: &mut dyn ProgressReporter,
) -> Result<(PopularityStore, BuildSummary)>
where
    P: AsRef<Path>,
    N: RoadNetwork + ?Sized,
{
    let path = path.as_ref();
    let mut store = PopularityStore::create(path, network)?;

    let summary = match strategy {
        Some(strategy) => {
            let started = Instant::now();
            match strategy.load_data(&mut store, reporter) {
                Ok(summary) => {
                    info!(
                        "Loading popularity data ({}) finished in {:.2} seconds",
                        strategy.name(),
                        started.elapsed().as_secs_f64()
                    );
                    summary
                }
                Err(e) => {
                    store.close();
                    discard_partial_index(path);
                    return Err(e);
                }
            }
        }
        None => {
            info!("No popularity source configured, writing an empty index");
            BuildSummary::default()
        }
    };

    if let Err(e) = store.flush() {
        store.close();
        discard_partial_index(path);
        return Err(e);
    }
    Ok((store, summary))
}

fn discard_partial_index(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(
            "Could not remove partial popularity index {}: {}",
            path.display(),
            e
        );
    }
}
