//! Screenshot directory scanning
//!
//! A scan lists every game directory under the root, probes the images in
//! each one on a fixed pool of worker threads, and commits each game's
//! mapping to the index as soon as all of its files are done. Games that
//! disappeared from disk are dropped at the end, then the index is persisted.

use crate::index::{GameImageIndex, GameImages};
use crate::layout::ImageLayout;
use crate::probe::{ImageProber, ProbeError, ProbeOutcome};
use crate::{LibraryError, is_supported_image};
use chrono::Utc;
use crossbeam_channel::{self as channel, Receiver, Sender};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Probe workers used when none are configured
pub const DEFAULT_WORKERS: usize = 8;

/// Result of a scan
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Games holding at least one indexed image after the scan
    pub games_found: usize,
    pub images_indexed: usize,
    /// Files ignored because of their extension
    pub files_skipped: usize,
    pub games_removed: Vec<String>,
    /// Per-file and per-directory failures; none of them stop the scan
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Files to probe in one game directory
#[derive(Debug)]
struct GamePlan {
    game_id: String,
    /// `None` when the directory could not be listed
    files: Option<Vec<String>>,
}

#[derive(Debug)]
struct ProbeJob {
    game_id: String,
    filename: String,
}

#[derive(Debug)]
struct ProbeResult {
    job: ProbeJob,
    outcome: Result<ProbeOutcome, ProbeError>,
}

/// Images collected so far for a game still being probed
#[derive(Debug, Default)]
struct PendingGame {
    remaining: usize,
    images: GameImages,
}

/// Reconciles the index with the image root
#[derive(Debug, Clone)]
pub struct Scanner {
    index: Arc<GameImageIndex>,
    prober: Arc<ImageProber>,
    workers: usize,
    cache_file: Option<PathBuf>,
}

impl Scanner {
    /// Scanner over `index.root()`, without a cache file
    pub fn new(index: Arc<GameImageIndex>, prober: Arc<ImageProber>) -> Self {
        Self {
            index,
            prober,
            workers: DEFAULT_WORKERS,
            cache_file: None,
        }
    }

    /// Number of probe worker threads (at least one)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Persist the index to `path` after every scan
    pub fn with_cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_file = Some(path.into());
        self
    }

    pub fn index(&self) -> &Arc<GameImageIndex> {
        &self.index
    }

    /// Build a fresh index of `root` in one pass, without persisting it
    pub fn full_scan(
        root: impl Into<PathBuf>,
        layout: ImageLayout,
        workers: usize,
    ) -> Result<Arc<GameImageIndex>, LibraryError> {
        let index = Arc::new(GameImageIndex::new(root));
        let scanner = Scanner::new(Arc::clone(&index), Arc::new(ImageProber::new(layout)))
            .with_workers(workers);
        scanner.scan()?;
        Ok(index)
    }

    /// Run one full pass over the image root.
    ///
    /// Only an unreadable root or a failed persist is returned as an error;
    /// problems with single directories or files are logged and collected in
    /// the report.
    pub fn scan(&self) -> Result<ScanReport, LibraryError> {
        let start = Instant::now();
        let root = self.index.root().to_path_buf();
        let mut report = ScanReport::default();

        tracing::info!("Scanning {}", root.display());
        // Only games known before listing can have vanished; anything added
        // by an upload while the scan runs is left alone.
        let known = self.index.get_games();
        let plans = self.plan(&root, &mut report)?;

        let mut keep = HashSet::new();
        let mut pending = HashMap::new();
        let mut jobs = Vec::new();
        for plan in plans {
            match plan.files {
                // Leave whatever we had for a directory we could not read
                None => {
                    keep.insert(plan.game_id);
                }
                Some(files) if files.is_empty() => {}
                Some(files) => {
                    pending.insert(
                        plan.game_id.clone(),
                        PendingGame {
                            remaining: files.len(),
                            images: GameImages::new(),
                        },
                    );
                    jobs.extend(files.into_iter().map(|filename| ProbeJob {
                        game_id: plan.game_id.clone(),
                        filename,
                    }));
                    keep.insert(plan.game_id);
                }
            }
        }

        self.probe_all(&root, jobs, pending, &mut report);

        let vanished: Vec<String> = known
            .into_iter()
            .filter(|game_id| !keep.contains(game_id))
            .collect();
        report.games_removed = self.index.remove_games(&vanished);
        for game_id in &report.games_removed {
            tracing::info!("Game {} has no images on disk, removed", game_id);
        }
        report.games_found = self.index.length();
        self.index.mark_scanned(Utc::now());

        report.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "Scan finished in {}ms: {} games, {} images, {} removed, {} errors",
            report.duration_ms,
            report.games_found,
            report.images_indexed,
            report.games_removed.len(),
            report.errors.len()
        );

        if let Some(path) = &self.cache_file {
            self.index.persist(path)?;
        }

        Ok(report)
    }

    /// List game directories and the candidate files inside each
    fn plan(&self, root: &Path, report: &mut ScanReport) -> Result<Vec<GamePlan>, LibraryError> {
        let entries = fs::read_dir(root).map_err(|source| LibraryError::RootUnreadable {
            path: root.to_path_buf(),
            source,
        })?;

        let layout = self.prober.layout();
        let mut plans = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("Unable to read entry in {}: {}", root.display(), err);
                    report.errors.push(err.to_string());
                    continue;
                }
            };

            let Some(game_id) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!("Skipping non UTF-8 directory {}", entry.path().display());
                continue;
            };
            if game_id.starts_with('.') || !entry.path().is_dir() {
                continue;
            }

            let dir = layout.image_dir(root, &game_id);
            let files = match list_images(&dir, report) {
                Ok(files) => Some(files),
                // The nested layout simply has no images for this game yet
                Err(err) if err.kind() == io::ErrorKind::NotFound => Some(Vec::new()),
                Err(err) => {
                    tracing::warn!("Unable to read {}: {}", dir.display(), err);
                    report
                        .errors
                        .push(format!("Unable to read {}: {}", dir.display(), err));
                    None
                }
            };
            plans.push(GamePlan { game_id, files });
        }

        Ok(plans)
    }

    /// Fan jobs out to the worker pool and commit each game as it completes
    fn probe_all(
        &self,
        root: &Path,
        jobs: Vec<ProbeJob>,
        mut pending: HashMap<String, PendingGame>,
        report: &mut ScanReport,
    ) {
        if jobs.is_empty() {
            return;
        }

        let workers = self.workers.min(jobs.len());
        let prober: &ImageProber = &self.prober;

        // Jobs are bounded so the feeder waits on slow probes; results are
        // unbounded so workers never wait on the committer.
        let (job_tx, job_rx) = channel::bounded::<ProbeJob>(workers * 2);
        let (result_tx, result_rx) = channel::unbounded::<ProbeResult>();

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || probe_worker(prober, root, job_rx, result_tx));
            }
            // Workers hold the only remaining ends, so both channels close
            // once the pool is done.
            drop(job_rx);
            drop(result_tx);

            scope.spawn(move || {
                for job in jobs {
                    if job_tx.send(job).is_err() {
                        break;
                    }
                }
            });

            for result in result_rx {
                self.commit(result, &mut pending, report);
            }
        });
    }

    /// Fold one probe result into its game, swapping the game into the index
    /// once its last file is in
    fn commit(
        &self,
        result: ProbeResult,
        pending: &mut HashMap<String, PendingGame>,
        report: &mut ScanReport,
    ) {
        let ProbeResult { job, outcome } = result;
        let Some(game) = pending.get_mut(&job.game_id) else {
            return;
        };

        match outcome {
            Ok(ProbeOutcome::Indexed(meta)) => {
                game.images.insert(job.filename, meta);
                report.images_indexed += 1;
            }
            Ok(ProbeOutcome::Unsupported) => report.files_skipped += 1,
            Err(err) => {
                tracing::warn!("Skipping image: {}", err);
                report.errors.push(err.to_string());
            }
        }

        game.remaining -= 1;
        if game.remaining > 0 {
            return;
        }
        if let Some(done) = pending.remove(&job.game_id) {
            tracing::debug!("Game {}: {} images", job.game_id, done.images.len());
            self.index.replace_game(&job.game_id, done.images);
        }
    }
}

fn probe_worker(
    prober: &ImageProber,
    root: &Path,
    jobs: Receiver<ProbeJob>,
    results: Sender<ProbeResult>,
) {
    for job in jobs {
        let outcome = prober.probe(root, &job.game_id, &job.filename);
        if results.send(ProbeResult { job, outcome }).is_err() {
            break;
        }
    }
}

/// Supported image files directly inside `dir`
fn list_images(dir: &Path, report: &mut ScanReport) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("Unable to read entry in {}: {}", dir.display(), err);
                report.errors.push(err.to_string());
                continue;
            }
        };

        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            tracing::warn!("Skipping non UTF-8 file {}", path.display());
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if !is_supported_image(&name) {
            report.files_skipped += 1;
            continue;
        }
        files.push(name);
    }
    Ok(files)
}
