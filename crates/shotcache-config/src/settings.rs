//! Server settings

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where a game's screenshots live relative to its directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// `<root>/<game>/<file>`
    #[default]
    Flat,
    /// `<root>/<game>/screenshots/<file>`
    Screenshots,
}

/// Settings for the screenshot index server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotcacheConfig {
    /// Root directory holding one subdirectory per game
    #[serde(default = "default_image_directory")]
    pub image_directory: PathBuf,

    /// Durable index file
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,

    /// Minutes to wait after a scan finishes before starting the next one
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_minutes: u64,

    /// Directory layout under each game
    #[serde(default)]
    pub layout: Layout,

    /// Number of probe workers used during a scan
    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,

    /// Pending upload notifications before producers wait
    #[serde(default = "default_ingest_capacity")]
    pub ingest_queue_capacity: usize,

    /// Thumbnail width in pixels
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
}

fn default_image_directory() -> PathBuf {
    PathBuf::from("/srv/screenshots")
}

fn default_cache_file() -> PathBuf {
    PathBuf::from("image.cache")
}

fn default_refresh_interval() -> u64 {
    2
}

fn default_scan_workers() -> usize {
    8
}

fn default_ingest_capacity() -> usize {
    64
}

fn default_thumbnail_width() -> u32 {
    200
}

impl Default for ShotcacheConfig {
    fn default() -> Self {
        Self {
            image_directory: default_image_directory(),
            cache_file: default_cache_file(),
            refresh_interval_minutes: default_refresh_interval(),
            layout: Layout::default(),
            scan_workers: default_scan_workers(),
            ingest_queue_capacity: default_ingest_capacity(),
            thumbnail_width: default_thumbnail_width(),
        }
    }
}

impl ShotcacheConfig {
    /// Clamp counters and intervals to their minimum of one
    pub fn normalized(mut self) -> Self {
        self.refresh_interval_minutes = self.refresh_interval_minutes.max(1);
        self.scan_workers = self.scan_workers.max(1);
        self.ingest_queue_capacity = self.ingest_queue_capacity.max(1);
        self.thumbnail_width = self.thumbnail_width.max(1);
        self
    }

    /// Pause between the end of one scan and the start of the next
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_minutes.max(1) * 60)
    }
}
