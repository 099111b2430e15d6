//! Screenshot index for shotcache
//!
//! Discovers screenshots under a root directory laid out as one directory per
//! game, reads their dimensions, generates thumbnails, and keeps a persistent
//! index that HTTP handlers can query while scans and uploads update it.
//!
//! # Layout
//!
//! - `<root>/<game>/<file>`: originals (or `<root>/<game>/screenshots/<file>`)
//! - `<root>/<game>/thumbnails/<file>`: JPEG thumbnails, created once
//! - the index file itself lives outside the root (see `shotcache-config`)

mod index;
mod ingest;
mod layout;
mod probe;
mod scanner;
mod thumbnail;

pub use index::{GameImageIndex, GameImages, ImageMetadata};
pub use ingest::{IngestError, IngestQueue, IngestSender, IngestWorker, NewImage};
pub use layout::ImageLayout;
pub use probe::{ImageMeta, ImageProber, ProbeError, ProbeOutcome};
pub use scanner::{DEFAULT_WORKERS, ScanReport, Scanner};
pub use thumbnail::{
    DEFAULT_THUMBNAIL_WIDTH, ResizeThumbnailer, ThumbnailError, Thumbnailer, write_thumbnail,
};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extensions the prober will open, compared case-insensitively
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Unable to read image root {path}: {source}")]
    RootUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unable to read image cache {path}: {source}")]
    CacheRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt image cache {path}: {source}")]
    CacheCorrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid image cache data: {0}")]
    InvalidCache(#[source] serde_json::Error),

    #[error("Unable to serialize image cache: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Unable to write image cache {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Whether a file name carries one of the supported image extensions
pub fn is_supported_image(filename: impl AsRef<Path>) -> bool {
    filename
        .as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
}
