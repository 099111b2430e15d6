//! Mapping from a game id to the directories holding its images

use shotcache_config::Layout;
use std::path::{Path, PathBuf};

/// Name of the thumbnail directory inside a game's image directory
pub const THUMBNAIL_DIR: &str = "thumbnails";

/// Subdirectory used by the nested layout
pub const SCREENSHOTS_DIR: &str = "screenshots";

/// How screenshots are arranged below the image root.
///
/// Chosen once at startup; every component resolves paths through the same
/// value so scans, uploads and thumbnail lookups agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageLayout {
    /// Images sit directly in `<root>/<game>/`
    #[default]
    Flat,
    /// Images sit in `<root>/<game>/screenshots/`
    Screenshots,
}

impl ImageLayout {
    /// Directory enumerated for a game's images
    pub fn image_dir(&self, root: &Path, game_id: &str) -> PathBuf {
        match self {
            ImageLayout::Flat => root.join(game_id),
            ImageLayout::Screenshots => root.join(game_id).join(SCREENSHOTS_DIR),
        }
    }

    /// Full path of an original image
    pub fn image_path(&self, root: &Path, game_id: &str, filename: &str) -> PathBuf {
        self.image_dir(root, game_id).join(filename)
    }

    /// Directory holding a game's thumbnails
    pub fn thumbnail_dir(&self, root: &Path, game_id: &str) -> PathBuf {
        self.image_dir(root, game_id).join(THUMBNAIL_DIR)
    }

    /// Thumbnail path for an original, keyed by the same file name
    pub fn thumbnail_path(&self, root: &Path, game_id: &str, filename: &str) -> PathBuf {
        self.thumbnail_dir(root, game_id).join(filename)
    }
}

impl From<Layout> for ImageLayout {
    fn from(layout: Layout) -> Self {
        match layout {
            Layout::Flat => ImageLayout::Flat,
            Layout::Screenshots => ImageLayout::Screenshots,
        }
    }
}
