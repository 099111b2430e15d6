//! Reading image dimensions and making sure thumbnails exist

use crate::is_supported_image;
use crate::layout::ImageLayout;
use crate::thumbnail::{ResizeThumbnailer, ThumbnailError, Thumbnailer, write_thumbnail};
use chrono::{DateTime, Utc};
use image::ImageReader;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Cached metadata for one image. Replaced wholesale on rescan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageMeta {
    pub width: u32,
    pub height: u32,
    pub mod_time: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Unable to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("Unable to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("Image {path} has empty dimensions {width}x{height}")]
    EmptyImage {
        path: PathBuf,
        width: u32,
        height: u32,
    },

    #[error("Unable to stat {path}: {source}")]
    Stat { path: PathBuf, source: io::Error },
}

/// Result of probing one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The file is an image; here is its metadata
    Indexed(ImageMeta),
    /// The extension is not one we index
    Unsupported,
}

/// Opens screenshots, reads their size from the header, and creates missing
/// thumbnails.
///
/// Shared between scan workers and the upload worker, so it holds no mutable
/// state of its own.
pub struct ImageProber {
    layout: ImageLayout,
    thumbnailer: Box<dyn Thumbnailer>,
}

impl fmt::Debug for ImageProber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageProber")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl Default for ImageProber {
    fn default() -> Self {
        Self::new(ImageLayout::default())
    }
}

impl ImageProber {
    /// Prober using the default fixed-width thumbnailer
    pub fn new(layout: ImageLayout) -> Self {
        Self::with_thumbnailer(layout, ResizeThumbnailer::default())
    }

    /// Prober with a custom thumbnail generator
    pub fn with_thumbnailer(layout: ImageLayout, thumbnailer: impl Thumbnailer + 'static) -> Self {
        Self {
            layout,
            thumbnailer: Box::new(thumbnailer),
        }
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    /// Probe `<root>/<game>/<filename>` (per the layout).
    ///
    /// Only the image header is decoded for the dimensions. If the thumbnail
    /// is missing the full image is decoded once more to build it; a
    /// thumbnail failure is logged and does not fail the probe.
    pub fn probe(
        &self,
        root: &Path,
        game_id: &str,
        filename: &str,
    ) -> Result<ProbeOutcome, ProbeError> {
        if !is_supported_image(filename) {
            return Ok(ProbeOutcome::Unsupported);
        }

        let path = self.layout.image_path(root, game_id, filename);
        let (width, height) = read_dimensions(&path)?;

        let mod_time = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .map_err(|source| ProbeError::Stat {
                path: path.clone(),
                source,
            })?;

        let thumbnail = self.layout.thumbnail_path(root, game_id, filename);
        match self.ensure_thumbnail(&path, &thumbnail) {
            Ok(true) => tracing::debug!("Created thumbnail {}", thumbnail.display()),
            Ok(false) => {}
            Err(err) => tracing::warn!("{}", err),
        }

        Ok(ProbeOutcome::Indexed(ImageMeta {
            width,
            height,
            mod_time: DateTime::<Utc>::from(mod_time),
        }))
    }

    /// Build the thumbnail for `original` unless `thumbnail` already exists.
    ///
    /// Returns whether a new thumbnail was written. An existing thumbnail is
    /// never inspected or replaced.
    pub fn ensure_thumbnail(
        &self,
        original: &Path,
        thumbnail: &Path,
    ) -> Result<bool, ThumbnailError> {
        if thumbnail.exists() {
            return Ok(false);
        }

        let decode_error = |source: image::ImageError| ThumbnailError::Decode {
            path: original.to_path_buf(),
            source,
        };
        let image = ImageReader::open(original)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|err| decode_error(image::ImageError::IoError(err)))?
            .decode()
            .map_err(decode_error)?;

        let small = self.thumbnailer.generate(&image)?;
        write_thumbnail(thumbnail, &small)
    }
}

/// Read width and height without decoding pixel data
fn read_dimensions(path: &Path) -> Result<(u32, u32), ProbeError> {
    let reader = ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|source| ProbeError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    let (width, height) = reader.into_dimensions().map_err(|source| ProbeError::Decode {
        path: path.to_path_buf(),
        source,
    })?;

    if width == 0 || height == 0 {
        return Err(ProbeError::EmptyImage {
            path: path.to_path_buf(),
            width,
            height,
        });
    }

    Ok((width, height))
}
