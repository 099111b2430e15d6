//! Thumbnail generation

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Thumbnail width used when none is configured
pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 200;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("Unable to decode {path} for thumbnailing: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("Unable to resize image: {0}")]
    Resize(String),

    #[error("Unable to create thumbnail directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Unable to encode thumbnail {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("Unable to write thumbnail {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Produces a thumbnail from a fully decoded image
pub trait Thumbnailer: Send + Sync {
    fn generate(&self, image: &DynamicImage) -> Result<DynamicImage, ThumbnailError>;
}

/// Fixed-width bilinear downscaler that keeps the aspect ratio
#[derive(Debug, Clone, Copy)]
pub struct ResizeThumbnailer {
    width: u32,
}

impl Default for ResizeThumbnailer {
    fn default() -> Self {
        Self::new(DEFAULT_THUMBNAIL_WIDTH)
    }
}

impl ResizeThumbnailer {
    pub fn new(width: u32) -> Self {
        Self {
            width: width.max(1),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height matching `width` for an original of the given size
    pub fn target_height(&self, original_width: u32, original_height: u32) -> u32 {
        if original_width == 0 {
            return 1;
        }
        let height =
            u64::from(self.width) * u64::from(original_height) / u64::from(original_width);
        u32::try_from(height).unwrap_or(u32::MAX).max(1)
    }
}

impl Thumbnailer for ResizeThumbnailer {
    fn generate(&self, image: &DynamicImage) -> Result<DynamicImage, ThumbnailError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ThumbnailError::Resize(format!(
                "source has empty dimensions {}x{}",
                image.width(),
                image.height()
            )));
        }
        let height = self.target_height(image.width(), image.height());
        Ok(image.resize_exact(self.width, height, FilterType::Triangle))
    }
}

/// Write a thumbnail as JPEG unless one already exists at `path`.
///
/// Returns `Ok(false)` when the file was already present. The file is opened
/// with `create_new`, so concurrent writers never clobber each other.
pub fn write_thumbnail(path: &Path, thumbnail: &DynamicImage) -> Result<bool, ThumbnailError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ThumbnailError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(source) => {
            return Err(ThumbnailError::Write {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(thumbnail.to_rgb8());
    let mut writer = BufWriter::new(file);
    let written = rgb
        .write_to(&mut writer, ImageFormat::Jpeg)
        .map_err(|source| ThumbnailError::Encode {
            path: path.to_path_buf(),
            source,
        })
        .and_then(|()| {
            writer.flush().map_err(|source| ThumbnailError::Write {
                path: path.to_path_buf(),
                source,
            })
        });

    if let Err(err) = written {
        drop(writer);
        // A half-written thumbnail would never be regenerated
        if let Err(remove_err) = fs::remove_file(path) {
            tracing::warn!(
                "Unable to remove incomplete thumbnail {}: {}",
                path.display(),
                remove_err
            );
        }
        return Err(err);
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use tempfile::TempDir;

    #[test]
    fn test_target_height_keeps_ratio() {
        let thumbnailer = ResizeThumbnailer::new(200);
        assert_eq!(thumbnailer.target_height(300, 200), 133);
        assert_eq!(thumbnailer.target_height(1920, 1080), 112);
        assert_eq!(thumbnailer.target_height(50, 50), 200);
        // Very wide images still get one row
        assert_eq!(thumbnailer.target_height(10_000, 1), 1);
    }

    #[test]
    fn test_generate_resizes_to_width() {
        let source = DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 300, Rgb([1, 2, 3])));
        let thumb = ResizeThumbnailer::default().generate(&source).unwrap();
        assert_eq!(thumb.width(), 200);
        assert_eq!(thumb.height(), 150);
    }

    #[test]
    fn test_write_thumbnail_creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("440").join("thumbnails").join("a.png");
        let thumb = DynamicImage::ImageRgba8(RgbaImage::from_pixel(20, 10, Rgba([9, 9, 9, 128])));

        assert!(write_thumbnail(&path, &thumb).unwrap());
        assert!(path.exists());

        // Written as JPEG regardless of the original's extension
        let bytes = fs::read(&path).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn test_write_thumbnail_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jpg");
        fs::write(&path, b"existing").unwrap();

        let thumb = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        assert!(!write_thumbnail(&path, &thumb).unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"existing");
    }

    #[test]
    fn test_write_thumbnail_reports_directory_failure() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("thumbnails");
        fs::write(&blocker, b"not a directory").unwrap();

        let thumb = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        let err = write_thumbnail(&blocker.join("a.jpg"), &thumb).unwrap_err();
        assert!(matches!(err, ThumbnailError::CreateDir { .. }));
    }
}
