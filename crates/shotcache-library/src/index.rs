//! In-memory screenshot index with lazy persistence
//!
//! One `RwLock` guards every game's mapping. Filesystem work (probing,
//! writing the cache file) always happens outside the lock; callers build
//! their results first and merge them under a short write lock.

use crate::LibraryError;
use crate::probe::ImageMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// File name to metadata for one game
pub type GameImages = BTreeMap<String, ImageMeta>;

/// Public view of one image, as handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageMetadata {
    /// Full-size image URL path
    pub src: String,
    /// Thumbnail URL path
    pub thumb: String,
    pub width: u32,
    pub height: u32,
}

impl ImageMetadata {
    fn new(game_id: &str, filename: &str, meta: &ImageMeta) -> Self {
        Self {
            src: format!("/img/{}/{}", game_id, filename),
            thumb: format!("/thumb/{}/{}", game_id, filename),
            width: meta.width,
            height: meta.height,
        }
    }
}

/// On-disk shape of the cache file
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CacheFile {
    #[serde(default)]
    games: BTreeMap<String, GameImages>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
}

/// Borrowed form of [`CacheFile`] so persisting does not clone the index
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CacheFileRef<'a> {
    games: &'a BTreeMap<String, GameImages>,
    updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct IndexState {
    games: BTreeMap<String, GameImages>,
    updated: Option<DateTime<Utc>>,
    dirty: bool,
    /// Bumped on every mutation so a persist can tell whether it raced one
    generation: u64,
}

impl IndexState {
    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Game id to screenshot metadata, shared by scanner, upload worker and
/// request handlers.
#[derive(Debug)]
pub struct GameImageIndex {
    root: PathBuf,
    state: RwLock<IndexState>,
    /// Serializes writers of the cache file
    persist_lock: Mutex<()>,
}

impl GameImageIndex {
    /// Empty index bound to `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from_state(root.into(), IndexState::default())
    }

    fn from_state(root: PathBuf, state: IndexState) -> Self {
        Self {
            root,
            state: RwLock::new(state),
            persist_lock: Mutex::new(()),
        }
    }

    /// Load a persisted index, or start empty when no cache file exists yet
    pub fn load(path: &Path, root: impl Into<PathBuf>) -> Result<Self, LibraryError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::info!("No image cache at {}, starting empty", path.display());
                return Ok(Self::new(root));
            }
            Err(source) => {
                return Err(LibraryError::CacheRead {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let cache: CacheFile =
            serde_json::from_slice(&raw).map_err(|source| LibraryError::CacheCorrupt {
                path: path.to_path_buf(),
                source,
            })?;
        let index = Self::from_cache(root.into(), cache);
        tracing::info!(
            "Loaded image cache {} with {} games",
            path.display(),
            index.length()
        );
        Ok(index)
    }

    /// Parse a cache blob, e.g. one fetched from another server
    pub fn from_json(raw: &[u8], root: impl Into<PathBuf>) -> Result<Self, LibraryError> {
        let cache: CacheFile = serde_json::from_slice(raw).map_err(LibraryError::InvalidCache)?;
        Ok(Self::from_cache(root.into(), cache))
    }

    fn from_cache(root: PathBuf, cache: CacheFile) -> Self {
        Self::from_state(
            root,
            IndexState {
                games: cache.games,
                updated: cache.updated,
                ..Default::default()
            },
        )
    }

    /// Base directory all entries are relative to
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace one image's metadata
    pub fn add_or_update(&self, game_id: &str, filename: &str, meta: ImageMeta) {
        let mut state = self.write();
        let previous = state
            .games
            .entry(game_id.to_string())
            .or_default()
            .insert(filename.to_string(), meta);
        if previous != Some(meta) {
            state.mark_dirty();
        }
    }

    /// Swap in a freshly scanned mapping for one game.
    ///
    /// Readers see either the old or the new mapping, never a mix. An empty
    /// mapping removes the game.
    pub fn replace_game(&self, game_id: &str, images: GameImages) {
        let mut state = self.write();
        if images.is_empty() {
            if state.games.remove(game_id).is_some() {
                state.mark_dirty();
            }
            return;
        }
        if state.games.get(game_id) != Some(&images) {
            state.games.insert(game_id.to_string(), images);
            state.mark_dirty();
        }
    }

    /// Drop every entry of a game. Returns whether it was present.
    pub fn remove_game(&self, game_id: &str) -> bool {
        let mut state = self.write();
        let removed = state.games.remove(game_id).is_some();
        if removed {
            state.mark_dirty();
        }
        removed
    }

    /// Drop several games under one write lock, returning the ids that were
    /// actually present
    pub fn remove_games(&self, game_ids: &[String]) -> Vec<String> {
        let mut state = self.write();
        let mut removed = Vec::new();
        for game_id in game_ids {
            if state.games.remove(game_id).is_some() {
                removed.push(game_id.clone());
            }
        }
        if !removed.is_empty() {
            state.mark_dirty();
        }
        removed
    }

    /// Record completion of a scan.
    ///
    /// The timestamp is written with the next persist but does not by itself
    /// make the index dirty.
    pub fn mark_scanned(&self, at: DateTime<Utc>) {
        self.write().updated = Some(at);
    }

    /// Time of the last completed scan
    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.read().updated
    }

    /// Whether there are changes not yet written to disk
    pub fn is_dirty(&self) -> bool {
        self.read().dirty
    }

    /// Images of a game sorted by source path, or `None` for an unknown game
    pub fn get_metadata(&self, game_id: &str) -> Option<Vec<ImageMetadata>> {
        let state = self.read();
        let images = state.games.get(game_id)?;
        let mut metadata: Vec<ImageMetadata> = images
            .iter()
            .map(|(filename, meta)| ImageMetadata::new(game_id, filename, meta))
            .collect();
        drop(state);

        metadata.sort_by(|a, b| a.src.cmp(&b.src));
        Some(metadata)
    }

    /// Copy of one game's raw mapping
    pub fn game_images(&self, game_id: &str) -> Option<GameImages> {
        self.read().games.get(game_id).cloned()
    }

    /// All known game ids, sorted
    pub fn get_games(&self) -> Vec<String> {
        self.read().games.keys().cloned().collect()
    }

    /// Number of images for a game, zero when unknown
    pub fn count(&self, game_id: &str) -> usize {
        self.read().games.get(game_id).map_or(0, BTreeMap::len)
    }

    /// Number of games
    pub fn length(&self) -> usize {
        self.read().games.len()
    }

    /// The `Games` map alone, serialized as JSON
    pub fn games_json(&self) -> Result<String, LibraryError> {
        let state = self.read();
        serde_json::to_string(&state.games).map_err(LibraryError::Serialize)
    }

    /// Write the index to `path` if it changed since the last write.
    ///
    /// Returns whether a file was written. The data is written to a sibling
    /// temp file and renamed into place. A mutation that lands during the
    /// write keeps the index dirty.
    pub fn persist(&self, path: &Path) -> Result<bool, LibraryError> {
        let _writer = self
            .persist_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let (bytes, generation) = {
            let state = self.read();
            if !state.dirty {
                return Ok(false);
            }
            let cache = CacheFileRef {
                games: &state.games,
                updated: state.updated,
            };
            let bytes = serde_json::to_vec_pretty(&cache).map_err(LibraryError::Serialize)?;
            (bytes, state.generation)
        };

        write_atomically(path, &bytes).map_err(|source| LibraryError::Persist {
            path: path.to_path_buf(),
            source,
        })?;

        let mut state = self.write();
        if state.generation == generation {
            state.dirty = false;
        }
        drop(state);

        tracing::debug!("Image cache written to {}", path.display());
        Ok(true)
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn meta(width: u32, height: u32) -> ImageMeta {
        ImageMeta {
            width,
            height,
            mod_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_new_index_is_clean() {
        let index = GameImageIndex::new("/srv/shots");
        assert!(!index.is_dirty());
        assert_eq!(index.length(), 0);
        assert_eq!(index.root(), Path::new("/srv/shots"));
        assert!(index.updated().is_none());
    }

    #[test]
    fn test_add_or_update_marks_dirty() {
        let index = GameImageIndex::new("/srv/shots");
        index.add_or_update("100", "a.jpg", meta(300, 200));

        assert!(index.is_dirty());
        assert_eq!(index.count("100"), 1);
        assert_eq!(index.length(), 1);
    }

    #[test]
    fn test_unknown_game_is_none_not_empty() {
        let index = GameImageIndex::new("/srv/shots");
        assert!(index.get_metadata("404").is_none());
        assert_eq!(index.count("404"), 0);
    }

    #[test]
    fn test_get_metadata_sorted_by_src() {
        let index = GameImageIndex::new("/srv/shots");
        index.add_or_update("100", "b.png", meta(50, 50));
        index.add_or_update("100", "a.jpg", meta(300, 200));

        let metadata = index.get_metadata("100").unwrap();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata[0].src, "/img/100/a.jpg");
        assert_eq!(metadata[0].thumb, "/thumb/100/a.jpg");
        assert_eq!((metadata[0].width, metadata[0].height), (300, 200));
        assert_eq!(metadata[1].src, "/img/100/b.png");
        assert_eq!((metadata[1].width, metadata[1].height), (50, 50));
    }

    #[test]
    fn test_replace_game_is_wholesale() {
        let index = GameImageIndex::new("/srv/shots");
        index.add_or_update("100", "old.jpg", meta(1, 1));

        let mut fresh = GameImages::new();
        fresh.insert("new.jpg".to_string(), meta(2, 2));
        index.replace_game("100", fresh);

        let images = index.game_images("100").unwrap();
        assert!(images.contains_key("new.jpg"));
        assert!(!images.contains_key("old.jpg"));
    }

    #[test]
    fn test_replace_with_same_content_stays_clean() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("image.cache");
        let index = GameImageIndex::new(dir.path());
        index.add_or_update("100", "a.jpg", meta(3, 3));
        index.persist(&cache).unwrap();

        index.replace_game("100", index.game_images("100").unwrap());
        assert!(!index.is_dirty());
    }

    #[test]
    fn test_replace_with_empty_removes_game() {
        let index = GameImageIndex::new("/srv/shots");
        index.add_or_update("100", "a.jpg", meta(3, 3));
        index.replace_game("100", GameImages::new());
        assert!(index.get_games().is_empty());
    }

    #[test]
    fn test_remove_games() {
        let index = GameImageIndex::new("/srv/shots");
        index.add_or_update("1", "a.jpg", meta(1, 1));
        index.add_or_update("2", "a.jpg", meta(1, 1));
        index.add_or_update("3", "a.jpg", meta(1, 1));

        assert!(index.remove_game("1"));
        assert!(!index.remove_game("1"));

        let removed = index.remove_games(&["2".to_string(), "404".to_string()]);
        assert_eq!(removed, vec!["2".to_string()]);
        assert_eq!(index.get_games(), vec!["3".to_string()]);
    }

    #[test]
    fn test_persist_is_noop_when_clean() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("image.cache");
        let index = GameImageIndex::new(dir.path());

        assert!(!index.persist(&cache).unwrap());
        assert!(!cache.exists());

        index.add_or_update("100", "a.jpg", meta(3, 3));
        assert!(index.persist(&cache).unwrap());
        assert!(!index.is_dirty());
        assert!(!index.persist(&cache).unwrap());
    }

    #[test]
    fn test_persist_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("state").join("image.cache");
        let index = GameImageIndex::new(dir.path());
        index.add_or_update("100", "a.jpg", meta(300, 200));
        index.add_or_update("100", "b.png", meta(50, 50));
        index.add_or_update("200", "c.jpeg", meta(1920, 1080));
        index.mark_scanned(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        index.persist(&cache).unwrap();

        let loaded = GameImageIndex::load(&cache, dir.path()).unwrap();
        assert!(!loaded.is_dirty());
        assert_eq!(loaded.get_games(), index.get_games());
        for game in index.get_games() {
            assert_eq!(loaded.game_images(&game), index.game_images(&game));
        }
        assert_eq!(loaded.updated(), index.updated());
    }

    #[test]
    fn test_cache_file_field_names() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("image.cache");
        let index = GameImageIndex::new(dir.path());
        index.add_or_update("100", "a.jpg", meta(300, 200));
        index.persist(&cache).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&fs::read(&cache).unwrap()).unwrap();
        let entry = &value["Games"]["100"]["a.jpg"];
        assert_eq!(entry["Width"], 300);
        assert_eq!(entry["Height"], 200);
        assert!(entry["ModTime"].is_string());
        assert!(value.get("Updated").is_some());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let index = GameImageIndex::load(&dir.path().join("missing.cache"), dir.path()).unwrap();
        assert_eq!(index.length(), 0);
        assert_eq!(index.root(), dir.path());
    }

    #[test]
    fn test_load_corrupt_file_fails() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("image.cache");
        fs::write(&cache, b"{ not json").unwrap();

        let err = GameImageIndex::load(&cache, dir.path()).unwrap_err();
        assert!(matches!(err, LibraryError::CacheCorrupt { .. }));
    }

    #[test]
    fn test_games_json_and_from_json() {
        let index = GameImageIndex::new("/srv/shots");
        index.add_or_update("100", "a.jpg", meta(300, 200));

        let games = index.games_json().unwrap();
        let wrapped = format!("{{\"Games\":{}}}", games);
        let parsed = GameImageIndex::from_json(wrapped.as_bytes(), "/other").unwrap();

        assert_eq!(parsed.game_images("100"), index.game_images("100"));
        assert!(parsed.updated().is_none());
        assert!(GameImageIndex::from_json(b"\"nope\"", "/other").is_err());
    }
}
