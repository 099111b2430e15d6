//! Settings management for shotcache
//!
//! Loads the screenshot server settings from a TOML file, with `SHOTCACHE_*`
//! environment variables layered on top.

mod settings;

pub use settings::{Layout, ShotcacheConfig};

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Failed to layer configuration sources: {0}")]
    Layered(#[from] config::ConfigError),
}

/// Standard configuration paths
pub const CONFIG_DIR: &str = "/etc/shotcache";
pub const USER_CONFIG_DIR: &str = ".shotcache";

/// Prefix for environment overrides, e.g. `SHOTCACHE_IMAGE_DIRECTORY`
pub const ENV_PREFIX: &str = "SHOTCACHE";

/// `~/.shotcache/config.toml`, relative to the working directory when
/// `HOME` is unset
pub fn user_config_path() -> PathBuf {
    user_config_path_in(std::env::var_os("HOME").map(PathBuf::from).as_deref())
}

fn user_config_path_in(home: Option<&Path>) -> PathBuf {
    let dir = match home {
        Some(home) => home.join(USER_CONFIG_DIR),
        None => PathBuf::from(USER_CONFIG_DIR),
    };
    dir.join("config.toml")
}

impl ShotcacheConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config.normalized())
    }

    /// Load a file (if present) with `SHOTCACHE_*` environment variables
    /// applied on top
    pub fn load_layered(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_env(path, config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Layer `env` over the file at `path`
    fn load_with_env(path: &Path, env: config::Environment) -> Result<Self, ConfigError> {
        let layered = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(env.try_parsing(true))
            .build()?;

        let config: Self = layered.try_deserialize()?;
        Ok(config.normalized())
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<Self, ConfigError> {
        // Try user config first, then system config
        let user_config = user_config_path();
        if user_config.exists() {
            return Self::load_layered(&user_config);
        }

        let system_config = Path::new(CONFIG_DIR).join("config.toml");
        if system_config.exists() {
            return Self::load_layered(&system_config);
        }

        tracing::warn!("No configuration file found, using defaults");
        Self::load_layered(&user_config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        tracing::info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("image_directory is empty".to_string()));
        }
        if self.cache_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache_file is empty".to_string()));
        }
        if self.cache_file.starts_with(&self.image_directory) {
            return Err(ConfigError::Invalid(format!(
                "cache_file {} must live outside image_directory {}",
                self.cache_file.display(),
                self.image_directory.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_content = r#"
image_directory = "/data/remote"
refresh_interval_minutes = 5
layout = "screenshots"
"#;
        write!(temp_file, "{}", config_content).unwrap();

        let config = ShotcacheConfig::load(temp_file.path()).unwrap();
        assert_eq!(config.image_directory, PathBuf::from("/data/remote"));
        assert_eq!(config.refresh_interval_minutes, 5);
        assert_eq!(config.layout, Layout::Screenshots);
        // Unset fields fall back to defaults
        assert_eq!(config.scan_workers, 8);
        assert_eq!(config.cache_file, PathBuf::from("image.cache"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = ShotcacheConfig::load(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_layered_without_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ShotcacheConfig::load_layered(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.thumbnail_width, 200);
        assert_eq!(config.layout, Layout::Flat);
    }

    #[test]
    fn test_load_layered_reads_file() {
        let mut temp_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(temp_file, "scan_workers = 3\nthumbnail_width = 120\n").unwrap();

        let config = ShotcacheConfig::load_layered(temp_file.path()).unwrap();
        assert_eq!(config.scan_workers, 3);
        assert_eq!(config.thumbnail_width, 120);
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut temp_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            temp_file,
            "image_directory = \"/data/file\"\nscan_workers = 2\nthumbnail_width = 120\n"
        )
        .unwrap();

        let mut vars = config::Map::new();
        vars.insert(
            "SHOTCACHE_IMAGE_DIRECTORY".to_string(),
            "/data/env".to_string(),
        );
        vars.insert("SHOTCACHE_SCAN_WORKERS".to_string(), "6".to_string());
        vars.insert("OTHER_SCAN_WORKERS".to_string(), "99".to_string());
        let env = config::Environment::with_prefix(ENV_PREFIX).source(Some(vars));

        let config = ShotcacheConfig::load_with_env(temp_file.path(), env).unwrap();
        assert_eq!(config.image_directory, PathBuf::from("/data/env"));
        assert_eq!(config.scan_workers, 6);
        // Values without an override come from the file
        assert_eq!(config.thumbnail_width, 120);
    }

    #[test]
    fn test_user_config_path_uses_home() {
        assert_eq!(
            user_config_path_in(Some(Path::new("/home/shots"))),
            PathBuf::from("/home/shots/.shotcache/config.toml")
        );
        assert_eq!(
            user_config_path_in(None),
            PathBuf::from(".shotcache/config.toml")
        );
    }

    #[test]
    fn test_save_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = ShotcacheConfig {
            refresh_interval_minutes: 10,
            ..Default::default()
        };

        config.save(&path).unwrap();

        let loaded = ShotcacheConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects_cache_inside_images() {
        let config = ShotcacheConfig {
            image_directory: PathBuf::from("/srv/shots"),
            cache_file: PathBuf::from("/srv/shots/image.cache"),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(ShotcacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::NotFound(PathBuf::from("/etc/shotcache/config.toml"));
        assert!(format!("{}", err).contains("not found"));

        let err = ConfigError::Invalid("bad".to_string());
        assert!(format!("{}", err).contains("Invalid"));
    }
}
