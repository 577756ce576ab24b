//! Persisted user preferences: `~/.wormpipe/config.json`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CONFIG_DIR_NAME: &str = ".wormpipe";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub download_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: home_dir(),
        }
    }
}

/// Loads the config, falling back to defaults when no file exists yet.
pub fn load() -> Result<Config> {
    load_from(&config_path())
}

pub fn save(config: &Config) -> Result<()> {
    save_to(&config_path(), config)
}

fn load_from(path: &Path) -> Result<Config> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed config {}: {e}", path.display()),
            ))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(e.into()),
    }
}

fn save_to(path: &Path, config: &Config) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let bytes = serde_json::to_vec_pretty(config).map_err(|e| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("failed to encode config: {e}"),
        ))
    })?;
    fs::write(path, bytes)?;
    Ok(())
}

fn config_path() -> PathBuf {
    home_dir().join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME)
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("wormpipe_cfg_{tag}_{}", std::process::id()))
            .join("config.json")
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = scratch_path("missing");
        let config = load_from(&path).expect("Missing config should fall back to defaults");
        assert_eq!(config.download_dir, home_dir());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let path = scratch_path("roundtrip");
        let config = Config {
            download_dir: PathBuf::from("/tmp/downloads"),
        };

        save_to(&path, &config).expect("Save should succeed");
        let loaded = load_from(&path).expect("Load should succeed");
        assert_eq!(loaded.download_dir, config.download_dir);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let path = scratch_path("malformed");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ not json").unwrap();

        assert!(load_from(&path).is_err());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_wire_shape_uses_snake_case_field() {
        let config: Config = serde_json::from_str(r#"{"download_dir":"/data"}"#).unwrap();
        assert_eq!(config.download_dir, PathBuf::from("/data"));
    }
}
