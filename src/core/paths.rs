// src/core/paths.rs

use crate::constants::{COOKIE_JAR_FILENAME, ENGINE_CONFIG_FILENAME};
use anyhow::{Result, anyhow};
use lazy_static::lazy_static;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

lazy_static! {
    static ref CONFIG_DIR: Mutex<Option<PathBuf>> = Mutex::new(None);
}

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not find system config directory.")]
    ConfigDirNotFound,
    #[error("Could not create config directory at '{path}': {source}")]
    ConfigDirCreation {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Returns the queueable configuration directory (`~/.config/queueable`), creating it if needed.
///
/// Memoized: only the first call touches the filesystem.
pub fn get_config_dir() -> Result<PathBuf, PathError> {
    let mut cached = CONFIG_DIR.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(path) = &*cached {
        return Ok(path.clone());
    }

    let config_path = dirs::config_dir()
        .ok_or(PathError::ConfigDirNotFound)?
        .join("queueable");
    if !config_path.exists() {
        fs::create_dir_all(&config_path).map_err(|e| PathError::ConfigDirCreation {
            path: config_path.display().to_string(),
            source: e,
        })?;
    }

    *cached = Some(config_path.clone());
    Ok(config_path)
}

/// Default location of `queueable.toml`.
pub fn get_engine_config_path() -> Result<PathBuf, PathError> {
    get_config_dir().map(|dir| dir.join(ENGINE_CONFIG_FILENAME))
}

/// Default location of the persisted cookie jar.
pub fn get_cookie_jar_path() -> Result<PathBuf, PathError> {
    get_config_dir().map(|dir| dir.join(COOKIE_JAR_FILENAME))
}

/// Expands `~` and environment variables in a user-supplied path.
pub fn expand_path(template: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(template)
        .map_err(|e| anyhow!("Failed to expand path '{}': {}", template, e))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// Resolves `reference` against `base_dir` unless it is already absolute.
pub fn resolve_relative(base_dir: &Path, reference: &str) -> Result<PathBuf> {
    let expanded = expand_path(reference)?;
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(base_dir.join(expanded))
    }
}
