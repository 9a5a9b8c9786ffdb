use crate::error::Result;

use anyhow::anyhow;
use directories::ProjectDirs;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Overrides the model cache location.
pub const CACHE_DIR_ENV: &str = "STEM_PIPELINE_CACHE_DIR";

const MAX_JOB_DIR: usize = 64;

pub fn models_cache_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(CACHE_DIR_ENV) {
        return Ok(PathBuf::from(dir).join("models"));
    }
    let dirs = ProjectDirs::from("", "", "stem-pipeline")
        .ok_or_else(|| anyhow!("could not determine a cache directory"))?;
    Ok(dirs.cache_dir().join("models"))
}

/// Single path component for a job key. Keys made of ASCII letters, digits,
/// `-` and `_` are used as they are; anything else is replaced and a short
/// digest of the original key is appended, so distinct keys never share a
/// directory.
pub fn job_dir_name(key: &str) -> String {
    let clean: String = key
        .chars()
        .take(MAX_JOB_DIR)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !clean.is_empty() && clean == key {
        return clean;
    }
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    let base = if clean.is_empty() { "job" } else { clean.as_str() };
    format!("{}-{}", base, &digest[..8])
}
