use crate::{
    error::{Result, StemError},
    io::{
        crypto::verify_sha256,
        net::{download_with_progress, http_client},
        paths::models_cache_dir,
        progress::ProgressSink,
    },
    model::registry::resolve_manifest_url,
    types::ModelManifest,
};

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub manifest: ModelManifest,
    pub local_path: PathBuf,
}

/// Manifest assumed for a user-supplied HTDemucs ONNX export.
pub fn default_htdemucs_manifest() -> ModelManifest {
    ModelManifest {
        name: "htdemucs_custom".to_string(),
        version: "1.0.0".to_string(),
        sample_rate: 44100,
        window: 343_980,
        hop: 171_990,
        stems: ["drums", "bass", "other", "vocals"].map(String::from).to_vec(),
        ..Default::default()
    }
}

/// Load a model from a custom local path with the default HTDemucs manifest.
pub fn load_model_from_path(model_path: impl AsRef<Path>) -> Result<ModelHandle> {
    let path = model_path.as_ref().to_path_buf();
    if !path.exists() {
        return Err(StemError::NotFound(format!(
            "model file {}",
            path.display()
        )));
    }
    Ok(ModelHandle {
        manifest: default_htdemucs_manifest(),
        local_path: path,
    })
}

/// Resolve, download and verify a model into the per-user cache.
pub fn ensure_model(
    model_name: &str,
    manifest_url_override: Option<&str>,
    progress: &dyn ProgressSink,
) -> Result<ModelHandle> {
    let cache_dir = models_cache_dir()?;
    ensure_model_in(&cache_dir, model_name, manifest_url_override, progress)
}

/// [`ensure_model`] with an explicit cache directory.
pub fn ensure_model_in(
    cache_dir: &Path,
    model_name: &str,
    manifest_url_override: Option<&str>,
    progress: &dyn ProgressSink,
) -> Result<ModelHandle> {
    let manifest_url = match manifest_url_override {
        Some(u) => u.to_string(),
        None => resolve_manifest_url(model_name)?,
    };

    let client = http_client();
    let manifest: ModelManifest = client
        .get(&manifest_url)
        .send()?
        .error_for_status()?
        .json()?;

    let a = manifest
        .primary_artifact()
        .map_err(StemError::Manifest)?;
    if a.sha256.len() < 8 {
        return Err(StemError::Manifest(format!(
            "artifact {} has no usable sha256",
            a.file
        )));
    }

    fs::create_dir_all(cache_dir)?;
    let ext = a
        .file
        .rsplit('.')
        .next()
        .map(|s| format!(".{s}"))
        .unwrap_or_default();
    let file_name = format!("{}-{}{}", manifest.name, &a.sha256[..8], ext);
    let local_path = cache_dir.join(file_name);

    let need_download = !matches!(verify_sha256(&local_path, &a.sha256), Ok(true));
    if need_download {
        info!("downloading model {} from {}", manifest.name, a.url);
        download_with_progress(&client, &a.url, &local_path, progress)?;
        if !verify_sha256(&local_path, &a.sha256)? {
            let _ = fs::remove_file(&local_path);
            return Err(StemError::Checksum {
                path: local_path.display().to_string(),
            });
        }
        if a.size_bytes > 0 {
            let size = fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
            if size != a.size_bytes {
                warn!(
                    "size mismatch for {}, expected {}, got {}",
                    local_path.display(),
                    a.size_bytes,
                    size
                );
            }
        }
    } else {
        info!("model {} already cached at {}", manifest.name, local_path.display());
        progress.report(1.0);
    }

    Ok(ModelHandle {
        manifest,
        local_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::progress::NoProgress;

    #[test]
    fn missing_local_model_is_not_found() {
        let err = load_model_from_path("/nonexistent/model.onnx").unwrap_err();
        assert!(matches!(err, StemError::NotFound(_)));
    }

    #[test]
    fn local_model_uses_default_manifest() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let h = load_model_from_path(f.path()).unwrap();
        assert_eq!(h.manifest.sample_rate, 44100);
        assert_eq!(h.manifest.stems.len(), 4);
        assert_eq!(h.local_path, f.path());
    }

    #[test]
    fn unknown_model_name_fails_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_model_in(dir.path(), "no_such_model", None, &NoProgress).unwrap_err();
        assert!(matches!(err, StemError::Manifest(_)));
    }
}
