use crate::{
    core::splitter::Stem,
    error::{Result, StemError},
};

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelBackend {
    /// HTDemucs exported to ONNX, run in-process.
    Onnx,
    /// The `demucs` command-line separator.
    DemucsCli,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    pub backend: ModelBackend,
    pub model_name: String,
    pub manifest_url_override: Option<String>,
    /// Custom local path to the ONNX model file.
    /// If set, skips downloading and uses this file directly.
    pub model_path: Option<String>,
    pub demucs_program: String,
    pub demucs_model: String,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            backend: ModelBackend::Onnx,
            model_name: "htdemucs_ort_v1".into(),
            manifest_url_override: None,
            model_path: None,
            demucs_program: "demucs".into(),
            demucs_model: "htdemucs".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolOptions {
    pub ffmpeg: String,
    pub ytdlp: String,
    pub transcode_timeout_secs: u64,
    pub refine_timeout_secs: u64,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            ytdlp: "yt-dlp".into(),
            transcode_timeout_secs: 120,
            refine_timeout_secs: 60,
        }
    }
}

impl ToolOptions {
    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs)
    }

    pub fn refine_timeout(&self) -> Duration {
        Duration::from_secs(self.refine_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineOptions {
    /// Stem handed to the refiner when `refine` is requested.
    pub stem: Stem,
    /// Fraction of the noise floor removed by suppression.
    pub prop_decrease: f32,
    /// Inputs with fewer frames than this skip noise suppression.
    pub min_samples: usize,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            stem: Stem::Vocals,
            prop_decrease: 0.9,
            min_samples: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressOptions {
    pub poll_interval_ms: u64,
    pub reject_duplicate_jobs: bool,
    pub default_job_key: String,
}

impl Default for ProgressOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            reject_duplicate_jobs: false,
            default_job_key: "default".into(),
        }
    }
}

impl ProgressOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub staging_dir: PathBuf,
    pub output_dir: PathBuf,
    pub model: ModelOptions,
    pub tools: ToolOptions,
    pub refine: RefineOptions,
    pub progress: ProgressOptions,
    pub log_level: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("downloads"),
            output_dir: PathBuf::from("separated"),
            model: ModelOptions::default(),
            tools: ToolOptions::default(),
            refine: RefineOptions::default(),
            progress: ProgressOptions::default(),
            log_level: "info".into(),
        }
    }
}

impl PipelineOptions {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let opts: PipelineOptions = toml::from_str(&text)?;
        opts.validate()?;
        Ok(opts)
    }

    /// Defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tools.transcode_timeout_secs == 0 || self.tools.refine_timeout_secs == 0 {
            return Err(StemError::InvalidRequest("tool timeouts must be non-zero".into()));
        }
        if self.progress.poll_interval_ms == 0 {
            return Err(StemError::InvalidRequest("poll interval must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.refine.prop_decrease) {
            return Err(StemError::InvalidRequest(format!(
                "prop_decrease must be within [0, 1], got {}",
                self.refine.prop_decrease
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let opts = PipelineOptions::default();
        opts.validate().unwrap();
        assert_eq!(opts.refine.stem, Stem::Vocals);
        assert_eq!(opts.progress.default_job_key, "default");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "output_dir = \"out\"\n[refine]\nstem = \"other\"\n[progress]\nreject_duplicate_jobs = true"
        )
        .unwrap();
        let opts = PipelineOptions::from_file(f.path()).unwrap();
        assert_eq!(opts.output_dir, PathBuf::from("out"));
        assert_eq!(opts.refine.stem, Stem::Other);
        assert_eq!(opts.refine.min_samples, 1024);
        assert!(opts.progress.reject_duplicate_jobs);
        assert_eq!(opts.tools.ffmpeg, "ffmpeg");
    }

    #[test]
    fn rejects_out_of_range_suppression() {
        let mut opts = PipelineOptions::default();
        opts.refine.prop_decrease = 1.5;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn backend_names() {
        let opts: ModelOptions = toml::from_str("backend = \"demucs_cli\"").unwrap();
        assert_eq!(opts.backend, ModelBackend::DemucsCli);
    }
}
