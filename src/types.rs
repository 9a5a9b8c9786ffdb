use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

#[derive(Clone, Debug)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioData {
    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }
}

/// Audio produced by the acquisition stage. Read-only for everything downstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquiredAudio {
    pub path: PathBuf,
    /// Container/codec tag, taken from the file extension (`wav`, `m4a`, `webm`, ...).
    pub format: String,
}

impl AcquiredAudio {
    pub fn from_path(path: PathBuf) -> Self {
        let format = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        Self { path, format }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeparateRequest {
    #[serde(alias = "youtube_url")]
    pub url: String,
    #[serde(default)]
    pub refine: bool,
    #[serde(default)]
    pub job_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SeparateResponse {
    pub original: String,
    /// stem name -> artifact path
    pub separated: BTreeMap<String, String>,
    /// Refined vocals when refinement was requested, the raw separation output otherwise.
    pub vocals: String,
    pub instrumental: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefineRequest {
    pub path: String,
    #[serde(default)]
    pub job_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RefineResponse {
    pub original: String,
    pub refined: String,
}

/// One downloadable file listed in a model manifest.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Artifact {
    pub file: String,
    pub sha256: String,
    #[serde(default)]
    pub size_bytes: u64,
    pub url: String,
}

/// Remote description of a separation model. Unknown keys are ignored, so
/// manifests may carry graph metadata this crate does not read.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelManifest {
    pub name: String,
    #[serde(default)]
    pub version: String,

    #[serde(alias = "sample_rate_hz")]
    pub sample_rate: u32,
    pub window: usize,
    pub hop: usize,

    /// Order of the stem axis in the model output.
    #[serde(default)]
    pub stems: Vec<String>,

    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Which of `artifacts` holds the graph, when there are several.
    #[serde(default)]
    pub entry: String,

    // Single-file manifests predate `artifacts`.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub filesize: u64,
}

impl ModelManifest {
    /// The artifact to download: `entry` if named, the only artifact if
    /// there is one, else the legacy top-level `url`/`sha256`/`filesize`.
    pub fn primary_artifact(&self) -> Result<Artifact, String> {
        match (self.artifacts.as_slice(), self.entry.as_str()) {
            ([], _) => self.legacy_artifact(),
            ([only], "") => Ok(only.clone()),
            (_, "") => Err("multiple artifacts present but no 'entry' specified".into()),
            (all, entry) => all
                .iter()
                .find(|a| a.file == entry)
                .cloned()
                .ok_or_else(|| format!("entry '{entry}' not found in artifacts")),
        }
    }

    fn legacy_artifact(&self) -> Result<Artifact, String> {
        if self.url.is_empty() || self.sha256.len() < 8 || self.filesize == 0 {
            return Err("manifest has neither artifacts nor url/sha256/filesize".into());
        }
        let file = match self.url.rsplit('/').next() {
            Some(f) if !f.is_empty() => f.to_string(),
            _ => format!("{}-{}.bin", self.name, &self.sha256[..8]),
        };
        Ok(Artifact {
            file,
            sha256: self.sha256.clone(),
            size_bytes: self.filesize,
            url: self.url.clone(),
        })
    }
}
