//! Acquisition stage: remote locator → one local audio file.
//!
//! Strategies are tried in order; the first success wins. Each job stages
//! into its own subdirectory, and a failure sweeps only that directory of
//! partial downloads before the next strategy runs.

use crate::{
    error::Result,
    io::{
        ffmpeg::Transcoder,
        progress::{ProgressSink, ScaledSink},
        paths::job_dir_name,
        ytdlp::Downloader,
    },
    types::AcquiredAudio,
};

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

pub const PRIMARY_STEM: &str = "audio_temp";
pub const FALLBACK_STEM: &str = "audio_direct";

pub trait AcquisitionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch `locator` into `staging`, reporting this strategy's own
    /// fraction complete.
    fn acquire(&self, locator: &str, staging: &Path, progress: &dyn ProgressSink) -> Result<AcquiredAudio>;
}

/// Compact encoding, then transcoded to 2-channel 44.1 kHz PCM WAV.
/// Download covers the first half of the progress range; a successful
/// transcode jumps to the end.
pub struct TranscodedDownload {
    downloader: Arc<dyn Downloader>,
    transcoder: Arc<dyn Transcoder>,
}

impl TranscodedDownload {
    pub const FORMAT: &'static str = "bestaudio[ext=m4a]";

    pub fn new(downloader: Arc<dyn Downloader>, transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            downloader,
            transcoder,
        }
    }
}

impl AcquisitionStrategy for TranscodedDownload {
    fn name(&self) -> &'static str {
        "transcoded"
    }

    fn acquire(&self, locator: &str, staging: &Path, progress: &dyn ProgressSink) -> Result<AcquiredAudio> {
        fs::create_dir_all(staging)?;
        let template = staging.join(format!("{PRIMARY_STEM}.%(ext)s"));
        let encoded = self.downloader.fetch(
            locator,
            Self::FORMAT,
            &template,
            &ScaledSink::new(progress, 0.0, 0.5),
        )?;

        let wav = staging.join(format!("{PRIMARY_STEM}.wav"));
        self.transcoder.to_pcm_wav(&encoded, &wav, 2, 44100)?;
        if encoded != wav {
            if let Err(e) = fs::remove_file(&encoded) {
                warn!("could not remove {}: {}", encoded.display(), e);
            }
        }
        progress.report(1.0);
        Ok(AcquiredAudio::from_path(wav))
    }
}

/// Whatever native encoding the source offers, no transcoding.
pub struct NativeDownload {
    downloader: Arc<dyn Downloader>,
}

impl NativeDownload {
    pub const FORMAT: &'static str = "bestaudio";

    pub fn new(downloader: Arc<dyn Downloader>) -> Self {
        Self { downloader }
    }
}

impl AcquisitionStrategy for NativeDownload {
    fn name(&self) -> &'static str {
        "native"
    }

    fn acquire(&self, locator: &str, staging: &Path, progress: &dyn ProgressSink) -> Result<AcquiredAudio> {
        fs::create_dir_all(staging)?;
        let template = staging.join(format!("{FALLBACK_STEM}.%(ext)s"));
        let path = self
            .downloader
            .fetch(locator, Self::FORMAT, &template, progress)?;
        progress.report(1.0);
        Ok(AcquiredAudio::from_path(path))
    }
}

/// Delete partial downloads left in `dir`. Returns how many files went.
pub fn sweep_staging(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if is_partial(name) && path.is_file() {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("swept {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("could not sweep {}: {}", path.display(), e),
            }
        }
    }
    removed
}

fn is_partial(name: &str) -> bool {
    name.starts_with(&format!("{PRIMARY_STEM}."))
        || name.starts_with(&format!("{FALLBACK_STEM}."))
        || name.ends_with(".part")
        || name.ends_with(".ytdl")
}

pub struct Acquisition {
    staging_dir: PathBuf,
    strategies: Vec<Box<dyn AcquisitionStrategy>>,
}

impl Acquisition {
    pub fn new(staging_dir: impl Into<PathBuf>, strategies: Vec<Box<dyn AcquisitionStrategy>>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            strategies,
        }
    }

    /// Transcoded download first, native download as fallback.
    pub fn standard(
        staging_dir: impl Into<PathBuf>,
        downloader: Arc<dyn Downloader>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        let strategies: Vec<Box<dyn AcquisitionStrategy>> = vec![
            Box::new(TranscodedDownload::new(downloader.clone(), transcoder)),
            Box::new(NativeDownload::new(downloader)),
        ];
        Self::new(staging_dir, strategies)
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Where downloads for `job_key` land.
    pub fn job_staging_dir(&self, job_key: &str) -> PathBuf {
        self.staging_dir.join(job_dir_name(job_key))
    }

    /// `None` once every strategy has failed. Never returns an error.
    pub fn acquire(&self, locator: &str, job_key: &str, progress: &dyn ProgressSink) -> Option<AcquiredAudio> {
        let staging = self.job_staging_dir(job_key);
        for strategy in &self.strategies {
            match strategy.acquire(locator, &staging, progress) {
                Ok(audio) => {
                    info!("acquired {} via {} strategy", audio.path.display(), strategy.name());
                    return Some(audio);
                }
                Err(e) => {
                    warn!("{} acquisition failed: {}", strategy.name(), e);
                    let n = sweep_staging(&staging);
                    if n > 0 {
                        debug!("removed {} partial file(s)", n);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_patterns() {
        assert!(is_partial("audio_temp.m4a"));
        assert!(is_partial("audio_temp.m4a.part"));
        assert!(is_partial("audio_direct.webm"));
        assert!(is_partial("x.f140.m4a.ytdl"));
        assert!(!is_partial("song_vocals.wav"));
        assert!(!is_partial("audio_temperature.txt"));
    }

    #[test]
    fn sweep_leaves_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["audio_temp.m4a", "audio_direct.webm.part", "keep.wav"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        assert_eq!(sweep_staging(dir.path()), 2);
        assert!(dir.path().join("keep.wav").exists());
        assert_eq!(sweep_staging(&dir.path().join("missing")), 0);
    }
}
