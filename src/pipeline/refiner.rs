use crate::{
    config::RefineOptions,
    core::{
        audio::{read_audio, write_audio},
        denoise::StationaryDenoiser,
    },
    error::Result,
    io::{
        ffmpeg::{Transcoder, VOCAL_FILTER_CHAIN},
        progress::ProgressSink,
    },
};

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, warn};

/// Refinement stage: noise suppression, then filter-chain shaping.
///
/// Never fails. Each step degrades to the best content available, and an
/// unexpected error returns the input path itself.
pub struct Refiner {
    transcoder: Arc<dyn Transcoder>,
    denoiser: StationaryDenoiser,
    min_samples: usize,
}

impl Refiner {
    pub fn new(transcoder: Arc<dyn Transcoder>, opts: &RefineOptions) -> Self {
        Self {
            transcoder,
            denoiser: StationaryDenoiser::new(opts.prop_decrease),
            min_samples: opts.min_samples,
        }
    }

    /// Refine `input` into `<stem>_refined.wav`, next to the input unless
    /// `output_dir` is given. Suppression and shaping each own half of the
    /// progress range.
    pub fn refine(&self, input: &Path, output_dir: Option<&Path>, progress: &dyn ProgressSink) -> PathBuf {
        progress.report(0.0);
        let out = match self.try_refine(input, output_dir, progress) {
            Ok(p) => p,
            Err(e) => {
                warn!("refinement of {} failed ({}), serving the original", input.display(), e);
                input.to_path_buf()
            }
        };
        progress.report(1.0);
        out
    }

    fn try_refine(&self, input: &Path, output_dir: Option<&Path>, progress: &dyn ProgressSink) -> Result<PathBuf> {
        let dir = match output_dir {
            Some(d) => d.to_path_buf(),
            None => input
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        fs::create_dir_all(&dir)?;
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audio");
        let denoised = dir.join(format!("{stem}_denoised.tmp.wav"));
        let refined = dir.join(format!("{stem}_refined.wav"));

        self.suppress_noise(input, &denoised)?;
        progress.report(0.5);

        match self
            .transcoder
            .apply_filter(&denoised, &refined, VOCAL_FILTER_CHAIN)
        {
            Ok(()) => {
                if let Err(e) = fs::remove_file(&denoised) {
                    warn!("could not remove {}: {}", denoised.display(), e);
                }
            }
            Err(e) => {
                warn!("shaping failed ({}), keeping the noise-suppressed audio", e);
                if fs::rename(&denoised, &refined).is_err() {
                    fs::copy(input, &refined)?;
                }
            }
        }

        info!("refined {} -> {}", input.display(), refined.display());
        Ok(refined)
    }

    /// Write the suppressed signal to `dest`, or a byte copy of `input` when
    /// the input is too short or suppression fails.
    fn suppress_noise(&self, input: &Path, dest: &Path) -> Result<()> {
        let audio = match read_audio(input) {
            Ok(a) => a,
            Err(e) => {
                warn!("cannot read {} for noise suppression ({}), passing through", input.display(), e);
                fs::copy(input, dest)?;
                return Ok(());
            }
        };

        if audio.frames() < self.min_samples.max(self.denoiser.n_fft) {
            info!("{} frames is too short for noise suppression, passing through", audio.frames());
            fs::copy(input, dest)?;
            return Ok(());
        }

        match self.denoiser.denoise(&audio) {
            Ok(clean) => write_audio(dest, &clean),
            Err(e) => {
                warn!("noise suppression failed ({}), passing through", e);
                fs::copy(input, dest)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::StemError, io::progress::NoProgress, types::AudioData};
    use std::sync::Mutex;

    struct CopyFilter;

    impl Transcoder for CopyFilter {
        fn to_pcm_wav(&self, _i: &Path, _o: &Path, _c: u16, _r: u32) -> Result<()> {
            unreachable!()
        }

        fn apply_filter(&self, input: &Path, output: &Path, _chain: &str) -> Result<()> {
            fs::copy(input, output)?;
            Ok(())
        }
    }

    struct BrokenFilter;

    impl Transcoder for BrokenFilter {
        fn to_pcm_wav(&self, _i: &Path, _o: &Path, _c: u16, _r: u32) -> Result<()> {
            unreachable!()
        }

        fn apply_filter(&self, _input: &Path, _output: &Path, _chain: &str) -> Result<()> {
            Err(StemError::Timeout {
                program: "ffmpeg".into(),
                seconds: 60,
            })
        }
    }

    fn write_short(path: &Path) {
        write_audio(
            path,
            &AudioData {
                samples: vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3],
                sample_rate: 44100,
                channels: 2,
            },
        )
        .unwrap();
    }

    #[test]
    fn successful_shaping_cleans_up_temp() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("vocals.wav");
        write_short(&input);

        let refiner = Refiner::new(Arc::new(CopyFilter), &RefineOptions::default());
        let seen = Mutex::new(Vec::new());
        let sink = |f: f64| seen.lock().unwrap().push(f);
        let out = refiner.refine(&input, None, &sink);

        assert_eq!(out, dir.path().join("vocals_refined.wav"));
        assert!(!dir.path().join("vocals_denoised.tmp.wav").exists());
        assert_eq!(*seen.lock().unwrap(), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn failed_shaping_reuses_the_temp_name() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("vocals.wav");
        write_short(&input);
        let refiner = Refiner::new(Arc::new(BrokenFilter), &RefineOptions::default());

        for _ in 0..3 {
            let out = refiner.refine(&input, None, &NoProgress);
            assert_eq!(fs::read(&out).unwrap(), fs::read(&input).unwrap());
        }
        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["vocals.wav", "vocals_refined.wav"]);
    }

    #[test]
    fn unwritable_output_returns_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("vocals.wav");
        write_short(&input);
        // a file where the output directory should be
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, b"").unwrap();

        let refiner = Refiner::new(Arc::new(CopyFilter), &RefineOptions::default());
        assert_eq!(refiner.refine(&input, Some(&blocker), &NoProgress), input);
    }

    #[test]
    fn unreadable_input_is_still_served() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("notes.wav");
        fs::write(&input, b"not a wav").unwrap();
        let refiner = Refiner::new(Arc::new(CopyFilter), &RefineOptions::default());
        let out = refiner.refine(&input, None, &NoProgress);
        assert_eq!(fs::read(out).unwrap(), b"not a wav");
    }
}
