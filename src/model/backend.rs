//! Separation models behind one interface.
//!
//! A model takes a planar stereo mixture `[2, n]` at its own sample rate
//! and returns `[stems, 2, n]`, stems ordered as [`SeparationModel::stem_names`].
//! Loading happens once, synchronously; the returned handle is shared.

use crate::{
    config::{ModelBackend, ModelOptions},
    core::{
        audio::{read_audio, write_planar},
        dsp::normalize_channels,
        engine::DemucsSession,
        percent::PercentScanner,
    },
    error::{Result, StemError},
    io::{
        process::tail,
        progress::{NoProgress, ProgressSink},
    },
    model::model_manager::{ensure_model, load_model_from_path, ModelHandle},
};

use anyhow::anyhow;
use ndarray::{s, Array3, ArrayView2};
use std::{
    io::Read,
    path::PathBuf,
    process::{Command, Stdio},
    sync::Arc,
    thread,
};
use tempfile::tempdir;
use tracing::{debug, info};

pub trait SeparationModel: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Output order of the stem axis.
    fn stem_names(&self) -> Vec<String>;

    fn separate(&self, mix: ArrayView2<f32>, progress: &dyn ProgressSink) -> Result<Array3<f32>>;
}

/// Resolve and load the configured backend.
pub fn load_separation_model(opts: &ModelOptions) -> Result<Arc<dyn SeparationModel>> {
    match opts.backend {
        ModelBackend::Onnx => {
            let handle = match &opts.model_path {
                Some(p) => load_model_from_path(p)?,
                None => ensure_model(
                    &opts.model_name,
                    opts.manifest_url_override.as_deref(),
                    &NoProgress,
                )?,
            };
            Ok(Arc::new(OrtDemucs::load(&handle)?))
        }
        ModelBackend::DemucsCli => Ok(Arc::new(DemucsCli::new(
            opts.demucs_program.clone(),
            opts.demucs_model.clone(),
        ))),
    }
}

/// HTDemucs exported to ONNX, run window by window in-process.
pub struct OrtDemucs {
    session: Arc<DemucsSession>,
    sample_rate: u32,
    window: usize,
    hop: usize,
    stems: Vec<String>,
}

impl OrtDemucs {
    /// Commits the process-wide session on first use; later calls reuse it.
    pub fn load(handle: &ModelHandle) -> Result<Self> {
        let session = DemucsSession::shared(handle)?;
        let mf = session.manifest();

        if mf.sample_rate != 44100 {
            return Err(StemError::Manifest(format!(
                "expected a 44.1k model, got {} Hz",
                mf.sample_rate
            )));
        }
        if !(mf.window > 0 && mf.hop > 0 && mf.hop <= mf.window) {
            return Err(StemError::Manifest(format!(
                "bad window/hop {}/{}",
                mf.window, mf.hop
            )));
        }

        let stems = if mf.stems.is_empty() {
            vec!["vocals".into(), "drums".into(), "bass".into(), "other".into()]
        } else {
            mf.stems.iter().map(|s| s.to_lowercase()).collect()
        };
        debug!("window={} hop={} stems={:?}", mf.window, mf.hop, stems);

        Ok(Self {
            sample_rate: mf.sample_rate,
            window: mf.window,
            hop: mf.hop,
            stems,
            session,
        })
    }
}

impl SeparationModel for OrtDemucs {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stem_names(&self) -> Vec<String> {
        self.stems.clone()
    }

    fn separate(&self, mix: ArrayView2<f32>, progress: &dyn ProgressSink) -> Result<Array3<f32>> {
        let (channels, n) = mix.dim();
        if channels != 2 {
            return Err(anyhow!("expected planar stereo, got {} channels", channels).into());
        }
        if n == 0 {
            return Err(StemError::EmptyAudio);
        }

        let (win, hop) = (self.window, self.hop);
        let total_windows = 1 + n.saturating_sub(1) / hop;
        let mut left_raw = vec![0f32; win];
        let mut right_raw = vec![0f32; win];
        let mut acc: Option<Array3<f32>> = None;
        let mut pos = 0usize;
        let mut done = 0usize;

        progress.report(0.0);
        while pos < n {
            for i in 0..win {
                let idx = pos + i;
                if idx < n {
                    left_raw[i] = mix[[0, idx]];
                    right_raw[i] = mix[[1, idx]];
                } else {
                    left_raw[i] = 0.0;
                    right_raw[i] = 0.0;
                }
            }

            let out = self.session.run_window(&left_raw, &right_raw)?;
            let (s_count, _, t_out) = out.dim();
            let buf = acc.get_or_insert_with(|| Array3::zeros((s_count, 2, n)));
            if buf.dim().0 != s_count {
                return Err(anyhow!("stem count changed between windows").into());
            }

            let copy_len = hop.min(t_out).min(n - pos);
            buf.slice_mut(s![.., .., pos..pos + copy_len])
                .assign(&out.slice(s![.., .., ..copy_len]));

            done += 1;
            progress.report(done as f64 / total_windows as f64);
            debug!("window {}/{}", done, total_windows);

            if pos + hop >= n {
                break;
            }
            pos += hop;
        }

        progress.report(1.0);
        acc.ok_or(StemError::EmptyAudio)
    }
}

/// The `demucs` command-line separator.
pub struct DemucsCli {
    program: String,
    model: String,
}

/// Stem files `demucs` writes, in the order they are stacked.
const CLI_STEMS: [&str; 4] = ["vocals", "drums", "bass", "other"];

impl DemucsCli {
    pub fn new(program: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
        }
    }

    /// Run the tool on `input`, forwarding its console percentages.
    fn run(&self, input: &std::path::Path, out_dir: &std::path::Path, progress: &dyn ProgressSink) -> Result<()> {
        info!("running {} -n {} on {}", self.program, self.model, input.display());
        let mut child = Command::new(&self.program)
            .arg("-n")
            .arg(&self.model)
            .arg("--out")
            .arg(out_dir)
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("{} stderr unavailable", self.program))?;

        // Updates are carriage-return delimited, so read raw chunks, not lines.
        let log = thread::scope(|s| {
            s.spawn(|| {
                let mut scanner = PercentScanner::new();
                let mut log = String::new();
                let mut buf = [0u8; 1024];
                while let Ok(n) = stderr.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    if let Some(p) = scanner.feed(&chunk) {
                        progress.report(p as f64 / 100.0);
                    }
                    log.push_str(&chunk);
                    if log.len() > 8192 {
                        log = tail(&log, 4096);
                    }
                }
                log
            })
            .join()
            .unwrap_or_default()
        });

        let status = child.wait()?;
        if !status.success() {
            return Err(StemError::Tool {
                program: self.program.clone(),
                status: status.to_string(),
                stderr: tail(&log, 2000),
            });
        }
        Ok(())
    }
}

impl SeparationModel for DemucsCli {
    fn sample_rate(&self) -> u32 {
        44100
    }

    fn stem_names(&self) -> Vec<String> {
        CLI_STEMS.iter().map(|s| s.to_string()).collect()
    }

    fn separate(&self, mix: ArrayView2<f32>, progress: &dyn ProgressSink) -> Result<Array3<f32>> {
        let n = mix.dim().1;
        if n == 0 {
            return Err(StemError::EmptyAudio);
        }
        let tmp = tempdir()?;
        let input = tmp.path().join("mix.wav");
        write_planar(&input, mix, self.sample_rate())?;

        progress.report(0.0);
        self.run(&input, tmp.path(), progress)?;

        let stem_dir: PathBuf = tmp.path().join(&self.model).join("mix");
        let mut out = Array3::<f32>::zeros((CLI_STEMS.len(), 2, n));
        for (k, name) in CLI_STEMS.iter().enumerate() {
            let path = stem_dir.join(format!("{name}.wav"));
            if !path.exists() {
                return Err(StemError::NotFound(path.display().to_string()));
            }
            let stem = normalize_channels(&read_audio(&path)?)?;
            let len = stem.dim().1.min(n);
            out.slice_mut(s![k, .., ..len]).assign(&stem.slice(s![.., ..len]));
        }
        progress.report(1.0);
        Ok(out)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::{fs, os::unix::fs::PermissionsExt, sync::Mutex};

    /// Fake `demucs`: prints tqdm-style progress and copies its input into
    /// every stem file.
    fn fake_demucs(dir: &std::path::Path) -> PathBuf {
        let script = dir.join("demucs");
        fs::write(
            &script,
            "#!/bin/sh\n\
             model=\"$2\"; out=\"$4\"; input=\"$5\"\n\
             mkdir -p \"$out/$model/mix\"\n\
             printf '  0%%|          | 0/4\\r' >&2; sleep 0.2\n\
             printf ' 50%%|#####     | 2/4\\r' >&2; sleep 0.2\n\
             printf '100%%|##########| 4/4\\n' >&2\n\
             for s in vocals drums bass other; do cp \"$input\" \"$out/$model/mix/$s.wav\"; done\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[test]
    fn cli_backend_stacks_stems_and_reports_percent() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_demucs(dir.path());
        let model = DemucsCli::new(program.to_string_lossy(), "htdemucs");

        let mut mix = Array2::<f32>::zeros((2, 2048));
        mix.row_mut(0).fill(0.25);
        mix.row_mut(1).fill(-0.25);

        let seen = Mutex::new(Vec::new());
        let sink = |f: f64| seen.lock().unwrap().push(f);
        let out = model.separate(mix.view(), &sink).unwrap();

        assert_eq!(out.dim(), (4, 2, 2048));
        assert_eq!(out[[0, 0, 10]], 0.25);
        assert_eq!(out[[3, 1, 10]], -0.25);
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&0.5));
        assert_eq!(seen.last(), Some(&1.0));
    }

    #[test]
    fn cli_backend_failure_is_tool_error() {
        let model = DemucsCli::new("false", "htdemucs");
        let mix = Array2::<f32>::zeros((2, 16));
        let err = model.separate(mix.view(), &NoProgress).unwrap_err();
        assert!(matches!(err, StemError::Tool { .. }));
    }

    #[test]
    fn cli_backend_missing_stems() {
        // exits cleanly but writes nothing
        let model = DemucsCli::new("true", "htdemucs");
        let mix = Array2::<f32>::zeros((2, 32));
        let err = model.separate(mix.view(), &NoProgress).unwrap_err();
        assert!(matches!(err, StemError::NotFound(_)));
    }

    #[test]
    fn cli_backend_rejects_empty_mix() {
        let model = DemucsCli::new("true", "htdemucs");
        let mix = Array2::<f32>::zeros((2, 0));
        assert!(matches!(
            model.separate(mix.view(), &NoProgress),
            Err(StemError::EmptyAudio)
        ));
    }

    #[cfg(feature = "engine-mock")]
    #[test]
    fn ort_backend_windows_cover_the_input() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let handle = load_model_from_path(f.path()).unwrap();
        let model = OrtDemucs::load(&handle).unwrap();
        let n = model.hop * 2 + 100;
        let mut mix = Array2::<f32>::zeros((2, n));
        for i in 0..n {
            mix[[0, i]] = (i % 7) as f32 * 0.01;
            mix[[1, i]] = -((i % 5) as f32) * 0.01;
        }
        let seen = Mutex::new(Vec::new());
        let sink = |f: f64| seen.lock().unwrap().push(f);
        let out = model.separate(mix.view(), &sink).unwrap();
        assert_eq!(out.dim(), (4, 2, n));
        assert_eq!(out.slice(s![2, .., ..]), mix.view());
        assert_eq!(seen.lock().unwrap().last(), Some(&1.0));
    }
}
