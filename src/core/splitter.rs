use crate::{
    core::{
        audio::{read_audio, write_audio},
        dsp::prepare_for_model,
    },
    error::{Result, StemError},
    io::{
        ffmpeg::Transcoder,
        progress::{ProgressSink, ScaledSink},
    },
    model::backend::SeparationModel,
    types::{AcquiredAudio, AudioData},
};

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::tempdir;
use tracing::{info, warn};

/// Available stem types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stem {
    Vocals,
    Drums,
    Bass,
    Other,
}

impl Stem {
    /// All stems, in output order.
    pub fn all() -> &'static [Stem] {
        &[Stem::Vocals, Stem::Drums, Stem::Bass, Stem::Other]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stem::Vocals => "vocals",
            Stem::Drums => "drums",
            Stem::Bass => "bass",
            Stem::Other => "other",
        }
    }

    pub fn from_name(name: &str) -> Option<Stem> {
        Stem::all()
            .iter()
            .copied()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Separated audio held in memory, keyed by stem.
#[derive(Clone)]
pub struct SeparatedStems {
    /// [sample_index] = [left, right]
    stems: HashMap<Stem, Vec<[f32; 2]>>,
    pub sample_rate: u32,
    /// Number of samples per channel
    pub num_samples: usize,
}

impl SeparatedStems {
    /// Map a `[stems, 2, n]` model output onto named stems. Names the model
    /// does not report fall back to positional order. Fewer than four
    /// outputs is an error.
    pub fn from_model_output(out: &Array3<f32>, names: &[String], sample_rate: u32) -> Result<Self> {
        let (stems_count, channels, n) = out.dim();
        if channels != 2 {
            return Err(StemError::Shape(ndarray::ShapeError::from_kind(
                ndarray::ErrorKind::IncompatibleShape,
            )));
        }
        if stems_count < Stem::all().len() {
            return Err(anyhow::anyhow!(
                "model returned {} stems, expected at least {}",
                stems_count,
                Stem::all().len()
            )
            .into());
        }

        let name_idx: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_lowercase(), i))
            .collect();
        let get_idx = |key: &str, fallback: usize| -> usize {
            name_idx
                .get(key)
                .copied()
                .filter(|&i| i < stems_count)
                .unwrap_or(fallback)
        };

        let mut stems = HashMap::new();
        for (pos, stem) in Stem::all().iter().enumerate() {
            let st = get_idx(stem.name(), pos);
            let data: Vec<[f32; 2]> = (0..n).map(|i| [out[(st, 0, i)], out[(st, 1, i)]]).collect();
            stems.insert(*stem, data);
        }

        Ok(Self {
            stems,
            sample_rate,
            num_samples: n,
        })
    }

    /// Interleaved stereo samples of one stem.
    pub fn get(&self, stem: Stem) -> Vec<f32> {
        self.stems
            .get(&stem)
            .map(|data| data.iter().flat_map(|s| [s[0], s[1]]).collect())
            .unwrap_or_default()
    }

    pub fn get_audio(&self, stem: Stem) -> AudioData {
        AudioData {
            samples: self.get(stem),
            sample_rate: self.sample_rate,
            channels: 2,
        }
    }

    pub fn mix(&self, stems: &[Stem]) -> Vec<f32> {
        let mut out = vec![0.0f32; self.num_samples * 2];
        for stem in stems {
            if let Some(data) = self.stems.get(stem) {
                for (i, s) in data.iter().enumerate() {
                    out[i * 2] += s[0];
                    out[i * 2 + 1] += s[1];
                }
            }
        }
        out
    }

    /// Mix all stems except the specified ones
    pub fn mix_except_audio(&self, exclude: &[Stem]) -> AudioData {
        let include: Vec<Stem> = Stem::all()
            .iter()
            .copied()
            .filter(|s| !exclude.contains(s))
            .collect();
        AudioData {
            samples: self.mix(&include),
            sample_rate: self.sample_rate,
            channels: 2,
        }
    }

    pub fn save(&self, stem: Stem, path: &Path) -> Result<()> {
        write_audio(path, &self.get_audio(stem))
    }

    pub fn save_mix_except(&self, exclude: &[Stem], path: &Path) -> Result<()> {
        write_audio(path, &self.mix_except_audio(exclude))
    }
}

/// Paths of the separated stems, plus a refined variant once one exists.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StemSet {
    stems: Vec<(Stem, PathBuf)>,
    refined: Option<(Stem, PathBuf)>,
}

impl StemSet {
    pub fn new(stems: Vec<(Stem, PathBuf)>) -> Self {
        Self {
            stems,
            refined: None,
        }
    }

    pub fn get(&self, stem: Stem) -> Option<&Path> {
        self.stems
            .iter()
            .find(|(s, _)| *s == stem)
            .map(|(_, p)| p.as_path())
    }

    /// Adds `<stem>_refined`. The raw entry is kept.
    pub fn set_refined(&mut self, stem: Stem, path: PathBuf) {
        self.refined = Some((stem, path));
    }

    pub fn refined(&self) -> Option<(Stem, &Path)> {
        self.refined.as_ref().map(|(s, p)| (*s, p.as_path()))
    }

    pub fn len(&self) -> usize {
        self.stems.len() + usize::from(self.refined.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = self
            .stems
            .iter()
            .map(|(s, p)| (s.name().to_string(), p.display().to_string()))
            .collect();
        if let Some((s, p)) = &self.refined {
            map.insert(format!("{}_refined", s.name()), p.display().to_string());
        }
        map
    }
}

/// What the separation stage hands back.
#[derive(Clone, Debug)]
pub struct Separation {
    pub stems: StemSet,
    /// Mix of every stem except vocals.
    pub instrumental: PathBuf,
}

/// Separation stage: decode, normalize, run the model, write stems.
///
/// The model is loaded once by the caller and shared; one `Separator`
/// can serve any number of jobs.
pub struct Separator {
    model: Arc<dyn SeparationModel>,
    transcoder: Option<Arc<dyn Transcoder>>,
    output_dir: PathBuf,
}

impl Separator {
    pub fn new(model: Arc<dyn SeparationModel>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            model,
            transcoder: None,
            output_dir: output_dir.into(),
        }
    }

    /// Used to transcode inputs the built-in decoders cannot read.
    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Separate `input` into stems under the output directory.
    pub fn separate(&self, input: &AcquiredAudio, progress: &dyn ProgressSink) -> Result<Separation> {
        self.separate_into(input, &self.output_dir, progress)
    }

    /// Separate `input` into stems under `output_dir`.
    /// Progress covers decode (to 0.05), inference (to 0.9) and writing.
    pub fn separate_into(
        &self,
        input: &AcquiredAudio,
        output_dir: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<Separation> {
        progress.report(0.0);
        let audio = self.decode(&input.path)?;
        let mix = prepare_for_model(&audio, self.model.sample_rate())?;
        let n = mix.dim().1;
        if n == 0 {
            return Err(StemError::EmptyAudio);
        }
        progress.report(0.05);
        info!(
            "separating {} ({} frames at {} Hz)",
            input.path.display(),
            n,
            self.model.sample_rate()
        );

        let out = self
            .model
            .separate(mix.view(), &ScaledSink::new(progress, 0.05, 0.85))?;
        if out.dim().1 != 2 || out.dim().2 != n {
            return Err(anyhow::anyhow!(
                "model returned shape {:?}, expected [stems, 2, {}]",
                out.dim(),
                n
            )
            .into());
        }
        let stems =
            SeparatedStems::from_model_output(&out, &self.model.stem_names(), self.model.sample_rate())?;
        progress.report(0.9);

        fs::create_dir_all(output_dir)?;
        let file_stem = input
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");

        let mut written = Vec::with_capacity(Stem::all().len());
        for (i, stem) in Stem::all().iter().enumerate() {
            let path = output_dir.join(format!("{file_stem}_{}.wav", stem.name()));
            stems.save(*stem, &path)?;
            written.push((*stem, path));
            progress.report(0.9 + 0.02 * (i + 1) as f64);
        }

        let instrumental = output_dir.join(format!("{file_stem}_instrumental.wav"));
        stems.save_mix_except(&[Stem::Vocals], &instrumental)?;
        progress.report(1.0);

        Ok(Separation {
            stems: StemSet::new(written),
            instrumental,
        })
    }

    fn decode(&self, path: &Path) -> Result<AudioData> {
        if !path.exists() {
            return Err(StemError::NotFound(path.display().to_string()));
        }
        match read_audio(path) {
            Ok(a) => Ok(a),
            Err(e) => {
                let Some(t) = &self.transcoder else {
                    return Err(e);
                };
                warn!("direct decode of {} failed ({}), transcoding", path.display(), e);
                let tmp = tempdir()?;
                let wav = tmp.path().join("decoded.wav");
                t.to_pcm_wav(path, &wav, 2, self.model.sample_rate())?;
                read_audio(&wav)
            }
        }
    }
}
