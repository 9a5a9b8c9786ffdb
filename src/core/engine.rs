//! ONNX Runtime session for the HTDemucs export.
//!
//! The graph takes a fixed-length stereo window through two branches: the raw
//! waveform (`input`, `[1, 2, T]`) and its complex-as-channels spectrogram
//! (`x`, `[1, 4, F, Frames]`). It answers with a time-domain estimate per
//! source and a spectral one; a stem is the sum of the first and the inverse
//! STFT of the second.

#![cfg_attr(feature = "engine-mock", allow(dead_code, unused_imports))]

use crate::{
    core::dsp::{istft_cac_stereo_parallel, stft_cac_stereo_centered},
    error::{Result, StemError},
    model::model_manager::ModelHandle,
    types::ModelManifest,
};

use anyhow::anyhow;
use ndarray::Array3;
use once_cell::sync::OnceCell;
use ort::{
    execution_providers::ExecutionProviderDispatch,
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::{Tensor, Value},
};
use std::{
    path::Path,
    sync::{Arc, Mutex},
};
use tracing::{debug, info, warn, Level};

#[cfg(all(feature = "cuda", any(target_os = "linux", target_os = "windows")))]
use ort::execution_providers::CUDAExecutionProvider;
#[cfg(all(feature = "coreml", target_os = "macos"))]
use ort::execution_providers::CoreMLExecutionProvider;
#[cfg(all(feature = "directml", target_os = "windows"))]
use ort::execution_providers::{DirectMLExecutionProvider, ExecutionProvider};
#[cfg(feature = "onednn")]
use ort::execution_providers::OneDNNExecutionProvider;

/// Samples per window the graph was exported with.
pub const WINDOW_SAMPLES: usize = 343_980;
const FREQ_BINS: usize = 2048;
const SPEC_FRAMES: usize = 336;
const N_FFT: usize = 4096;
const HOP: usize = 1024;

const INPUT_TIME: &str = "input";
const INPUT_SPEC: &str = "x";
const OUTPUT_SPEC: &str = "output";
const OUTPUT_TIME: &str = "add_67";

static ORT_INIT: OnceCell<()> = OnceCell::new();
static SHARED: OnceCell<Arc<DemucsSession>> = OnceCell::new();

/// Accelerators compiled in, by name. Empty means plain CPU.
#[allow(unused_mut)]
fn accelerators() -> Vec<(&'static str, ExecutionProviderDispatch)> {
    let mut out = Vec::new();

    #[cfg(all(feature = "cuda", any(target_os = "linux", target_os = "windows")))]
    {
        out.push(("CUDA", CUDAExecutionProvider::default().build()));
    }

    // CoreML yields silent stems on some exports, so it is opt-in.
    #[cfg(all(feature = "coreml", target_os = "macos"))]
    {
        if std::env::var_os("ENABLE_COREML").is_some() {
            out.push(("CoreML", CoreMLExecutionProvider::default().build()));
        } else {
            debug!("CoreML disabled (set ENABLE_COREML=1 to enable)");
        }
    }

    #[cfg(all(feature = "directml", target_os = "windows"))]
    {
        let device = (0..4).find(|&id| {
            matches!(
                DirectMLExecutionProvider::default()
                    .with_device_id(id)
                    .is_available(),
                Ok(true)
            )
        });
        match device {
            Some(id) => out.push((
                "DirectML",
                DirectMLExecutionProvider::default().with_device_id(id).build(),
            )),
            None => warn!("DirectML not available on any device"),
        }
    }

    #[cfg(feature = "onednn")]
    {
        out.push(("oneDNN", OneDNNExecutionProvider::default().build()));
    }

    out
}

fn cpu_session(path: &Path, threads: usize) -> std::result::Result<Session, ort::Error> {
    SessionBuilder::new()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(threads)?
        .with_inter_threads(threads)?
        .with_parallel_execution(true)?
        .commit_from_file(path)
}

fn accelerated_session(
    path: &Path,
    threads: usize,
    providers: Vec<ExecutionProviderDispatch>,
) -> std::result::Result<Session, ort::Error> {
    SessionBuilder::new()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_execution_providers(providers)?
        .with_intra_threads(threads)?
        .with_inter_threads(threads)?
        .commit_from_file(path)
}

/// Per-source estimates as returned by the graph, flattened row-major.
struct RawOutputs {
    sources: usize,
    time: Vec<f32>,
    spec: Vec<f32>,
}

pub struct DemucsSession {
    #[cfg(not(feature = "engine-mock"))]
    session: Mutex<Session>,
    manifest: ModelManifest,
}

impl DemucsSession {
    /// The process-wide session, committed from `handle` on first call.
    /// Later calls ignore `handle` and share the first session.
    pub fn shared(handle: &ModelHandle) -> Result<Arc<Self>> {
        SHARED
            .get_or_try_init(|| Self::open(handle).map(Arc::new))
            .cloned()
    }

    pub fn manifest(&self) -> &ModelManifest {
        &self.manifest
    }

    #[cfg(not(feature = "engine-mock"))]
    pub fn open(handle: &ModelHandle) -> Result<Self> {
        if handle.manifest.window != WINDOW_SAMPLES {
            return Err(StemError::Manifest(format!(
                "graph expects {}-sample windows, manifest says {}",
                WINDOW_SAMPLES, handle.manifest.window
            )));
        }
        ORT_INIT.get_or_try_init::<_, StemError>(|| {
            ort::init().commit().map_err(StemError::from)?;
            Ok(())
        })?;

        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let path = handle.local_path.as_path();
        let (names, providers): (Vec<_>, Vec<_>) = accelerators().into_iter().unzip();

        let session = if providers.is_empty() {
            info!("using CPU ({} threads)", threads);
            cpu_session(path, threads)?
        } else {
            info!("trying execution providers {:?} (CPU fallback)", names);
            match accelerated_session(path, threads, providers) {
                Ok(s) => s,
                Err(e) => {
                    warn!("accelerated session failed ({}), using CPU ({} threads)", e, threads);
                    cpu_session(path, threads)?
                }
            }
        };

        info!("model {} ready ({})", handle.manifest.name, path.display());
        Ok(Self {
            session: Mutex::new(session),
            manifest: handle.manifest.clone(),
        })
    }

    /// Separate one window. Returns `[sources, 2, T]`.
    #[cfg(not(feature = "engine-mock"))]
    pub fn run_window(&self, left: &[f32], right: &[f32]) -> Result<Array3<f32>> {
        if left.len() != right.len() {
            return Err(anyhow!("L/R length mismatch").into());
        }
        let t = left.len();
        if t != WINDOW_SAMPLES {
            return Err(anyhow!("bad window length {} (expected {})", t, WINDOW_SAMPLES).into());
        }

        let mut planar = Vec::with_capacity(2 * t);
        planar.extend_from_slice(left);
        planar.extend_from_slice(right);
        let time_in: Value = Tensor::from_array((vec![1, 2, t], planar))?.into_dyn();

        let (spec, bins, frames) = stft_cac_stereo_centered(left, right, N_FFT, HOP);
        if (bins, frames) != (FREQ_BINS, SPEC_FRAMES) {
            return Err(anyhow!(
                "spectrogram is {}x{}, graph wants {}x{}",
                bins,
                frames,
                FREQ_BINS,
                SPEC_FRAMES
            )
            .into());
        }
        let spec_in: Value = Tensor::from_array((vec![1, 4, bins, frames], spec))?.into_dyn();

        let raw = self.infer(time_in, spec_in)?;
        combine_branches(&raw, t)
    }

    #[cfg(not(feature = "engine-mock"))]
    fn infer(&self, time_in: Value, spec_in: Value) -> Result<RawOutputs> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("inference session poisoned"))?;

        for wanted in [INPUT_TIME, INPUT_SPEC] {
            if !session.inputs.iter().any(|i| i.name == wanted) {
                return Err(StemError::Manifest(format!("graph has no input '{wanted}'")));
            }
        }

        let outputs = session.run(vec![
            (INPUT_TIME.to_string(), time_in),
            (INPUT_SPEC.to_string(), spec_in),
        ])?;

        let mut time: Option<Value> = None;
        let mut spec: Option<Value> = None;
        for (name, val) in outputs.into_iter() {
            if name == OUTPUT_TIME {
                time = Some(val);
            } else if name == OUTPUT_SPEC {
                spec = Some(val);
            }
        }
        let time = time.ok_or_else(|| anyhow!("graph returned no '{}'", OUTPUT_TIME))?;
        let spec = spec.ok_or_else(|| anyhow!("graph returned no '{}'", OUTPUT_SPEC))?;

        let (time_shape, time_data) = time.try_extract_tensor::<f32>()?;
        let (spec_shape, spec_data) = spec.try_extract_tensor::<f32>()?;
        let sources = time_shape[1] as usize;

        let expected = [1, sources as i64, 4, FREQ_BINS as i64, SPEC_FRAMES as i64];
        if spec_shape.len() != expected.len() || (0..5).any(|k| spec_shape[k] != expected[k]) {
            return Err(anyhow!(
                "unexpected spectral output {:?}, wanted {:?}",
                spec_shape,
                expected
            )
            .into());
        }

        Ok(RawOutputs {
            sources,
            time: time_data.to_vec(),
            spec: spec_data.to_vec(),
        })
    }
}

/// Add each source's time branch to the inverse of its spectral branch.
fn combine_branches(raw: &RawOutputs, t: usize) -> Result<Array3<f32>> {
    let per_source = 4 * FREQ_BINS * SPEC_FRAMES;
    let specs: Vec<&[f32]> = raw.spec.chunks_exact(per_source).take(raw.sources).collect();

    if tracing::enabled!(Level::DEBUG) {
        let peak = |v: &[f32]| v.iter().fold(0f32, |m, x| m.max(x.abs()));
        let (tp, sp) = (peak(&raw.time), peak(&raw.spec));
        debug!("window output peaks: time={:.6} spec={:.6}", tp, sp);
        if tp < 1e-10 && sp < 1e-10 {
            warn!("all-zero window; the execution provider may be misbehaving");
        }
    }

    let freq = istft_cac_stereo_parallel(&specs, FREQ_BINS, SPEC_FRAMES, N_FFT, HOP, t);
    let mut out = Array3::<f32>::zeros((raw.sources, 2, t));
    for (src, (l, r)) in freq.into_iter().enumerate() {
        let base = src * 2 * t;
        for (ch, inv) in [l, r].iter().enumerate() {
            let time = &raw.time[base + ch * t..base + (ch + 1) * t];
            for (i, (a, b)) in time.iter().zip(inv.iter()).enumerate() {
                out[[src, ch, i]] = a + b;
            }
        }
    }
    Ok(out)
}

#[cfg(feature = "engine-mock")]
impl DemucsSession {
    /// Skips the graph; nothing is read from `handle.local_path`.
    pub fn open(handle: &ModelHandle) -> Result<Self> {
        Ok(Self {
            manifest: handle.manifest.clone(),
        })
    }

    /// Every source echoes the window.
    pub fn run_window(&self, left: &[f32], right: &[f32]) -> Result<Array3<f32>> {
        let t = left.len().min(right.len());
        let sources = self.manifest.stems.len().max(4);
        let mut out = Array3::<f32>::zeros((sources, 2, t));
        for s in 0..sources {
            for i in 0..t {
                out[[s, 0, i]] = left[i];
                out[[s, 1, i]] = right[i];
            }
        }
        Ok(out)
    }
}
