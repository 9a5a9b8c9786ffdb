//! Stationary spectral gating.
//!
//! The noise floor is estimated per frequency bin from the signal itself:
//! a bin/frame passes when its level exceeds the bin's mean plus `n_std`
//! standard deviations (in dB). The binary mask is smoothed over frequency
//! and time, then applied with strength `prop_decrease`.

use crate::{
    core::dsp::{hann_window, istft, stft},
    error::{Result, StemError},
    types::AudioData,
};

use tracing::debug;

#[derive(Clone, Debug)]
pub struct StationaryDenoiser {
    /// 1.0 removes gated content entirely, 0.0 leaves the input untouched.
    pub prop_decrease: f32,
    pub n_fft: usize,
    pub hop: usize,
    pub n_std: f32,
    pub freq_smooth_hz: f32,
    pub time_smooth_ms: f32,
}

impl Default for StationaryDenoiser {
    fn default() -> Self {
        Self {
            prop_decrease: 0.9,
            n_fft: 1024,
            hop: 256,
            n_std: 1.5,
            freq_smooth_hz: 500.0,
            time_smooth_ms: 50.0,
        }
    }
}

impl StationaryDenoiser {
    pub fn new(prop_decrease: f32) -> Self {
        Self {
            prop_decrease: prop_decrease.clamp(0.0, 1.0),
            ..Self::default()
        }
    }

    /// Denoise every channel independently. Layout and length are preserved.
    pub fn denoise(&self, audio: &AudioData) -> Result<AudioData> {
        let ch = audio.channels as usize;
        if ch == 0 || audio.sample_rate == 0 {
            return Err(StemError::EmptyAudio);
        }
        let frames = audio.frames();
        if frames < self.n_fft {
            return Err(StemError::InvalidRequest(format!(
                "need at least {} frames to denoise, got {}",
                self.n_fft, frames
            )));
        }

        let window = hann_window(self.n_fft);
        let mut out = vec![0f32; frames * ch];
        for c in 0..ch {
            let plane: Vec<f32> = audio.samples.chunks_exact(ch).map(|f| f[c]).collect();
            let cleaned = self.denoise_plane(&plane, audio.sample_rate, &window);
            for (i, s) in cleaned.into_iter().enumerate() {
                out[i * ch + c] = s;
            }
        }

        Ok(AudioData {
            samples: out,
            sample_rate: audio.sample_rate,
            channels: audio.channels,
        })
    }

    fn denoise_plane(&self, plane: &[f32], sample_rate: u32, window: &[f32]) -> Vec<f32> {
        let mut spec = stft(plane, self.n_fft, self.hop, window);
        if spec.is_empty() {
            return plane.to_vec();
        }
        let bins = spec[0].len();
        let n_frames = spec.len();

        let db: Vec<Vec<f32>> = spec
            .iter()
            .map(|frame| frame.iter().map(|c| amp_to_db(c.norm())).collect())
            .collect();

        let mut thresh = vec![0f32; bins];
        for (k, th) in thresh.iter_mut().enumerate() {
            let mean = db.iter().map(|f| f[k]).sum::<f32>() / n_frames as f32;
            let var = db.iter().map(|f| (f[k] - mean).powi(2)).sum::<f32>() / n_frames as f32;
            *th = mean + self.n_std * var.sqrt();
        }

        let mask: Vec<Vec<f32>> = db
            .iter()
            .map(|f| {
                f.iter()
                    .zip(&thresh)
                    .map(|(v, t)| if v > t { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect();

        let bin_hz = sample_rate as f32 / self.n_fft as f32;
        let frame_ms = 1000.0 * self.hop as f32 / sample_rate as f32;
        let freq_radius = (self.freq_smooth_hz / bin_hz).round() as usize;
        let time_radius = (self.time_smooth_ms / frame_ms).round() as usize;
        debug!(
            "denoise: {} frames x {} bins, smoothing +-{} bins / +-{} frames",
            n_frames, bins, freq_radius, time_radius
        );
        let mask = box_smooth(&mask, freq_radius, time_radius);

        for (frame, m) in spec.iter_mut().zip(&mask) {
            for (c, &g) in frame.iter_mut().zip(m) {
                let gain = 1.0 - self.prop_decrease * (1.0 - g);
                *c *= gain;
            }
        }

        istft(&spec, self.n_fft, self.hop, window, plane.len())
    }
}

fn amp_to_db(a: f32) -> f32 {
    20.0 * a.max(1e-10).log10()
}

/// Separable moving average over a `[frames][bins]` grid. Edges average
/// over the cells that exist.
fn box_smooth(grid: &[Vec<f32>], freq_radius: usize, time_radius: usize) -> Vec<Vec<f32>> {
    let along_freq: Vec<Vec<f32>> = grid.iter().map(|row| moving_average(row, freq_radius)).collect();
    if along_freq.is_empty() {
        return along_freq;
    }
    let bins = along_freq[0].len();
    let mut out = vec![vec![0f32; bins]; along_freq.len()];
    let mut column = vec![0f32; along_freq.len()];
    for k in 0..bins {
        for (t, row) in along_freq.iter().enumerate() {
            column[t] = row[k];
        }
        for (t, v) in moving_average(&column, time_radius).into_iter().enumerate() {
            out[t][k] = v;
        }
    }
    out
}

fn moving_average(x: &[f32], radius: usize) -> Vec<f32> {
    if radius == 0 || x.is_empty() {
        return x.to_vec();
    }
    let mut prefix = Vec::with_capacity(x.len() + 1);
    prefix.push(0f32);
    for v in x {
        prefix.push(prefix[prefix.len() - 1] + v);
    }
    (0..x.len())
        .map(|i| {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius + 1).min(x.len());
            (prefix[hi] - prefix[lo]) / (hi - lo) as f32
        })
        .collect()
}
