use crate::{
    error::{Result, StemError},
    types::AudioData,
};

use ndarray::Array2;
use num_complex::Complex32;
use rayon::prelude::*;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use rustfft::FftPlanner;
use std::f32::consts::PI;

/// Periodic Hann window (matches `torch.hann_window`).
pub fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / n as f32).cos())
        .collect()
}

fn reflect_index(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let mut k = i.rem_euclid(period);
    if k >= n as isize {
        k = period - k;
    }
    k as usize
}

/// Reflect padding without repeating the edge sample.
pub fn reflect_pad(x: &[f32], left: usize, right: usize) -> Vec<f32> {
    let n = x.len();
    let mut out = Vec::with_capacity(n + left + right);
    if n == 0 {
        out.resize(left + right, 0.0);
        return out;
    }
    for i in (1..=left).rev() {
        out.push(x[reflect_index(-(i as isize), n)]);
    }
    out.extend_from_slice(x);
    for i in 0..right {
        out.push(x[reflect_index((n + i) as isize, n)]);
    }
    out
}

/// Centered STFT: reflect-pads `n_fft / 2` on both sides and returns one
/// half-spectrum (`n_fft / 2 + 1` bins) per frame.
pub fn stft(signal: &[f32], n_fft: usize, hop: usize, window: &[f32]) -> Vec<Vec<Complex32>> {
    let padded = reflect_pad(signal, n_fft / 2, n_fft / 2);
    if padded.len() < n_fft {
        return Vec::new();
    }
    let n_frames = 1 + (padded.len() - n_fft) / hop;
    let bins = n_fft / 2 + 1;
    let fft = FftPlanner::<f32>::new().plan_fft_forward(n_fft);
    let mut buf = vec![Complex32::default(); n_fft];

    (0..n_frames)
        .map(|t| {
            let start = t * hop;
            for (i, b) in buf.iter_mut().enumerate() {
                *b = Complex32::new(padded[start + i] * window[i], 0.0);
            }
            fft.process(&mut buf);
            buf[..bins].to_vec()
        })
        .collect()
}

/// Inverse of [`stft`] by windowed overlap-add, trimmed to `length` samples.
pub fn istft(
    frames: &[Vec<Complex32>],
    n_fft: usize,
    hop: usize,
    window: &[f32],
    length: usize,
) -> Vec<f32> {
    if frames.is_empty() {
        return vec![0.0; length];
    }
    let full_len = n_fft + hop * (frames.len() - 1);
    let mut out = vec![0f32; full_len];
    let mut wsum = vec![0f32; full_len];
    let ifft = FftPlanner::<f32>::new().plan_fft_inverse(n_fft);
    let mut buf = vec![Complex32::default(); n_fft];
    let scale = 1.0 / n_fft as f32;

    for (t, spec) in frames.iter().enumerate() {
        let bins = spec.len();
        for (k, b) in buf.iter_mut().enumerate() {
            *b = if k < bins {
                spec[k]
            } else {
                spec[n_fft - k].conj()
            };
        }
        ifft.process(&mut buf);
        let start = t * hop;
        for i in 0..n_fft {
            out[start + i] += buf[i].re * scale * window[i];
            wsum[start + i] += window[i] * window[i];
        }
    }

    for (o, w) in out.iter_mut().zip(&wsum) {
        if *w > 1e-8 {
            *o /= *w;
        }
    }

    let mut res: Vec<f32> = out.into_iter().skip(n_fft / 2).take(length).collect();
    res.resize(length, 0.0);
    res
}

/// HTDemucs spectral branch input: `[4, F, Frames]` flattened, channel order
/// L.re, L.im, R.re, R.im, with the model's extra `hop / 2 * 3` reflect
/// padding, the last frequency bin dropped and the two edge frames trimmed.
pub fn stft_cac_stereo_centered(
    left: &[f32],
    right: &[f32],
    n_fft: usize,
    hop: usize,
) -> (Vec<f32>, usize, usize) {
    let t = left.len();
    let le = t.div_ceil(hop);
    let pad = hop / 2 * 3;
    let window = hann_window(n_fft);
    let norm = 1.0 / (n_fft as f32).sqrt();
    let f_bins = n_fft / 2;

    let mut out = vec![0f32; 4 * f_bins * le];
    for (c, ch) in [left, right].iter().enumerate() {
        let padded = reflect_pad(ch, pad, pad + le * hop - t);
        let spec = stft(&padded, n_fft, hop, &window);
        for f in 0..f_bins {
            for j in 0..le {
                let z = spec[j + 2][f] * norm;
                out[((2 * c) * f_bins + f) * le + j] = z.re;
                out[((2 * c + 1) * f_bins + f) * le + j] = z.im;
            }
        }
    }
    (out, f_bins, le)
}

#[allow(clippy::too_many_arguments)]
fn istft_cac_channel(
    spec: &[f32],
    c: usize,
    f_bins: usize,
    frames: usize,
    n_fft: usize,
    hop: usize,
    length: usize,
    window: &[f32],
) -> Vec<f32> {
    let pad = hop / 2 * 3;
    let le = hop * length.div_ceil(hop) + 2 * pad;
    let denorm = (n_fft as f32).sqrt();
    let bins = n_fft / 2 + 1;

    let mut cols = vec![vec![Complex32::default(); bins]; frames + 4];
    for j in 0..frames {
        for f in 0..f_bins {
            let re = spec[((2 * c) * f_bins + f) * frames + j];
            let im = spec[((2 * c + 1) * f_bins + f) * frames + j];
            cols[j + 2][f] = Complex32::new(re, im) * denorm;
        }
    }
    let x = istft(&cols, n_fft, hop, window, le);
    x[pad..pad + length].to_vec()
}

/// Invert per-source CAC spectrograms back to stereo time signals.
pub fn istft_cac_stereo_parallel(
    specs: &[&[f32]],
    f_bins: usize,
    frames: usize,
    n_fft: usize,
    hop: usize,
    length: usize,
) -> Vec<(Vec<f32>, Vec<f32>)> {
    let window = hann_window(n_fft);
    specs
        .par_iter()
        .map(|spec| {
            let ch = |c| istft_cac_channel(spec, c, f_bins, frames, n_fft, hop, length, &window);
            (ch(0), ch(1))
        })
        .collect()
}

/// Bring any channel layout to planar stereo `[2, frames]`.
///
/// Mono is duplicated, stereo passes through, and anything wider is a flat
/// average of all channels duplicated into both outputs.
pub fn normalize_channels(audio: &AudioData) -> Result<Array2<f32>> {
    let n = audio.channels as usize;
    let frames = audio.frames();
    if n == 0 || frames == 0 {
        return Err(StemError::EmptyAudio);
    }
    let s = &audio.samples;
    let mut out = Array2::<f32>::zeros((2, frames));

    match n {
        1 => {
            for i in 0..frames {
                out[[0, i]] = s[i];
                out[[1, i]] = s[i];
            }
        }
        2 => {
            for i in 0..frames {
                out[[0, i]] = s[2 * i];
                out[[1, i]] = s[2 * i + 1];
            }
        }
        _ => {
            for i in 0..frames {
                let frame = &s[i * n..(i + 1) * n];
                let mean = frame.iter().sum::<f32>() / n as f32;
                out[[0, i]] = mean;
                out[[1, i]] = mean;
            }
        }
    }
    Ok(out)
}

const RESAMPLE_CHUNK: usize = 8192;

/// Band-limited sinc resampling of a planar buffer. The result holds
/// exactly `round(frames * to_rate / from_rate)` frames.
pub fn resample_planar(audio: Array2<f32>, from_rate: u32, to_rate: u32) -> Result<Array2<f32>> {
    if from_rate == to_rate {
        return Ok(audio);
    }
    let (channels, frames) = audio.dim();
    if channels == 0 || frames == 0 {
        return Err(StemError::EmptyAudio);
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let expected = (frames as f64 * ratio).round() as usize;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, channels)?;

    // The resampler holds back the last part of every chunk; once the input
    // runs out, zero chunks push that tail through.
    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + RESAMPLE_CHUNK); channels];
    let mut chunk = vec![vec![0f32; RESAMPLE_CHUNK]; channels];
    let mut pos = 0;
    while out[0].len() < expected {
        for (buf, row) in chunk.iter_mut().zip(audio.outer_iter()) {
            buf.fill(0.0);
            if pos < frames {
                let end = (pos + RESAMPLE_CHUNK).min(frames);
                for (dst, src) in buf.iter_mut().zip(row.slice(ndarray::s![pos..end])) {
                    *dst = *src;
                }
            }
        }
        pos += RESAMPLE_CHUNK;
        let produced = resampler.process(&chunk, None)?;
        for (dst, src) in out.iter_mut().zip(produced) {
            dst.extend_from_slice(&src);
        }
    }

    let flat: Vec<f32> = out
        .into_iter()
        .flat_map(|mut ch| {
            ch.truncate(expected);
            ch
        })
        .collect();
    Ok(Array2::from_shape_vec((channels, expected), flat)?)
}

/// Channel normalization followed by resampling to `target_rate`.
pub fn prepare_for_model(audio: &AudioData, target_rate: u32) -> Result<Array2<f32>> {
    let stereo = normalize_channels(audio)?;
    resample_planar(stereo, audio.sample_rate, target_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn audio(samples: Vec<f32>, channels: u16) -> AudioData {
        AudioData {
            samples,
            sample_rate: 44100,
            channels,
        }
    }

    #[test]
    fn mono_is_duplicated() {
        let out = normalize_channels(&audio(vec![0.1, -0.2, 0.3], 1)).unwrap();
        assert_eq!(out.dim(), (2, 3));
        assert_eq!(out.row(0).to_vec(), vec![0.1, -0.2, 0.3]);
        assert_eq!(out.row(0), out.row(1));
    }

    #[test]
    fn stereo_passes_through() {
        let out = normalize_channels(&audio(vec![0.1, 0.9, -0.2, -0.8], 2)).unwrap();
        assert_eq!(out.row(0).to_vec(), vec![0.1, -0.2]);
        assert_eq!(out.row(1).to_vec(), vec![0.9, -0.8]);
    }

    #[test]
    fn four_channels_are_flat_averaged() {
        let samples = vec![
            0.5, 0.25, -1.0, 0.75, // frame 0 -> 0.125
            1.0, 1.0, 1.0, 1.0, // frame 1 -> 1.0
            -0.5, 0.0, 0.5, 0.0, // frame 2 -> 0.0
        ];
        let out = normalize_channels(&audio(samples.clone(), 4)).unwrap();
        assert_eq!(out.dim(), (2, 3));
        for i in 0..3 {
            let frame = &samples[i * 4..(i + 1) * 4];
            let expected = frame.iter().sum::<f32>() / 4.0;
            assert_eq!(out[[0, i]], expected);
            assert_eq!(out[[1, i]], expected);
        }
        assert_eq!(out.row(0).to_vec(), vec![0.125, 1.0, 0.0]);
    }

    #[test]
    fn six_channels_yield_two() {
        let samples: Vec<f32> = (0..60).map(|i| i as f32 / 60.0).collect();
        let out = normalize_channels(&audio(samples, 6)).unwrap();
        assert_eq!(out.dim(), (2, 10));
    }

    #[test]
    fn empty_audio_is_rejected() {
        assert!(matches!(
            normalize_channels(&audio(vec![], 2)),
            Err(StemError::EmptyAudio)
        ));
    }

    #[test]
    fn resample_changes_length_by_ratio() {
        let n = 48_000;
        let mut a = Array2::<f32>::zeros((2, n));
        for i in 0..n {
            let v = (2.0 * PI * 440.0 * i as f32 / 48_000.0).sin();
            a[[0, i]] = v;
            a[[1, i]] = v;
        }
        let out = resample_planar(a, 48_000, 44_100).unwrap();
        assert_eq!(out.dim(), (2, 44_100));
    }

    #[test]
    fn resample_is_aligned_and_keeps_the_tail() {
        let n = 48_000;
        let mut a = Array2::<f32>::zeros((1, n));
        for i in 0..n {
            a[[0, i]] = (2.0 * PI * 440.0 * i as f32 / 48_000.0).sin();
        }
        let out = resample_planar(a, 48_000, 44_100).unwrap();
        let len = out.dim().1;
        assert_eq!(len, 44_100);

        // edges see zero padding through the kernel; everything else,
        // including the last few hundred frames, tracks the tone in phase
        for k in 300..len - 200 {
            let want = (2.0 * PI * 440.0 * k as f32 / 44_100.0).sin();
            assert_abs_diff_eq!(out[[0, k]], want, epsilon = 0.03);
        }
    }

    #[test]
    fn same_rate_is_untouched() {
        let a = Array2::<f32>::from_elem((2, 16), 0.5);
        let out = resample_planar(a.clone(), 44_100, 44_100).unwrap();
        assert_eq!(out, a);
    }

    #[test]
    fn prepare_for_model_yields_stereo_at_target_rate() {
        let a = AudioData {
            samples: vec![0.0; 22_050 * 3],
            sample_rate: 22_050,
            channels: 3,
        };
        let out = prepare_for_model(&a, 44_100).unwrap();
        assert_eq!(out.dim().0, 2);
        assert!((out.dim().1 as f64 - 44_100.0).abs() < 441.0);
    }

    #[test]
    fn reflect_pad_mirrors_without_edge() {
        let x = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(
            reflect_pad(&x, 2, 2),
            vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]
        );
    }

    #[test]
    fn stft_istft_reconstructs() {
        let n_fft = 512;
        let hop = 128;
        let window = hann_window(n_fft);
        let x: Vec<f32> = (0..4000)
            .map(|i| (i as f32 * 0.013).sin() * 0.7 + (i as f32 * 0.31).cos() * 0.1)
            .collect();
        let spec = stft(&x, n_fft, hop, &window);
        let y = istft(&spec, n_fft, hop, &window, x.len());
        assert_eq!(y.len(), x.len());
        for (a, b) in x.iter().zip(&y) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn cac_roundtrip_matches_input() {
        let n_fft = 256;
        let hop = 64;
        let t: usize = 3000;
        let left: Vec<f32> = (0..t).map(|i| (i as f32 * 0.02).sin()).collect();
        let right: Vec<f32> = (0..t).map(|i| (i as f32 * 0.05).cos() * 0.5).collect();
        let (spec, f_bins, frames) = stft_cac_stereo_centered(&left, &right, n_fft, hop);
        assert_eq!(f_bins, n_fft / 2);
        assert_eq!(frames, t.div_ceil(hop));

        let out = istft_cac_stereo_parallel(&[&spec], f_bins, frames, n_fft, hop, t);
        let (l, r) = &out[0];
        // The zeroed edge frames attenuate the first and last hops, and the
        // dropped Nyquist bin loses a little energy.
        for i in 2 * hop..t - 3 * hop {
            assert_abs_diff_eq!(l[i], left[i], epsilon = 1e-2);
            assert_abs_diff_eq!(r[i], right[i], epsilon = 1e-2);
        }
    }
}
