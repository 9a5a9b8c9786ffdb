use crate::{
    error::{Result, StemError},
    types::AudioData,
};

use anyhow::anyhow;
use hound::{SampleFormat, WavSpec, WavWriter};
use ndarray::ArrayView2;
use std::{fs::File, path::Path};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

/// Decode any supported file into interleaved f32 samples.
pub fn read_audio<P: AsRef<Path>>(path: P) -> Result<AudioData> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("no audio track in {}", path.display()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count() as u16;
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
            // A corrupt packet is skipped, not fatal.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    if samples.is_empty() || channels == 0 || sample_rate == 0 {
        return Err(StemError::EmptyAudio);
    }

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
    })
}

/// Write interleaved samples as 32-bit float WAV.
pub fn write_audio<P: AsRef<Path>>(path: P, audio: &AudioData) -> Result<()> {
    let spec = WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path.as_ref(), spec)?;
    for &s in &audio.samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Write a planar `[channels, frames]` buffer as 32-bit float WAV.
pub fn write_planar<P: AsRef<Path>>(path: P, audio: ArrayView2<f32>, sample_rate: u32) -> Result<()> {
    let (channels, frames) = audio.dim();
    let spec = WavSpec {
        channels: channels as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path.as_ref(), spec)?;
    for i in 0..frames {
        for ch in 0..channels {
            writer.write_sample(audio[[ch, i]])?;
        }
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn wav_roundtrip_keeps_layout() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..2048)
            .map(|i| ((i as f32) * 0.01).sin() * 0.5)
            .collect();
        let audio = AudioData {
            samples: samples.clone(),
            sample_rate: 22050,
            channels: 2,
        };
        write_audio(&p, &audio).unwrap();

        let back = read_audio(&p).unwrap();
        assert_eq!(back.sample_rate, 22050);
        assert_eq!(back.channels, 2);
        assert_eq!(back.samples, samples);
    }

    #[test]
    fn planar_is_written_interleaved() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("planar.wav");
        let mut buf = Array2::<f32>::zeros((2, 1024));
        buf.row_mut(0).fill(0.25);
        buf.row_mut(1).fill(-0.5);
        write_planar(&p, buf.view(), 44100).unwrap();

        let back = read_audio(&p).unwrap();
        assert_eq!(back.channels, 2);
        assert_eq!(back.frames(), 1024);
        assert_eq!(&back.samples[..4], &[0.25, -0.5, 0.25, -0.5]);
    }

    #[test]
    fn garbage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("noise.wav");
        std::fs::write(&p, b"definitely not audio").unwrap();
        assert!(read_audio(&p).is_err());
    }
}
