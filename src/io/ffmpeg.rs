use crate::{error::Result, io::process::run_with_timeout};

use std::{path::Path, process::Command, time::Duration};
use tracing::info;

/// Vocal shaping chain: cut rumble, cut harsh highs, then compress.
pub const VOCAL_FILTER_CHAIN: &str =
    "highpass=f=60,lowpass=f=8500,compand=attacks=0.1:decays=0.3:points=-80/-80|-30/-10|0/0";

/// External media-conversion tool.
///
/// Calls block until the tool exits or its deadline passes. Any error is
/// recoverable from the caller's point of view.
pub trait Transcoder: Send + Sync {
    /// Decode `input` and write PCM WAV with the given layout.
    fn to_pcm_wav(&self, input: &Path, output: &Path, channels: u16, sample_rate: u32) -> Result<()>;

    /// Run `input` through an audio filter graph into `output`.
    fn apply_filter(&self, input: &Path, output: &Path, filter_chain: &str) -> Result<()>;
}

pub struct Ffmpeg {
    program: String,
    convert_timeout: Duration,
    filter_timeout: Duration,
}

impl Ffmpeg {
    pub fn new(program: impl Into<String>, convert_timeout: Duration, filter_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            convert_timeout,
            filter_timeout,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-hide_banner", "-nostdin", "-loglevel", "error"]);
        cmd
    }
}

impl Transcoder for Ffmpeg {
    fn to_pcm_wav(&self, input: &Path, output: &Path, channels: u16, sample_rate: u32) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("-i")
            .arg(input)
            .args(["-ac", &channels.to_string(), "-ar", &sample_rate.to_string()])
            .arg("-y")
            .arg(output);
        run_with_timeout(cmd, self.convert_timeout)?;
        info!("converted {} -> {}", input.display(), output.display());
        Ok(())
    }

    fn apply_filter(&self, input: &Path, output: &Path, filter_chain: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("-i")
            .arg(input)
            .args(["-af", filter_chain])
            .arg("-y")
            .arg(output);
        run_with_timeout(cmd, self.filter_timeout)?;
        info!("filtered {} -> {}", input.display(), output.display());
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::StemError;

    #[test]
    fn missing_program_is_an_error() {
        let ff = Ffmpeg::new(
            "/nonexistent/ffmpeg",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let res = ff.apply_filter(Path::new("a.wav"), Path::new("b.wav"), VOCAL_FILTER_CHAIN);
        assert!(matches!(res, Err(StemError::Io(_))));
    }

    #[test]
    fn nonzero_exit_is_tool_error() {
        let ff = Ffmpeg::new("false", Duration::from_secs(5), Duration::from_secs(5));
        let res = ff.to_pcm_wav(Path::new("a.m4a"), Path::new("a.wav"), 2, 44100);
        assert!(matches!(res, Err(StemError::Tool { .. })));
    }
}
