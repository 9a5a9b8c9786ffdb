use crate::{
    error::{Result, StemError},
    io::{process::tail, progress::ProgressSink},
};

use anyhow::anyhow;
use std::{
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
};
use tracing::{debug, info};

const PROGRESS_TAG: &str = "[progress] ";
const FILE_TAG: &str = "[file] ";

/// External download utility.
pub trait Downloader: Send + Sync {
    /// Fetch `locator` using the given format selector. `output_template`
    /// names the file without its final extension (`dir/name.%(ext)s`).
    /// Reports the downloaded byte ratio to `progress` and returns the path
    /// of the finished file.
    fn fetch(
        &self,
        locator: &str,
        format: &str,
        output_template: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf>;
}

pub struct YtDlp {
    program: String,
}

impl YtDlp {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Downloader for YtDlp {
    fn fetch(
        &self,
        locator: &str,
        format: &str,
        output_template: &Path,
        progress: &dyn ProgressSink,
    ) -> Result<PathBuf> {
        info!("downloading {} (format {})", locator, format);

        let mut child = Command::new(&self.program)
            .args(["--no-playlist", "--restrict-filenames", "--newline", "--progress"])
            .arg("--progress-template")
            .arg(format!(
                "download:{PROGRESS_TAG}%(progress.downloaded_bytes)s/%(progress.total_bytes,progress.total_bytes_estimate)s"
            ))
            .arg("--print")
            .arg(format!("after_move:{FILE_TAG}%(filepath)s"))
            .args(["-f", format])
            .arg("-o")
            .arg(output_template)
            .arg(locator)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("{} stdout unavailable", self.program))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("{} stderr unavailable", self.program))?;

        // The progress template may land on either stream depending on quiet mode.
        let (out, err) = thread::scope(|s| {
            let err = s.spawn(|| scan_output(stderr, progress));
            let out = scan_output(stdout, progress);
            (out, err.join().unwrap_or_default())
        });

        let status = child.wait()?;
        if !status.success() {
            return Err(StemError::Tool {
                program: self.program.clone(),
                status: status.to_string(),
                stderr: tail(&err.log, 2000),
            });
        }

        let path = out
            .file
            .or(err.file)
            .ok_or_else(|| anyhow!("{} did not report an output file", self.program))?;
        if !path.exists() {
            return Err(StemError::NotFound(path.display().to_string()));
        }
        info!("download finished: {}", path.display());
        Ok(path)
    }
}

#[derive(Default)]
struct ScanResult {
    file: Option<PathBuf>,
    log: String,
}

fn scan_output<R: Read>(reader: R, progress: &dyn ProgressSink) -> ScanResult {
    let mut res = ScanResult::default();
    for line in BufReader::new(reader).lines().map_while(|l| l.ok()) {
        if let Some(fraction) = parse_progress_line(&line) {
            progress.report(fraction);
        } else if let Some(path) = line.strip_prefix(FILE_TAG) {
            res.file = Some(PathBuf::from(path.trim()));
        } else {
            debug!("yt-dlp: {}", line);
            res.log.push_str(&line);
            res.log.push('\n');
        }
    }
    res
}

/// Parse `[progress] <downloaded>/<total>` into a fraction.
/// Unknown totals (`NA`) yield nothing.
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let rest = line.trim().strip_prefix(PROGRESS_TAG.trim_end())?.trim();
    let (done, total) = rest.split_once('/')?;
    let done: f64 = done.trim().parse().ok()?;
    let total: f64 = total.trim().parse().ok()?;
    if total <= 0.0 {
        return None;
    }
    Some((done / total).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn parses_byte_ratio() {
        assert_eq!(parse_progress_line("[progress] 1024/4096"), Some(0.25));
        assert_eq!(parse_progress_line("  [progress] 4096/4096\r"), Some(1.0));
        // estimates can be floats and can undershoot
        assert_eq!(parse_progress_line("[progress] 300/200.5"), Some(1.0));
    }

    #[test]
    fn ignores_unknown_totals_and_noise() {
        assert_eq!(parse_progress_line("[progress] 1024/NA"), None);
        assert_eq!(parse_progress_line("[progress] 1024/0"), None);
        assert_eq!(parse_progress_line("[download] 45.3% of 3.20MiB"), None);
    }

    #[test]
    fn scan_collects_file_and_progress() {
        let text = "[youtube] abc: Downloading webpage\n\
                    [progress] 10/100\n\
                    [progress] 50/100\n\
                    [file] downloads/audio_temp.m4a\n";
        let seen = Mutex::new(Vec::new());
        let sink = |f: f64| seen.lock().unwrap().push(f);
        let res = scan_output(text.as_bytes(), &sink);
        assert_eq!(res.file, Some(PathBuf::from("downloads/audio_temp.m4a")));
        assert_eq!(*seen.lock().unwrap(), vec![0.1, 0.5]);
        assert!(res.log.contains("Downloading webpage"));
    }
}
