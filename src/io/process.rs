use crate::error::{Result, StemError};

use std::{
    io::Read,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::debug;

const POLL: Duration = Duration::from_millis(100);
/// Longest stderr tail kept for error reports.
const STDERR_TAIL: usize = 2000;

/// Run `cmd` to completion, killing it once `timeout` elapses.
///
/// Stdout is discarded. Stderr is drained on a helper thread so a chatty
/// tool cannot block on a full pipe. A non-zero exit becomes
/// [`StemError::Tool`], an expired deadline [`StemError::Timeout`].
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(program = %program, args = ?cmd.get_args().collect::<Vec<_>>(), "spawning");

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr_reader = child.stderr.take().map(|mut stderr| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    let started = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if started.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(StemError::Timeout {
                    program,
                    seconds: timeout.as_secs(),
                });
            }
            None => thread::sleep(POLL),
        }
    };

    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    if !status.success() {
        return Err(StemError::Tool {
            program,
            status: status.to_string(),
            stderr: tail(&stderr, STDERR_TAIL),
        });
    }
    Ok(())
}

pub(crate) fn tail(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn success_is_ok() {
        let cmd = Command::new("true");
        run_with_timeout(cmd, Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn failure_carries_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        match run_with_timeout(cmd, Duration::from_secs(5)) {
            Err(StemError::Tool { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn slow_tool_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let started = Instant::now();
        let res = run_with_timeout(cmd, Duration::from_millis(200));
        assert!(matches!(res, Err(StemError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("ééé", 3), "é");
        assert_eq!(tail("  short  ", 100), "short");
    }
}
