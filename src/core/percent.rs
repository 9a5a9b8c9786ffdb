//! Scrapes completion percentages out of console-style progress output.
//!
//! Input grammar: arbitrary text in which progress appears as an integer
//! immediately followed by `%` (`" 42%|████▎     | 21/50"`). Updates are
//! usually separated by carriage returns rather than newlines, and a read
//! may end in the middle of a token. The most recent token wins.

use once_cell::sync::Lazy;
use regex::Regex;

static PERCENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)%").expect("static regex"));

/// Accumulated text above this size is truncated.
const MAX_BUFFER: usize = 512;
/// Bytes retained after truncation so a token split across reads survives.
const KEEP_TAIL: usize = 16;

#[derive(Debug, Default)]
pub struct PercentScanner {
    buf: String,
    last: Option<u32>,
}

impl PercentScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of raw output. Returns the newest percentage only if
    /// it differs from the last one returned.
    pub fn feed(&mut self, chunk: &str) -> Option<u32> {
        self.buf.push_str(chunk);

        let latest = PERCENT
            .captures_iter(&self.buf)
            .last()
            .and_then(|c| c[1].parse::<u32>().ok())
            .map(|p| p.min(100));

        if self.buf.len() > MAX_BUFFER {
            let cut = self.truncation_point();
            self.buf.drain(..cut);
        }

        match latest {
            Some(p) if self.last != Some(p) => {
                self.last = Some(p);
                Some(p)
            }
            _ => None,
        }
    }

    /// Never cuts inside a token: either everything up to the last complete
    /// token goes, or a short tail is kept whole with any digit run it starts in.
    fn truncation_point(&self) -> usize {
        let len = self.buf.len();
        if let Some(m) = PERCENT.find_iter(&self.buf).last() {
            if len - m.end() <= KEEP_TAIL {
                return m.end();
            }
        }
        let bytes = self.buf.as_bytes();
        let mut start = len - KEEP_TAIL;
        while !self.buf.is_char_boundary(start) {
            start += 1;
        }
        let floor = start.saturating_sub(8);
        while start > floor && bytes[start - 1].is_ascii_digit() {
            start -= 1;
        }
        start
    }

    /// Last value returned by [`feed`](Self::feed).
    pub fn last(&self) -> Option<u32> {
        self.last
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}
