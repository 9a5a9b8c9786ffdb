use crate::pipeline::tracker::ProgressTracker;

use serde::Serialize;
use std::{sync::Arc, thread, time::Duration};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Progress { percent: f64 },
    Complete { status: &'static str },
}

impl ProgressEvent {
    pub fn complete() -> Self {
        ProgressEvent::Complete { status: "complete" }
    }

    /// Raw numeric value carried by the event.
    pub fn value(&self) -> f64 {
        match self {
            ProgressEvent::Progress { percent } => *percent,
            ProgressEvent::Complete { .. } => 100.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ProgressEvent::Complete { .. })
    }

    pub fn to_json(&self) -> String {
        // Plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Server-sent-event block: `event:` line, `data:` line, blank line.
    pub fn to_sse(&self) -> String {
        let name = if self.is_complete() { "complete" } else { "progress" };
        format!("event: {}\ndata: {}\n\n", name, self.to_json())
    }
}

/// Blocking stream of changes for one job key.
///
/// Polls the tracker every `interval` and yields a `Progress` event only
/// when the value moved. At 100 it yields `Progress { 100 }`, then
/// `Complete`, removes the key unless a new job took it over, and ends. Dropping the stream early is a
/// normal exit and leaves the entry in place.
pub struct ProgressStream {
    tracker: Arc<ProgressTracker>,
    key: String,
    interval: Duration,
    last: Option<f64>,
    state: StreamState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Polling,
    Completing,
    Done,
}

impl ProgressStream {
    pub fn new(tracker: Arc<ProgressTracker>, key: impl Into<String>, interval: Duration) -> Self {
        Self {
            tracker,
            key: key.into(),
            interval,
            last: None,
            state: StreamState::Polling,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Iterator for ProgressStream {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        match self.state {
            StreamState::Done => None,
            StreamState::Completing => {
                if !self.tracker.remove_if_done(&self.key) {
                    debug!("job '{}' restarted before drain; entry kept", self.key);
                }
                self.state = StreamState::Done;
                Some(ProgressEvent::complete())
            }
            StreamState::Polling => loop {
                let value = self.tracker.get(&self.key);
                if value >= 100.0 {
                    self.state = StreamState::Completing;
                    self.last = Some(100.0);
                    return Some(ProgressEvent::Progress { percent: 100.0 });
                }
                if self.last != Some(value) {
                    self.last = Some(value);
                    return Some(ProgressEvent::Progress { percent: value });
                }
                thread::sleep(self.interval);
            },
        }
    }
}
