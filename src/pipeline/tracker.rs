//! Job key → percentage map shared by the pipeline and its observers.

use crate::{
    error::{Result, StemError},
    io::progress::ProgressSink,
};

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, warn};

/// Sub-range of the global 0–100 scale owned by one stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageWindow {
    pub offset: f64,
    pub weight: f64,
}

impl StageWindow {
    pub const ACQUISITION: StageWindow = StageWindow::new(0.0, 30.0);
    pub const SEPARATION: StageWindow = StageWindow::new(30.0, 50.0);
    pub const REFINEMENT: StageWindow = StageWindow::new(80.0, 20.0);
    /// Refinement invoked on its own.
    pub const STANDALONE: StageWindow = StageWindow::new(0.0, 100.0);

    pub const fn new(offset: f64, weight: f64) -> Self {
        Self { offset, weight }
    }

    pub fn end(&self) -> f64 {
        self.offset + self.weight
    }

    /// `offset + fraction * weight`, with the fraction clamped to `[0, 1]`.
    pub fn map(&self, fraction: f64) -> f64 {
        let f = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.offset + f * self.weight
    }
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    jobs: Mutex<HashMap<String, f64>>,
    reject_duplicates: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to start a job whose key is still below 100.
    pub fn with_duplicate_rejection(reject: bool) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            reject_duplicates: reject,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, f64>> {
        // The map only holds plain floats; a panicking writer cannot leave it torn.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a job at 0. Overwrites any previous entry for the key unless
    /// duplicate rejection is on and that job has not finished.
    pub fn begin(&self, key: &str) -> Result<()> {
        let mut jobs = self.lock();
        if let Some(&p) = jobs.get(key) {
            if self.reject_duplicates && p < 100.0 {
                return Err(StemError::JobInFlight(key.to_string()));
            }
            warn!("job '{}' restarted; previous progress {:.1} discarded", key, p);
        }
        jobs.insert(key.to_string(), 0.0);
        Ok(())
    }

    /// Store `percent` for `key`, clamped to `[0, 100]`.
    pub fn set(&self, key: &str, percent: f64) {
        let p = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.lock().insert(key.to_string(), p);
    }

    /// Like [`set`](Self::set), but only while `key` is tracked. Returns
    /// whether the value was stored. Writes after an observer drained the
    /// job are dropped.
    pub fn update(&self, key: &str, percent: f64) -> bool {
        let p = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        match self.lock().get_mut(key) {
            Some(v) => {
                *v = p;
                true
            }
            None => false,
        }
    }

    /// Current value; unknown keys read as 0.
    pub fn get(&self, key: &str) -> f64 {
        self.lock().get(key).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        if self.lock().remove(key).is_some() {
            debug!("job '{}' drained", key);
        }
    }

    /// Remove `key` only while it reads 100. A job restarted under the same
    /// key since the last read keeps its entry. Returns whether it went.
    pub fn remove_if_done(&self, key: &str) -> bool {
        let mut jobs = self.lock();
        match jobs.get(key) {
            Some(&p) if p >= 100.0 => {
                jobs.remove(key);
                debug!("job '{}' drained", key);
                true
            }
            _ => false,
        }
    }

    /// Mark a tracked job terminal so observers can stop waiting.
    pub fn finish(&self, key: &str) {
        self.update(key, 100.0);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sink that maps a stage's own fraction into `window` for `key`.
    pub fn stage_sink<'a>(&'a self, key: &'a str, window: StageWindow) -> StageSink<'a> {
        StageSink {
            tracker: self,
            key,
            window,
            high_water: Mutex::new(window.offset),
        }
    }
}

/// Writes one stage's progress into the tracker. Values never move
/// backwards within the stage, even if reports arrive out of order.
pub struct StageSink<'a> {
    tracker: &'a ProgressTracker,
    key: &'a str,
    window: StageWindow,
    high_water: Mutex<f64>,
}

impl ProgressSink for StageSink<'_> {
    fn report(&self, fraction: f64) {
        let mut hw = self.high_water.lock().unwrap_or_else(|e| e.into_inner());
        let global = self.window.map(fraction).max(*hw);
        *hw = global;
        self.tracker.update(self.key, global);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_tile_the_scale() {
        assert_eq!(StageWindow::ACQUISITION.offset, 0.0);
        assert_eq!(StageWindow::ACQUISITION.end(), StageWindow::SEPARATION.offset);
        assert_eq!(StageWindow::SEPARATION.end(), StageWindow::REFINEMENT.offset);
        assert_eq!(StageWindow::REFINEMENT.end(), 100.0);
        assert_eq!(StageWindow::STANDALONE.end(), 100.0);
    }

    #[test]
    fn unknown_key_reads_zero() {
        let t = ProgressTracker::new();
        assert_eq!(t.get("never-started"), 0.0);
        assert!(!t.contains("never-started"));
    }

    #[test]
    fn stage_sink_maps_and_never_regresses() {
        let t = ProgressTracker::new();
        t.begin("job").unwrap();
        let sink = t.stage_sink("job", StageWindow::SEPARATION);
        sink.report(0.5);
        assert_eq!(t.get("job"), 55.0);
        sink.report(0.2);
        assert_eq!(t.get("job"), 55.0);
        sink.report(1.0);
        assert_eq!(t.get("job"), 80.0);
        sink.report(4.0);
        assert_eq!(t.get("job"), 80.0);
    }

    #[test]
    fn drained_jobs_stay_drained() {
        let t = ProgressTracker::new();
        t.begin("job").unwrap();
        t.remove("job");
        t.stage_sink("job", StageWindow::REFINEMENT).report(1.0);
        t.finish("job");
        assert!(!t.contains("job"));
    }

    #[test]
    fn remove_if_done_spares_running_jobs() {
        let t = ProgressTracker::new();
        t.set("k", 100.0);
        t.begin("k").unwrap();
        assert!(!t.remove_if_done("k"));
        assert!(t.contains("k"));
        t.finish("k");
        assert!(t.remove_if_done("k"));
        assert!(!t.contains("k"));
        assert!(!t.remove_if_done("k"));
    }

    #[test]
    fn begin_overwrites_by_default() {
        let t = ProgressTracker::new();
        t.set("k", 42.0);
        t.begin("k").unwrap();
        assert_eq!(t.get("k"), 0.0);
    }

    #[test]
    fn begin_can_reject_in_flight_keys() {
        let t = ProgressTracker::with_duplicate_rejection(true);
        t.begin("k").unwrap();
        assert!(matches!(t.begin("k"), Err(StemError::JobInFlight(_))));
        t.finish("k");
        t.begin("k").unwrap();
    }

    #[test]
    fn set_clamps_and_clear_empties() {
        let t = ProgressTracker::new();
        t.set("a", 140.0);
        t.set("b", -3.0);
        assert_eq!(t.get("a"), 100.0);
        assert_eq!(t.get("b"), 0.0);
        assert_eq!(t.len(), 2);
        t.clear();
        assert!(t.is_empty());
    }
}
