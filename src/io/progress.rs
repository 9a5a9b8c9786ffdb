//! Progress reporting capability handed down through every stage.
//!
//! A sink receives the fraction of *its own* unit of work that is complete,
//! in `[0, 1]`. Mapping a fraction into a larger scale is done by wrapping the
//! sink in a [`ScaledSink`], never by the stage doing arithmetic on a shared
//! value.

pub trait ProgressSink: Send + Sync {
    fn report(&self, fraction: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(f64) + Send + Sync,
{
    fn report(&self, fraction: f64) {
        self(fraction)
    }
}

/// Discards every update.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _fraction: f64) {}
}

/// Maps `[0, 1]` onto `[start, start + span]` of the inner sink.
pub struct ScaledSink<'a> {
    inner: &'a dyn ProgressSink,
    start: f64,
    span: f64,
}

impl<'a> ScaledSink<'a> {
    pub fn new(inner: &'a dyn ProgressSink, start: f64, span: f64) -> Self {
        Self { inner, start, span }
    }
}

impl ProgressSink for ScaledSink<'_> {
    fn report(&self, fraction: f64) {
        let f = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.inner.report(self.start + f * self.span);
    }
}
