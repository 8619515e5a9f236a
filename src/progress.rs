use tracing::info;

/// Observer for status lines and overall progress. Purely informational.
pub trait ProgressSink {
    fn status(&self, line: &str);

    /// Fraction in `0.0..=1.0`.
    fn progress(&self, fraction: f64);
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn status(&self, _line: &str) {}

    fn progress(&self, _fraction: f64) {}
}

/// Forwards status lines to `tracing`; progress is not logged.
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn status(&self, line: &str) {
        info!("{line}");
    }

    fn progress(&self, _fraction: f64) {}
}
