//! Progress reporting for long-running operations.
//!
//! Every scan (signature, diff, apply, validate, heal) takes a `&dyn Progress`
//! explicitly. There is no process-wide sink.

/// Receives progress updates as a fraction in `[0, 1]`.
///
/// Implementations may assume fractions never decrease within one operation.
pub trait Progress: Sync {
    /// Report overall completion.
    fn progress(&self, fraction: f64);

    /// Describe the item currently being processed, e.g. a file path.
    fn label(&self, _label: &str) {}
}

/// Progress sink that discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn progress(&self, _fraction: f64) {}
}

impl<F> Progress for F
where
    F: Fn(f64) + Sync,
{
    fn progress(&self, fraction: f64) {
        self(fraction);
    }
}

/// Tracks bytes processed against a known total and forwards fractions.
pub(crate) struct ByteCounter<'a> {
    sink: &'a dyn Progress,
    total: u64,
    done: u64,
}

impl<'a> ByteCounter<'a> {
    pub(crate) fn new(sink: &'a dyn Progress, total: u64) -> Self {
        Self {
            sink,
            total,
            done: 0,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn add(&mut self, bytes: u64) {
        self.done = self.done.saturating_add(bytes).min(self.total);
        if self.total > 0 {
            self.sink.progress(self.done as f64 / self.total as f64);
        }
    }

    pub(crate) fn label(&self, label: &str) {
        self.sink.label(label);
    }

    pub(crate) fn finish(&self) {
        self.sink.progress(1.0);
    }
}
