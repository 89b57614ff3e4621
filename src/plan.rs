//! Adaptive iteration planning.
//!
//! A short calibration pass estimates the per-call cost, then the timed pass is sized so its
//! total wall-clock time lands near the budget.

use std::time::Duration;

/// Iterations used when a single call already exceeds the whole budget
pub const OVER_BUDGET_ITERATIONS: usize = 2;

/// Timed-pass iteration count for a measured average call duration.
///
/// Fills `max_total` with calls of `avg_op_duration`, capped at `requested`. A call longer than
/// the whole budget gets exactly [`OVER_BUDGET_ITERATIONS`].
pub fn prefer_iterations(avg_op_duration: f64, requested: usize, max_total: f64) -> usize {
    if avg_op_duration > max_total {
        OVER_BUDGET_ITERATIONS
    } else {
        // ceil(x / 0) = inf saturates to usize::MAX and is then capped
        ((max_total / avg_op_duration).ceil() as usize).min(requested)
    }
}

/// Result of the calibration pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub elapsed: Duration,
    pub calls: usize,
}

impl Calibration {
    /// Average seconds per call
    pub fn avg_op_duration(&self) -> f64 {
        self.elapsed.as_nanos() as f64 / 1e9 / self.calls as f64
    }

    pub fn plan(&self, requested: usize, max_total: Duration) -> usize {
        prefer_iterations(self.avg_op_duration(), requested, max_total.as_secs_f64())
    }
}
