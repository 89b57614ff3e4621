//! Benchmark methodology knobs.
//!
//! The defaults are the reference methodology: 5 warm-up calls, 5 calibration calls, a 10 second
//! budget for the timed pass, a 1 GiB assumed cache and 90% of the whole-GiB memory limit.

use std::{path::Path, time::Duration};

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WARMUP_ITERATIONS: usize = 5;
pub const DEFAULT_CALIBRATION_ITERATIONS: usize = 5;
pub const DEFAULT_MAX_TOTAL_DURATION_SECS: f64 = 10.0;
pub const DEFAULT_ASSUME_CACHE_BYTES: u64 = 1 << 30;
pub const DEFAULT_MEMORY_HEADROOM: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Untimed calls before calibration
    pub warmup_iterations: usize,
    /// Timed calls used to estimate per-call duration
    pub calibration_iterations: usize,
    /// Wall-clock budget for the timed pass, in seconds
    pub max_total_duration_secs: f64,
    /// Tensors above this size are double-buffered instead of pooled
    pub assume_cache_bytes: u64,
    /// Fraction of the whole-GiB memory limit that may be provisioned
    pub memory_headroom: f64,
    /// Peak memory bandwidth in GB/s (if known), for utilization figures
    pub peak_bandwidth_gbps: Option<f64>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            warmup_iterations: DEFAULT_WARMUP_ITERATIONS,
            calibration_iterations: DEFAULT_CALIBRATION_ITERATIONS,
            max_total_duration_secs: DEFAULT_MAX_TOTAL_DURATION_SECS,
            assume_cache_bytes: DEFAULT_ASSUME_CACHE_BYTES,
            memory_headroom: DEFAULT_MEMORY_HEADROOM,
            peak_bandwidth_gbps: None,
        }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `MICROPERF_TIME_BUDGET_SECS` and `MICROPERF_PEAK_BW_GBPS`
    pub fn from_env(mut self) -> anyhow::Result<Self> {
        if let Ok(budget) = std::env::var("MICROPERF_TIME_BUDGET_SECS") {
            self.max_total_duration_secs = budget
                .parse()
                .context("MICROPERF_TIME_BUDGET_SECS must be a number")?;
        }
        if let Ok(bw) = std::env::var("MICROPERF_PEAK_BW_GBPS") {
            self.peak_bandwidth_gbps =
                Some(bw.parse().context("MICROPERF_PEAK_BW_GBPS must be a number")?);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.calibration_iterations > 0,
            "calibration_iterations must be at least 1"
        );
        ensure!(
            self.max_total_duration_secs.is_finite() && self.max_total_duration_secs > 0.0,
            "max_total_duration_secs must be positive"
        );
        ensure!(
            self.memory_headroom > 0.0 && self.memory_headroom <= 1.0,
            "memory_headroom must be in (0, 1]"
        );
        if let Some(bw) = self.peak_bandwidth_gbps {
            ensure!(bw > 0.0, "peak_bandwidth_gbps must be positive");
        }
        Ok(())
    }

    pub fn max_total_duration(&self) -> Duration {
        Duration::from_secs_f64(self.max_total_duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_methodology() {
        let config = BenchConfig::default();
        assert_eq!(config.warmup_iterations, 5);
        assert_eq!(config.calibration_iterations, 5);
        assert_eq!(config.max_total_duration(), Duration::from_secs(10));
        assert_eq!(config.assume_cache_bytes, 1024 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: BenchConfig =
            serde_json::from_str(r#"{ "max_total_duration_secs": 0.5 }"#).unwrap();
        assert_eq!(config.max_total_duration_secs, 0.5);
        assert_eq!(config.warmup_iterations, 5);
        assert_eq!(config.peak_bandwidth_gbps, None);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = BenchConfig {
            calibration_iterations: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.calibration_iterations = 5;
        config.memory_headroom = 1.5;
        assert!(config.validate().is_err());
        config.memory_headroom = 0.9;
        config.max_total_duration_secs = 0.0;
        assert!(config.validate().is_err());
    }
}
