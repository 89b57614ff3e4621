//! Per-invocation reports and their aggregation
//!
//! Communication and computation operators get different derived metrics: bus bandwidth for
//! collectives, kernel bandwidth and QPS for local kernels.

use serde::{Deserialize, Serialize};

use crate::{
    backend::HardwareInfo,
    op::{numel, ByteSizes, DType, OpClass},
};

const MIB: f64 = (1u64 << 20) as f64;

/// Outcome of one `perf` invocation
#[derive(Debug, Clone, PartialEq)]
pub enum PerfOutcome {
    Success { latency_us: f64 },
    OutOfMemory,
    ExecutionError { details: String },
}

impl PerfOutcome {
    pub fn latency_us(&self) -> f64 {
        match self {
            PerfOutcome::Success { latency_us } => *latency_us,
            _ => 0.0,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            PerfOutcome::Success { .. } => "",
            PerfOutcome::OutOfMemory => "OOM",
            PerfOutcome::ExecutionError { .. } => "RUN_OP_ERROR",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PerfOutcome::Success { .. })
    }
}

/// Metrics derived from latency and byte sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpMetrics {
    Computation {
        read_io_mb: f64,
        write_io_mb: f64,
        memory_mb: f64,
        kernel_bandwidth_gbps: Option<f64>,
        bandwidth_utilization: Option<f64>,
        qps: Option<f64>,
    },
    Communication {
        memory_mb: f64,
        group: usize,
        algo_bandwidth_gbps: Option<f64>,
        bus_bandwidth_gbps: Option<f64>,
        bandwidth_utilization: Option<f64>,
    },
}

/// Report for a single (operator, shapes, dtype) invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpReport {
    pub operator: String,
    pub dtype: DType,
    pub input_shapes: Vec<Vec<usize>>,
    /// Absent when the size function itself failed
    pub sizes: Option<ByteSizes>,
    pub world_size: Option<usize>,
    /// Average microseconds per call; 0 on failure
    pub latency_us: f64,
    /// "", "OOM" or "RUN_OP_ERROR"
    pub error: String,
    pub metrics: Option<OpMetrics>,
}

impl OpReport {
    /// Build the report, branching on the operator's class
    pub fn new(
        op_name: &str,
        dtype: DType,
        input_shapes: &[Vec<usize>],
        sizes: Option<ByteSizes>,
        world_size: Option<usize>,
        peak_bandwidth_gbps: Option<f64>,
        outcome: &PerfOutcome,
    ) -> Self {
        let latency_us = outcome.latency_us();
        let metrics = sizes.map(|sizes| match OpClass::of(op_name) {
            OpClass::Communication => communication_metrics(
                op_name,
                dtype,
                input_shapes,
                world_size.unwrap_or(1),
                peak_bandwidth_gbps,
                latency_us,
            ),
            OpClass::Computation => computation_metrics(&sizes, peak_bandwidth_gbps, latency_us),
        });
        Self {
            operator: op_name.to_string(),
            dtype,
            input_shapes: input_shapes.to_vec(),
            sizes,
            world_size,
            latency_us,
            error: outcome.error_code().to_string(),
            metrics,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }

    /// Bandwidth figure shown in summaries (kernel or bus bandwidth)
    pub fn bandwidth_gbps(&self) -> Option<f64> {
        match self.metrics.as_ref()? {
            OpMetrics::Computation {
                kernel_bandwidth_gbps,
                ..
            } => *kernel_bandwidth_gbps,
            OpMetrics::Communication {
                bus_bandwidth_gbps, ..
            } => *bus_bandwidth_gbps,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// GB/s moving `bytes` in `latency_us`
fn bandwidth_gbps(bytes: f64, latency_us: f64) -> Option<f64> {
    (latency_us > 0.0).then(|| bytes / latency_us / 1e3)
}

fn utilization(bw: Option<f64>, peak: Option<f64>) -> Option<f64> {
    Some(round2(bw? / peak? * 100.0))
}

fn computation_metrics(sizes: &ByteSizes, peak: Option<f64>, latency_us: f64) -> OpMetrics {
    let kernel_bw = bandwidth_gbps(sizes.rw_bytes as f64, latency_us);
    OpMetrics::Computation {
        read_io_mb: round2(sizes.read_bytes as f64 / MIB),
        write_io_mb: round2(sizes.write_bytes as f64 / MIB),
        memory_mb: round2(sizes.tensor_size() as f64 / MIB),
        kernel_bandwidth_gbps: kernel_bw.map(round2),
        bandwidth_utilization: utilization(kernel_bw, peak),
        qps: (latency_us > 0.0).then(|| round2(1e6 / latency_us * sizes.batch_size as f64)),
    }
}

/// Ratio of bus traffic to algorithm traffic for a collective over `group` ranks
pub fn bus_bandwidth_factor(op_name: &str, group: usize) -> f64 {
    let n = group.max(1) as f64;
    match op_name {
        "allreduce" => 2.0 * (n - 1.0) / n,
        "allgather" | "reducescatter" | "alltoall" => (n - 1.0) / n,
        _ => 1.0,
    }
}

fn communication_metrics(
    op_name: &str,
    dtype: DType,
    input_shapes: &[Vec<usize>],
    group: usize,
    peak: Option<f64>,
    latency_us: f64,
) -> OpMetrics {
    let bytes = input_shapes.first().map(|s| numel(s)).unwrap_or(0) as f64 * dtype.sizeof() as f64;
    let algo_bw = bandwidth_gbps(bytes, latency_us);
    let bus_bw = algo_bw.map(|bw| bw * bus_bandwidth_factor(op_name, group));
    OpMetrics::Communication {
        memory_mb: round2(bytes / MIB),
        group,
        algo_bandwidth_gbps: algo_bw.map(round2),
        bus_bandwidth_gbps: bus_bw.map(round2),
        bandwidth_utilization: utilization(bus_bw, peak),
    }
}

/// All reports of one run on one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchReport {
    pub backend: String,
    pub hardware: HardwareInfo,
    pub timestamp: String,
    pub results: Vec<OpReport>,
}

impl BenchReport {
    pub fn new(backend: &str, hardware: HardwareInfo) -> Self {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        Self {
            backend: backend.to_string(),
            hardware,
            timestamp,
            results: Vec::new(),
        }
    }

    pub fn add_result(&mut self, result: OpReport) {
        self.results.push(result);
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Save to JSON file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Print summary table to terminal
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(100));
        println!(
            "OPERATOR RESULTS - {} ({})",
            self.hardware.device_name, self.backend
        );
        if let Some(bw) = self.hardware.peak_bandwidth_gbps {
            println!("Peak Bandwidth: {:.0} GB/s", bw);
        }
        println!("{}", "=".repeat(100));
        println!(
            "{:<14} {:<10} {:<36} {:>14} {:>10} {:>12}",
            "Operator", "Dtype", "Shapes", "Latency(μs)", "GB/s", "Error"
        );
        println!("{}", "-".repeat(100));

        for r in &self.results {
            let shapes = format!("{:?}", r.input_shapes);
            let bw = r
                .bandwidth_gbps()
                .map(|bw| format!("{bw:.2}"))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<14} {:<10} {:<36} {:>14.2} {:>10} {:>12}",
                r.operator,
                r.dtype.as_str(),
                shapes,
                r.latency_us,
                bw,
                r.error
            );
        }
        println!("{}", "=".repeat(100));
    }
}
