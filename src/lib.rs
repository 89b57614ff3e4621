pub mod backend;
pub mod config;
pub mod engine;
pub mod op;
pub mod plan;
pub mod provision;
pub mod registry;
pub mod report;
pub mod workload;

#[cfg(test)]
pub mod tests;

pub mod prelude {
    pub use crate::backend::{Backend, HardwareInfo, MemInfo};
    pub use crate::config::BenchConfig;
    pub use crate::engine::PerfEngine;
    pub use crate::op::{numel, ByteSizes, DType, OpClass, Operator, TensorSet, COMMUNICATION_OPS};
    pub use crate::plan::{prefer_iterations, Calibration};
    pub use crate::provision::Provisioner;
    pub use crate::registry::OpRegistry;
    pub use crate::report::{BenchReport, OpMetrics, OpReport, PerfOutcome};
    pub use crate::workload::{Workload, WorkloadCase};
    pub use anyhow;
    pub use half::{bf16, f16};
    pub use rustc_hash::{FxHashMap, FxHashSet};
    pub use tracing;
}
