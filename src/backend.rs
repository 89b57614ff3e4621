//! Device capability interface the benchmarking core is written against.

use serde::{Deserialize, Serialize};

/// Bytes of device memory, as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub available_bytes: u64,
    pub total_bytes: u64,
}

impl MemInfo {
    /// Available memory truncated to whole GiB
    pub fn memory_limit_gib(&self) -> u64 {
        self.available_bytes / (1 << 30)
    }
}

/// Hardware information for a backend device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub device_name: String,
    pub memory_gb: f64,
    pub device_count: usize,
    /// Peak memory bandwidth in GB/s (if known)
    pub peak_bandwidth_gbps: Option<f64>,
}

/// Trait that hardware backends implement to be benchmarked.
///
/// Synchronization primitives block the calling thread. `barrier` must be a no-op when no
/// process group has been set up.
pub trait Backend {
    /// Device-resident tensor handle
    type Tensor;
    /// Opaque device locator handed to tensor constructors
    type Device;

    /// Backend name (used in reports)
    fn name(&self) -> &'static str;

    /// Human readable name of the active device
    fn device_name(&self) -> String;

    fn device(&self) -> &Self::Device;

    fn device_count(&self) -> usize;

    fn set_device(&mut self, index: usize) -> anyhow::Result<()>;

    fn mem_info(&self) -> anyhow::Result<MemInfo>;

    /// Block until all work issued to the device has completed
    fn synchronize(&self) -> anyhow::Result<()>;

    /// Block until every rank of the process group reaches this point
    fn barrier(&self) -> anyhow::Result<()>;

    /// Return cached allocations to the device
    fn empty_cache(&self);

    fn rank(&self) -> usize {
        0
    }

    /// Number of ranks, or `None` when not running distributed
    fn world_size(&self) -> Option<usize> {
        None
    }

    /// Largest `value` passed by any rank. Blocks like a barrier; identity without a process group.
    fn max_across_ranks(&self, value: usize) -> anyhow::Result<usize> {
        Ok(value)
    }

    fn destroy_process_group(&mut self) {}

    fn hardware_info(&self) -> HardwareInfo {
        HardwareInfo {
            device_name: self.device_name(),
            memory_gb: self
                .mem_info()
                .map(|m| m.total_bytes as f64 / (1u64 << 30) as f64)
                .unwrap_or_default(),
            device_count: self.device_count(),
            peak_bandwidth_gbps: None,
        }
    }
}
