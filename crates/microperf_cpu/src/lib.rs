//! Host CPU backend for microperf.
//!
//! Each rank of a distributed run is a thread holding its own [`CpuBackend`]; ranks of one run
//! share a [`LocalGroup`] that carries barriers and collectives.

pub mod comm;
pub mod compute;
pub mod group;
pub mod tensor;


use std::sync::Arc;

use microperf::prelude::*;
use sysinfo::System;
use tracing::trace;

pub use group::LocalGroup;
pub use tensor::{CpuTensor, Element, TensorData};

use comm::{Collective, CollectiveKind, Memcpy, MemcpyDirection};
use compute::{
    BatchGemm, BinaryKind, BinaryOp, Gemm, LayerNorm, ReduceKind, ReduceOp, Softmax, UnaryKind,
    UnaryOp,
};

const GIB: u64 = 1 << 30;

/// The only device a host backend has
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDevice {
    pub rank: usize,
}

pub struct CpuBackend {
    device: CpuDevice,
    group: Arc<LocalGroup>,
    distributed: bool,
    mem_limit_bytes: Option<u64>,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    /// Single-rank backend with no process group
    pub fn new() -> Self {
        Self {
            device: CpuDevice::default(),
            group: LocalGroup::new(1),
            distributed: false,
            mem_limit_bytes: None,
        }
    }

    /// Backend for `rank` within an in-process group
    pub fn with_group(rank: usize, group: Arc<LocalGroup>) -> Self {
        Self {
            device: CpuDevice { rank },
            distributed: true,
            group,
            mem_limit_bytes: None,
        }
    }

    /// Cap the memory this backend reports as available (before the per-rank split)
    pub fn with_memory_limit_gib(mut self, gib: f64) -> Self {
        self.mem_limit_bytes = Some((gib * GIB as f64) as u64);
        self
    }

    pub fn group(&self) -> &LocalGroup {
        &self.group
    }

    fn ranks(&self) -> u64 {
        if self.distributed {
            self.group.world_size() as u64
        } else {
            1
        }
    }
}

/// (available, total) bytes of host RAM
fn host_memory() -> (u64, u64) {
    let mut sys = System::new();
    sys.refresh_memory();
    (sys.available_memory(), sys.total_memory())
}

impl Backend for CpuBackend {
    type Tensor = CpuTensor;
    type Device = CpuDevice;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn device_name(&self) -> String {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        sys.cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "host cpu".to_string())
    }

    fn device(&self) -> &CpuDevice {
        &self.device
    }

    fn device_count(&self) -> usize {
        1
    }

    fn set_device(&mut self, index: usize) -> anyhow::Result<()> {
        anyhow::ensure!(index == 0, "cpu backend has a single device, got index {index}");
        Ok(())
    }

    /// Host memory, split evenly between the ranks sharing it
    fn mem_info(&self) -> anyhow::Result<MemInfo> {
        let (mut available, mut total) = if self.distributed {
            self.group.memory_snapshot(host_memory)
        } else {
            host_memory()
        };
        if let Some(limit) = self.mem_limit_bytes {
            available = available.min(limit);
            total = total.min(limit);
        }
        anyhow::ensure!(total > 0, "could not read host memory size");
        Ok(MemInfo {
            available_bytes: available / self.ranks(),
            total_bytes: total / self.ranks(),
        })
    }

    /// Kernels run synchronously on the calling thread
    fn synchronize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn barrier(&self) -> anyhow::Result<()> {
        if self.distributed {
            self.group.barrier();
        }
        Ok(())
    }

    fn empty_cache(&self) {
        trace!(rank = self.device.rank, "host allocator returns memory on drop");
    }

    fn rank(&self) -> usize {
        self.device.rank
    }

    fn world_size(&self) -> Option<usize> {
        self.distributed.then(|| self.group.world_size())
    }

    fn max_across_ranks(&self, value: usize) -> anyhow::Result<usize> {
        if !self.distributed {
            return Ok(value);
        }
        let max = self.group.all_reduce_max(self.device.rank, value as u64)?;
        Ok(max as usize)
    }

    fn destroy_process_group(&mut self) {
        self.distributed = false;
    }
}

/// Every operator the cpu backend implements. `world_size` sizes the collectives' buffers.
pub fn cpu_registry(world_size: usize) -> OpRegistry<CpuBackend> {
    let world_size = world_size.max(1);
    let mut registry = OpRegistry::new();
    for kind in [
        BinaryKind::Add,
        BinaryKind::Sub,
        BinaryKind::Mul,
        BinaryKind::Div,
    ] {
        registry.register(BinaryOp(kind));
    }
    for kind in [
        UnaryKind::Exp,
        UnaryKind::Sin,
        UnaryKind::Cos,
        UnaryKind::Gelu,
        UnaryKind::Silu,
    ] {
        registry.register(UnaryOp(kind));
    }
    registry
        .register(Softmax)
        .register(LayerNorm)
        .register(ReduceOp(ReduceKind::Sum))
        .register(ReduceOp(ReduceKind::Max))
        .register(Gemm)
        .register(BatchGemm);
    for kind in [
        CollectiveKind::AllReduce,
        CollectiveKind::AllGather,
        CollectiveKind::ReduceScatter,
        CollectiveKind::AllToAll,
        CollectiveKind::Broadcast,
        CollectiveKind::P2p,
    ] {
        registry.register(Collective { kind, world_size });
    }
    registry
        .register(Memcpy(MemcpyDirection::DeviceToHost))
        .register(Memcpy(MemcpyDirection::HostToDevice));
    registry
}
