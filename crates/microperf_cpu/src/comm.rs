//! Communication operators over an in-process [`LocalGroup`](crate::LocalGroup).
//!
//! The first input shape is the message size. Collectives exchange f32; other dtypes are
//! converted on the way in and out.

use std::borrow::Cow;

use anyhow::{bail, ensure};
use microperf::prelude::*;

use crate::{
    tensor::{CpuTensor, TensorData},
    CpuBackend, CpuDevice,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveKind {
    AllReduce,
    AllGather,
    ReduceScatter,
    AllToAll,
    Broadcast,
    P2p,
}

/// A collective across `world_size` ranks
#[derive(Debug)]
pub struct Collective {
    pub kind: CollectiveKind,
    pub world_size: usize,
}

fn message(op: &str, shapes: &[Vec<usize>]) -> anyhow::Result<(usize, usize)> {
    let Some(shape) = shapes.first() else {
        bail!("{op} expects an input shape");
    };
    ensure!(!shape.is_empty(), "{op} input shape must have at least one dimension");
    Ok((shape[0], numel(shape)))
}

fn read_f32(t: &CpuTensor) -> Cow<'_, [f32]> {
    match &t.data {
        TensorData::F32(v) => Cow::Borrowed(v),
        _ => Cow::Owned(t.to_f32_vec()),
    }
}

fn write_f32(
    t: &mut CpuTensor,
    f: impl FnOnce(&mut [f32]) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    if let TensorData::F32(v) = &mut t.data {
        return f(v);
    }
    let mut buf = t.to_f32_vec();
    f(&mut buf)?;
    t.assign_f32(&buf)
}

impl Collective {
    /// Element counts of the (input, output) buffers for an n-element message, `None` when the
    /// collective works in place
    fn buffers(&self, n: usize) -> anyhow::Result<(usize, Option<usize>)> {
        let w = self.world_size.max(1);
        let split = || -> anyhow::Result<usize> {
            ensure!(
                n % w == 0,
                "{} needs a message size divisible by the world size ({n} % {w} != 0)",
                self.name_str()
            );
            Ok(n / w)
        };
        Ok(match self.kind {
            CollectiveKind::AllReduce | CollectiveKind::Broadcast => (n, None),
            CollectiveKind::AllGather => (split()?, Some(n)),
            CollectiveKind::ReduceScatter => (n, Some(split()?)),
            CollectiveKind::AllToAll => {
                split()?;
                (n, Some(n))
            }
            CollectiveKind::P2p => (n, Some(n)),
        })
    }

    fn name_str(&self) -> &'static str {
        match self.kind {
            CollectiveKind::AllReduce => "allreduce",
            CollectiveKind::AllGather => "allgather",
            CollectiveKind::ReduceScatter => "reducescatter",
            CollectiveKind::AllToAll => "alltoall",
            CollectiveKind::Broadcast => "broadcast",
            CollectiveKind::P2p => "p2p",
        }
    }
}

impl Operator<CpuBackend> for Collective {
    fn name(&self) -> &'static str {
        self.name_str()
    }

    fn compute_size(&self, shapes: &[Vec<usize>], dtype: DType) -> anyhow::Result<ByteSizes> {
        let (batch_size, n) = message(self.name(), shapes)?;
        let (input, output) = self.buffers(n)?;
        let ds = dtype.sizeof() as u64;
        let read = (input as u64).saturating_mul(ds);
        let write = (output.unwrap_or(input) as u64).saturating_mul(ds);
        let resident = (input.saturating_add(output.unwrap_or(0)) as u64).saturating_mul(ds);
        Ok(ByteSizes::io(batch_size, read, write).with_tensor_size(resident))
    }

    fn create_tensors(
        &self,
        shapes: &[Vec<usize>],
        dtype: DType,
        _device: &CpuDevice,
    ) -> anyhow::Result<Vec<CpuTensor>> {
        let (_, n) = message(self.name(), shapes)?;
        let (input, output) = self.buffers(n)?;
        let mut tensors = vec![CpuTensor::random(&[input], dtype)?];
        if let Some(output) = output {
            tensors.push(CpuTensor::zeros(&[output], dtype)?);
        }
        Ok(tensors)
    }

    fn run(&self, backend: &CpuBackend, tensors: &mut [CpuTensor]) -> anyhow::Result<()> {
        let group = backend.group();
        let rank = backend.rank();
        match (self.kind, tensors) {
            (CollectiveKind::AllReduce, [buf]) => {
                write_f32(buf, |b| group.all_reduce(rank, b))
            }
            (CollectiveKind::Broadcast, [buf]) => {
                write_f32(buf, |b| group.broadcast(rank, 0, b))
            }
            (kind, [input, output]) => {
                let input = read_f32(input);
                write_f32(output, |out| match kind {
                    CollectiveKind::AllGather => group.all_gather(rank, &input, out),
                    CollectiveKind::ReduceScatter => group.reduce_scatter(rank, &input, out),
                    CollectiveKind::AllToAll => group.all_to_all(rank, &input, out),
                    CollectiveKind::P2p => group.send_recv(rank, &input, out),
                    _ => bail!("{} does not take separate output buffers", self.name()),
                })
            }
            (_, tensors) => bail!(
                "{} got {} tensors, which does not match its buffer layout",
                self.name(),
                tensors.len()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemcpyDirection {
    DeviceToHost,
    HostToDevice,
}

/// Copy between device and host memory; both live in host RAM on this backend
#[derive(Debug)]
pub struct Memcpy(pub MemcpyDirection);

impl Operator<CpuBackend> for Memcpy {
    fn name(&self) -> &'static str {
        match self.0 {
            MemcpyDirection::DeviceToHost => "device2host",
            MemcpyDirection::HostToDevice => "host2device",
        }
    }

    fn compute_size(&self, shapes: &[Vec<usize>], dtype: DType) -> anyhow::Result<ByteSizes> {
        let (batch_size, n) = message(self.name(), shapes)?;
        let bytes = (n as u64).saturating_mul(dtype.sizeof() as u64);
        Ok(ByteSizes::io(batch_size, bytes, bytes))
    }

    fn create_tensors(
        &self,
        shapes: &[Vec<usize>],
        dtype: DType,
        _device: &CpuDevice,
    ) -> anyhow::Result<Vec<CpuTensor>> {
        Ok(vec![
            CpuTensor::random(&shapes[0], dtype)?,
            CpuTensor::zeros(&shapes[0], dtype)?,
        ])
    }

    fn run(&self, _backend: &CpuBackend, tensors: &mut [CpuTensor]) -> anyhow::Result<()> {
        let [src, dst] = tensors else {
            bail!("{} expects 2 tensors", self.name());
        };
        dst.copy_from(src)
    }
}
