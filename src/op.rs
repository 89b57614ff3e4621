use std::{fmt::Display, str::FromStr};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::backend::Backend;

/// Operators that move data between ranks or memory spaces.
///
/// They share one tensor-set across every timed call, since the inputs must be identical on all
/// ranks. Report emission branches on the same list.
pub const COMMUNICATION_OPS: &[&str] = &[
    "allreduce",
    "allgather",
    "reducescatter",
    "alltoall",
    "broadcast",
    "p2p",
    "device2host",
    "host2device",
    "hash_table",
];

/// Supported element dtypes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DType {
    /// 32-bit float (8e23m)
    #[default]
    F32,
    /// 16-bit float (5e10m)
    F16,
    /// 16-bit float (8e7m)
    Bf16,
    /// 32-bit integer
    I32,
    /// 8-bit integer
    I8,
}

impl DType {
    pub fn sizeof(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::Bf16 | DType::F16 => 2,
            DType::I8 => 1,
        }
    }

    /// Canonical (torch-style) name used in workloads and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::Bf16 => "bfloat16",
            DType::I32 => "int32",
            DType::I8 => "int8",
        }
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "float32" | "fp32" | "f32" | "float" => DType::F32,
            "float16" | "fp16" | "f16" | "half" => DType::F16,
            "bfloat16" | "bf16" => DType::Bf16,
            "int32" | "i32" | "int" => DType::I32,
            "int8" | "i8" => DType::I8,
            other => bail!("unknown dtype `{other}`"),
        })
    }
}

impl TryFrom<String> for DType {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DType> for String {
    fn from(value: DType) -> Self {
        value.as_str().to_string()
    }
}

/// Fixed partition of operator names
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpClass {
    /// Collective / data-movement primitives
    Communication,
    /// Local compute kernels
    Computation,
}

impl OpClass {
    pub fn of(op_name: &str) -> Self {
        if COMMUNICATION_OPS.contains(&op_name) {
            OpClass::Communication
        } else {
            OpClass::Computation
        }
    }
}

/// Byte accounting reported by an operator's size function.
///
/// `tensor_size` is the working-set footprint used for provisioning. It is `rw_bytes` unless an
/// operator overrides it (in-place ops, outputs that alias inputs, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteSizes {
    pub batch_size: usize,
    pub rw_bytes: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    tensor_size: Option<u64>,
}

impl ByteSizes {
    pub fn new(batch_size: usize, rw_bytes: u64, read_bytes: u64, write_bytes: u64) -> Self {
        Self {
            batch_size,
            rw_bytes,
            read_bytes,
            write_bytes,
            tensor_size: None,
        }
    }

    /// Shorthand where read-write bytes are simply read + write
    pub fn io(batch_size: usize, read_bytes: u64, write_bytes: u64) -> Self {
        Self::new(
            batch_size,
            read_bytes.saturating_add(write_bytes),
            read_bytes,
            write_bytes,
        )
    }

    pub fn with_tensor_size(mut self, tensor_size: u64) -> Self {
        self.tensor_size = Some(tensor_size);
        self
    }

    pub fn tensor_size(&self) -> u64 {
        self.tensor_size.unwrap_or(self.rw_bytes)
    }
}

/// One complete set of positional arguments for a single operator call
pub type TensorSet<B> = Vec<<B as Backend>::Tensor>;

/// An operator that can be benchmarked on backend `B`.
///
/// The registry holds these as trait objects, so the trait stays dyn-compatible.
pub trait Operator<B: Backend>: Send + Sync {
    /// Operator name (used for lookup and in reports)
    fn name(&self) -> &'static str;

    /// Byte accounting for one call with the given input shapes
    fn compute_size(&self, input_shapes: &[Vec<usize>], dtype: DType) -> anyhow::Result<ByteSizes>;

    /// Build one independent tensor-set (inputs and any preallocated outputs)
    fn create_tensors(
        &self,
        input_shapes: &[Vec<usize>],
        dtype: DType,
        device: &B::Device,
    ) -> anyhow::Result<TensorSet<B>>;

    /// Execute the operator once against a tensor-set
    fn run(&self, backend: &B, tensors: &mut [B::Tensor]) -> anyhow::Result<()>;
}

/// Number of elements described by a shape, saturating at `usize::MAX`
pub fn numel(shape: &[usize]) -> usize {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .unwrap_or(usize::MAX)
}
