//! Decides how many independent tensor-sets to pre-allocate for the timed loop.
//!
//! The timed loop cycles through distinct tensor-sets so repeated calls do not hit a warm cache.
//! The pool is bounded by a memory budget and by the number of calls that will actually be made.

use tracing::debug;

use crate::{
    backend::Backend,
    config::BenchConfig,
    op::{ByteSizes, DType, OpClass, Operator, TensorSet},
};

const GIB: f64 = (1u64 << 30) as f64;

/// Memory and pool-size policy for one engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Provisioner {
    /// Available device memory floored to whole GiB
    pub memory_limit_gib: u64,
    pub memory_headroom: f64,
    pub assume_cache_bytes: u64,
    /// Requested iteration count of the workload
    pub iterations: usize,
}

impl Provisioner {
    pub fn new(memory_limit_gib: u64, iterations: usize, config: &BenchConfig) -> Self {
        Self {
            memory_limit_gib,
            memory_headroom: config.memory_headroom,
            assume_cache_bytes: config.assume_cache_bytes,
            iterations,
        }
    }

    /// Bytes we allow ourselves to provision
    pub fn assume_avail_bytes(&self) -> f64 {
        self.memory_limit_gib as f64 * self.memory_headroom * GIB
    }

    /// Number of tensor-sets to build. Zero means not even one fits.
    pub fn pool_size(&self, class: OpClass, tensor_size: u64) -> usize {
        let avail = self.assume_avail_bytes();
        let size = tensor_size as f64;
        if size > avail {
            return 0;
        }
        match class {
            // Ranks must see identical inputs, so never double-buffer
            OpClass::Communication => 1,
            OpClass::Computation => {
                if 2.0 * size > avail {
                    1
                } else if tensor_size > self.assume_cache_bytes {
                    2
                } else if tensor_size == 0 {
                    self.iterations
                } else {
                    ((avail / size).floor().min(self.iterations as f64) as usize).max(1)
                }
            }
        }
    }

    /// Compute the operator's byte sizes and build its tensor pool.
    ///
    /// An empty pool signals that the working set does not fit.
    #[tracing::instrument(skip_all, fields(op = op.name(), %dtype))]
    pub fn build<B: Backend>(
        &self,
        op: &dyn Operator<B>,
        input_shapes: &[Vec<usize>],
        dtype: DType,
        device: &B::Device,
    ) -> anyhow::Result<(ByteSizes, Vec<TensorSet<B>>)> {
        let sizes = op.compute_size(input_shapes, dtype)?;
        let max_data_cnt = self.pool_size(OpClass::of(op.name()), sizes.tensor_size());
        debug!(
            tensor_size = sizes.tensor_size(),
            assume_avail_bytes = self.assume_avail_bytes(),
            max_data_cnt,
            "provisioning tensor pool"
        );
        let pool = (0..max_data_cnt)
            .map(|_| op.create_tensors(input_shapes, dtype, device))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok((sizes, pool))
    }
}
