//! Adaptive benchmarking of one operator on one backend.
//!
//! Each [`PerfEngine::perf`] call goes through:
//! provision -> (OOM | warm-up -> calibrate -> timed pass) -> cleanup -> report.
//! Cleanup (dropping the pool, emptying the device cache) runs on every path.

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::{
    backend::Backend,
    config::BenchConfig,
    op::{ByteSizes, DType, Operator, TensorSet},
    plan::Calibration,
    provision::Provisioner,
    registry::OpRegistry,
    report::{OpReport, PerfOutcome},
    workload::Workload,
};

pub struct PerfEngine<B: Backend> {
    backend: B,
    op: Arc<dyn Operator<B>>,
    iterations: usize,
    config: BenchConfig,
    provisioner: Provisioner,
}

impl<B: Backend> PerfEngine<B> {
    /// Look up the workload's operator and derive the memory budget from the backend
    pub fn new(
        backend: B,
        registry: &OpRegistry<B>,
        workload: &Workload,
        config: BenchConfig,
    ) -> anyhow::Result<Self> {
        workload.validate()?;
        config.validate()?;
        let op = registry
            .get(&workload.operator)
            .with_context(|| format!("on backend `{}`", backend.name()))?;
        let mem = backend.mem_info()?;
        let memory_limit_gib = mem.memory_limit_gib();
        info!(
            backend = backend.name(),
            device = %backend.device_name(),
            available_bytes = mem.available_bytes,
            total_bytes = mem.total_bytes,
            memory_limit_gib,
            "engine ready for `{}`",
            workload.operator
        );
        Ok(Self {
            provisioner: Provisioner::new(memory_limit_gib, workload.iterations, &config),
            backend,
            op,
            iterations: workload.iterations,
            config,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    pub fn op_name(&self) -> &'static str {
        self.op.name()
    }

    /// Build the tensor pool for one invocation (empty when it does not fit)
    pub fn build_tensors(
        &self,
        input_shapes: &[Vec<usize>],
        dtype: DType,
    ) -> anyhow::Result<(ByteSizes, Vec<TensorSet<B>>)> {
        self.provisioner
            .build(self.op.as_ref(), input_shapes, dtype, self.backend.device())
    }

    fn sync_all(&self) -> anyhow::Result<()> {
        self.backend.synchronize()?;
        self.backend.barrier()
    }

    fn run_random(&self, pool: &mut [TensorSet<B>], rng: &mut impl Rng) -> anyhow::Result<()> {
        let slot = rng.random_range(0..pool.len());
        self.op.run(&self.backend, &mut pool[slot])
    }

    /// Untimed calls against random slots, to trigger lazy initialization
    #[tracing::instrument(skip_all)]
    pub fn warmup(&self, pool: &mut [TensorSet<B>]) -> anyhow::Result<()> {
        let mut rng = rand::rng();
        self.sync_all()?;
        for _ in 0..self.config.warmup_iterations {
            self.run_random(pool, &mut rng)?;
        }
        Ok(())
    }

    /// Time a few calls against random slots to estimate per-call cost
    #[tracing::instrument(skip_all)]
    pub fn calibrate(&self, pool: &mut [TensorSet<B>]) -> anyhow::Result<Calibration> {
        let mut rng = rand::rng();
        let calls = self.config.calibration_iterations;
        self.sync_all()?;
        let start = Instant::now();
        for _ in 0..calls {
            self.run_random(pool, &mut rng)?;
        }
        self.sync_all()?;
        let elapsed = start.elapsed();
        Ok(Calibration { elapsed, calls })
    }

    /// Run `prefer_iterations` calls cycling through the pool, bounded by synchronize + barrier
    /// on both sides. Returns average microseconds per call.
    #[tracing::instrument(skip(self, pool))]
    pub fn core_perf(
        &self,
        prefer_iterations: usize,
        pool: &mut [TensorSet<B>],
    ) -> anyhow::Result<f64> {
        anyhow::ensure!(!pool.is_empty(), "cannot time an empty tensor pool");
        anyhow::ensure!(prefer_iterations > 0, "need at least one timed iteration");
        let n_slots = pool.len();
        self.sync_all()?;
        let start = Instant::now();
        for i in 0..prefer_iterations {
            self.op.run(&self.backend, &mut pool[i % n_slots])?;
        }
        self.sync_all()?;
        let elapsed = start.elapsed();
        Ok(elapsed.as_nanos() as f64 / 1e3 / prefer_iterations as f64)
    }

    fn measure(&self, pool: &mut [TensorSet<B>]) -> anyhow::Result<f64> {
        self.warmup(pool)?;
        let calibration = self.calibrate(pool)?;
        let local_iterations = calibration.plan(self.iterations, self.config.max_total_duration());
        // every rank must issue the same number of calls inside the timed window
        let prefer_iterations = self.backend.max_across_ranks(local_iterations)?;
        debug!(
            avg_op_duration = calibration.avg_op_duration(),
            local_iterations,
            prefer_iterations,
            "calibrated"
        );
        self.core_perf(prefer_iterations, pool)
    }

    /// Provision, calibrate, time and release. Never fails: errors end up in the outcome.
    #[tracing::instrument(skip_all, fields(op = self.op.name(), %dtype))]
    pub fn run_case(
        &self,
        input_shapes: &[Vec<usize>],
        dtype: DType,
    ) -> (Option<ByteSizes>, PerfOutcome) {
        let (sizes, outcome) = match self.build_tensors(input_shapes, dtype) {
            Ok((sizes, pool)) if pool.is_empty() => {
                warn!(tensor_size = sizes.tensor_size(), "tensors do not fit in device memory");
                (Some(sizes), PerfOutcome::OutOfMemory)
            }
            Ok((sizes, mut pool)) => {
                let outcome = match self.measure(&mut pool) {
                    Ok(latency) => PerfOutcome::Success {
                        latency_us: (latency * 100.0).round() / 100.0,
                    },
                    Err(e) => {
                        error!("{:?}", e);
                        PerfOutcome::ExecutionError {
                            details: format!("{e:#}"),
                        }
                    }
                };
                drop(pool);
                (Some(sizes), outcome)
            }
            Err(e) => {
                error!("{:?}", e);
                (
                    None,
                    PerfOutcome::ExecutionError {
                        details: format!("{e:#}"),
                    },
                )
            }
        };
        self.backend.empty_cache();
        (sizes, outcome)
    }

    /// Benchmark one (shapes, dtype) combination and emit its report
    pub fn perf(&self, input_shapes: &[Vec<usize>], dtype: DType) -> OpReport {
        let (sizes, outcome) = self.run_case(input_shapes, dtype);
        let report = OpReport::new(
            self.op.name(),
            dtype,
            input_shapes,
            sizes,
            self.backend.world_size(),
            self.config.peak_bandwidth_gbps,
            &outcome,
        );
        info!(
            op = self.op.name(),
            %dtype,
            shapes = ?input_shapes,
            latency_us = report.latency_us,
            error = %report.error,
            "perf done"
        );
        report
    }

    /// Run every case of a workload in order
    pub fn perf_workload(&self, workload: &Workload) -> Vec<OpReport> {
        workload
            .cases()
            .iter()
            .map(|case| self.perf(&case.input_shapes, case.dtype))
            .collect()
    }
}
