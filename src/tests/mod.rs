use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::prelude::*;

const GIB: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Sync,
    Barrier,
    EmptyCache,
    /// Operator call against the tensor-set with this id
    Run(usize),
}

/// Shared recording of everything the engine did
#[derive(Default, Clone)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    live_tensors: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn runs(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Run(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: Event) -> usize {
        self.events().into_iter().filter(|e| *e == event).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn live_tensors(&self) -> usize {
        self.live_tensors.load(Ordering::SeqCst)
    }
}

pub struct MockTensor {
    pub id: usize,
    live: Arc<AtomicUsize>,
}

impl Drop for MockTensor {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockBackend {
    pub mem: MemInfo,
    pub world_size: Option<usize>,
    /// Iteration count a simulated peer rank planned
    pub peer_iterations: Option<usize>,
    pub recorder: Recorder,
}

impl MockBackend {
    pub fn with_available_gib(gib: f64) -> Self {
        let available_bytes = (gib * GIB as f64) as u64;
        Self {
            mem: MemInfo {
                available_bytes,
                total_bytes: available_bytes * 2,
            },
            world_size: None,
            peer_iterations: None,
            recorder: Recorder::default(),
        }
    }
}

impl Backend for MockBackend {
    type Tensor = MockTensor;
    type Device = Recorder;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn device_name(&self) -> String {
        "mock device".to_string()
    }

    fn device(&self) -> &Self::Device {
        &self.recorder
    }

    fn device_count(&self) -> usize {
        1
    }

    fn set_device(&mut self, index: usize) -> anyhow::Result<()> {
        anyhow::ensure!(index == 0, "mock has one device");
        Ok(())
    }

    fn mem_info(&self) -> anyhow::Result<MemInfo> {
        Ok(self.mem)
    }

    fn synchronize(&self) -> anyhow::Result<()> {
        self.recorder.push(Event::Sync);
        Ok(())
    }

    fn barrier(&self) -> anyhow::Result<()> {
        self.recorder.push(Event::Barrier);
        Ok(())
    }

    fn empty_cache(&self) {
        self.recorder.push(Event::EmptyCache);
    }

    fn world_size(&self) -> Option<usize> {
        self.world_size
    }

    fn max_across_ranks(&self, value: usize) -> anyhow::Result<usize> {
        Ok(self.peer_iterations.map_or(value, |peer| peer.max(value)))
    }
}

/// Operator with a fixed footprint whose calls are recorded
pub struct MockOp {
    pub name: &'static str,
    pub tensor_size: u64,
    pub fail_run: bool,
    pub fail_size: bool,
    pub call_time: Duration,
    next_id: AtomicUsize,
}

impl MockOp {
    pub fn new(name: &'static str, tensor_size: u64) -> Self {
        Self {
            name,
            tensor_size,
            fail_run: false,
            fail_size: false,
            call_time: Duration::ZERO,
            next_id: AtomicUsize::new(0),
        }
    }
}

impl Operator<MockBackend> for MockOp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn compute_size(&self, _: &[Vec<usize>], _: DType) -> anyhow::Result<ByteSizes> {
        anyhow::ensure!(!self.fail_size, "bad shapes");
        Ok(ByteSizes::io(1, self.tensor_size / 2, self.tensor_size - self.tensor_size / 2))
    }

    fn create_tensors(
        &self,
        _: &[Vec<usize>],
        _: DType,
        device: &Recorder,
    ) -> anyhow::Result<TensorSet<MockBackend>> {
        device.live_tensors.fetch_add(1, Ordering::SeqCst);
        Ok(vec![MockTensor {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            live: device.live_tensors.clone(),
        }])
    }

    fn run(&self, backend: &MockBackend, tensors: &mut [MockTensor]) -> anyhow::Result<()> {
        backend.recorder.push(Event::Run(tensors[0].id));
        if !self.call_time.is_zero() {
            std::thread::sleep(self.call_time);
        }
        anyhow::ensure!(!self.fail_run, "kernel launch failed");
        Ok(())
    }
}

fn engine(
    op: MockOp,
    backend: MockBackend,
    iterations: usize,
    config: BenchConfig,
) -> PerfEngine<MockBackend> {
    let name = op.name;
    let mut registry = OpRegistry::new();
    registry.register(op);
    let workload = Workload::new(name, iterations)
        .with_shapes(vec![vec![1]])
        .with_dtype(DType::F32);
    PerfEngine::new(backend, &registry, &workload, config).unwrap()
}

fn shapes() -> Vec<Vec<usize>> {
    vec![vec![1]]
}

#[test]
fn memory_limit_is_floored_to_gib() {
    let e = engine(
        MockOp::new("add", 16),
        MockBackend::with_available_gib(10.7),
        10,
        BenchConfig::default(),
    );
    assert_eq!(e.provisioner().memory_limit_gib, 10);
}

#[test]
fn unknown_operator_is_rejected_up_front() {
    let registry = OpRegistry::<MockBackend>::new();
    let workload = Workload::new("conv", 10)
        .with_shapes(vec![vec![1]])
        .with_dtype(DType::F32);
    let res = PerfEngine::new(
        MockBackend::with_available_gib(1.0),
        &registry,
        &workload,
        BenchConfig::default(),
    );
    assert!(res.is_err());
}

#[test]
fn oversized_workload_reports_oom_without_running() {
    let e = engine(
        MockOp::new("gemm", 10 * GIB),
        MockBackend::with_available_gib(10.0),
        100,
        BenchConfig::default(),
    );
    let report = e.perf(&shapes(), DType::F32);
    assert_eq!(report.error, "OOM");
    assert_eq!(report.latency_us, 0.0);
    let rec = &e.backend().recorder;
    assert!(rec.runs().is_empty());
    assert_eq!(rec.count(Event::EmptyCache), 1);
    assert_eq!(rec.live_tensors(), 0);
}

#[test]
fn communication_ops_get_one_tensor_set() {
    let e = engine(
        MockOp::new("allreduce", 1024),
        MockBackend::with_available_gib(10.0),
        100,
        BenchConfig::default(),
    );
    let (_, pool) = e.build_tensors(&shapes(), DType::F32).unwrap();
    assert_eq!(pool.len(), 1);
}

#[test]
fn computation_pool_capped_by_iterations() {
    let e = engine(
        MockOp::new("exp", 1024),
        MockBackend::with_available_gib(4.0),
        7,
        BenchConfig::default(),
    );
    let (sizes, pool) = e.build_tensors(&shapes(), DType::F32).unwrap();
    assert_eq!(sizes.tensor_size(), 1024);
    assert_eq!(pool.len(), 7);
    drop(pool);
    assert_eq!(e.backend().recorder.live_tensors(), 0);
}

#[test]
fn core_perf_cycles_pool_between_sync_points() {
    let e = engine(
        MockOp::new("add", 1024),
        MockBackend::with_available_gib(4.0),
        3,
        BenchConfig::default(),
    );
    let (_, mut pool) = e.build_tensors(&shapes(), DType::F32).unwrap();
    assert_eq!(pool.len(), 3);
    let rec = e.backend().recorder.clone();
    rec.clear();

    let latency = e.core_perf(7, &mut pool).unwrap();
    assert!(latency >= 0.0);
    assert_eq!(rec.runs(), vec![0, 1, 2, 0, 1, 2, 0]);

    let events = rec.events();
    assert_eq!(&events[..2], &[Event::Sync, Event::Barrier]);
    assert_eq!(&events[events.len() - 2..], &[Event::Sync, Event::Barrier]);
}

#[test]
fn failing_operator_reports_run_op_error_and_releases_pool() {
    let mut op = MockOp::new("mul", 1024);
    op.fail_run = true;
    let e = engine(op, MockBackend::with_available_gib(4.0), 50, BenchConfig::default());
    let report = e.perf(&shapes(), DType::F32);
    assert_eq!(report.error, "RUN_OP_ERROR");
    assert_eq!(report.latency_us, 0.0);
    assert!(report.sizes.is_some());
    let rec = &e.backend().recorder;
    assert_eq!(rec.live_tensors(), 0);
    assert_eq!(rec.count(Event::EmptyCache), 1);
    // Failed on the first warm-up call
    assert_eq!(rec.runs().len(), 1);
}

#[test]
fn size_function_failure_is_a_run_error() {
    let mut op = MockOp::new("sub", 1024);
    op.fail_size = true;
    let e = engine(op, MockBackend::with_available_gib(4.0), 50, BenchConfig::default());
    let report = e.perf(&shapes(), DType::F32);
    assert_eq!(report.error, "RUN_OP_ERROR");
    assert_eq!(report.sizes, None);
    assert_eq!(report.metrics, None);
}

#[test]
fn fast_operator_runs_requested_iterations() {
    let e = engine(
        MockOp::new("add", 1024),
        MockBackend::with_available_gib(4.0),
        20,
        BenchConfig::default(),
    );
    let report = e.perf(&shapes(), DType::F32);
    assert!(report.is_success());
    assert!(report.latency_us >= 0.0);
    // 5 warm-up + 5 calibration + 20 timed
    assert_eq!(e.backend().recorder.runs().len(), 30);
    assert_eq!(e.backend().recorder.live_tensors(), 0);
}

#[test]
fn over_budget_operator_runs_twice() {
    let mut op = MockOp::new("gemm", 1024);
    op.call_time = Duration::from_millis(20);
    let config = BenchConfig {
        warmup_iterations: 0,
        calibration_iterations: 1,
        max_total_duration_secs: 0.005,
        ..Default::default()
    };
    let e = engine(op, MockBackend::with_available_gib(4.0), 1000, config);
    let report = e.perf(&shapes(), DType::F32);
    assert!(report.is_success());
    assert!(report.latency_us >= 20_000.0);
    assert_eq!(e.backend().recorder.runs().len(), 1 + 2);
}

#[test]
fn world_size_flows_into_report() {
    let mut backend = MockBackend::with_available_gib(4.0);
    backend.world_size = Some(4);
    let e = engine(MockOp::new("allgather", 1024), backend, 10, BenchConfig::default());
    let report = e.perf(&shapes(), DType::F32);
    assert_eq!(report.world_size, Some(4));
    assert!(matches!(
        report.metrics,
        Some(OpMetrics::Communication { group: 4, .. })
    ));
}

#[test]
fn timed_pass_uses_the_largest_plan_across_ranks() {
    let mut op = MockOp::new("allreduce", 1024);
    op.call_time = Duration::from_millis(20);
    let config = BenchConfig {
        warmup_iterations: 0,
        calibration_iterations: 1,
        max_total_duration_secs: 0.005,
        ..Default::default()
    };
    let mut backend = MockBackend::with_available_gib(4.0);
    backend.world_size = Some(2);
    // this rank alone would plan 2 timed calls
    backend.peer_iterations = Some(4);
    let e = engine(op, backend, 1000, config);
    let report = e.perf(&shapes(), DType::F32);
    assert!(report.is_success(), "{}", report.error);
    assert_eq!(e.backend().recorder.runs().len(), 1 + 4);
}

#[test]
fn smaller_peer_plan_does_not_shrink_the_timed_pass() {
    let mut backend = MockBackend::with_available_gib(4.0);
    backend.peer_iterations = Some(1);
    let e = engine(MockOp::new("add", 1024), backend, 20, BenchConfig::default());
    assert!(e.perf(&shapes(), DType::F32).is_success());
    assert_eq!(e.backend().recorder.runs().len(), 5 + 5 + 20);
}
