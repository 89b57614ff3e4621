//! Run workload files against a backend and write one JSON report per workload.
//!
//! ```bash
//! microperf --workload workloads/gemm.json --workload workloads/add.json
//! microperf --workload workloads/allreduce.json --world-size 4 --report-dir out
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use microperf::prelude::*;
use microperf_cpu::{cpu_registry, CpuBackend, LocalGroup};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "microperf", version, about = "Operator microbenchmarks with adaptive timing")]
struct Args {
    /// Workload JSON file(s) to run, in order
    #[arg(long = "workload", required = true, num_args = 1..)]
    workloads: Vec<PathBuf>,

    /// Backend to benchmark on
    #[arg(long, default_value = "cpu")]
    backend: String,

    /// Rank threads for communication operators
    #[arg(long, default_value_t = 1)]
    world_size: usize,

    /// Cap on the memory the backend reports as available, in GiB
    #[arg(long)]
    mem_limit_gib: Option<f64>,

    /// Benchmark settings (JSON). Environment overrides apply on top.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Reports land in <report-dir>/<backend>/<operator>.json
    #[arg(long, default_value = "reports")]
    report_dir: PathBuf,

    /// tracing filter directives, e.g. `microperf=debug`
    #[arg(long)]
    log_filter: Option<String>,

    /// Mirror logs into this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut logging = microperf_tracing::subscriber();
    if let Some(filter) = &args.log_filter {
        logging = logging.env_filter(filter);
    }
    if let Some(path) = &args.log_file {
        logging = logging.log_file(path);
    }
    let _session = logging.init()?;

    if args.backend != "cpu" {
        bail!("unknown backend `{}` (available: cpu)", args.backend);
    }
    let config = match &args.config {
        Some(path) => BenchConfig::load(path)?,
        None => BenchConfig::default(),
    }
    .from_env()?;

    let mut hardware = cpu_backend(&args).hardware_info();
    hardware.peak_bandwidth_gbps = config.peak_bandwidth_gbps;

    for path in &args.workloads {
        let workload = Workload::load(path)?;
        let world_size = match OpClass::of(&workload.operator) {
            OpClass::Communication => args.world_size.max(1),
            OpClass::Computation => 1,
        };
        info!(
            workload = %path.display(),
            op = %workload.operator,
            cases = workload.cases().len(),
            world_size,
            "running workload"
        );

        let results = run_workload(&args, &config, &workload, world_size)?;
        let mut report = BenchReport::new(&args.backend, hardware.clone());
        for result in results {
            report.add_result(result);
        }
        report.print_summary();

        let out = report_path(&args.report_dir, &args.backend, &workload.operator);
        report.save(&out)?;
        info!(path = %out.display(), "report written");
    }
    Ok(())
}

fn cpu_backend(args: &Args) -> CpuBackend {
    apply_limit(CpuBackend::new(), args)
}

fn apply_limit(backend: CpuBackend, args: &Args) -> CpuBackend {
    match args.mem_limit_gib {
        Some(gib) => backend.with_memory_limit_gib(gib),
        None => backend,
    }
}

fn report_path(dir: &Path, backend: &str, operator: &str) -> PathBuf {
    dir.join(backend).join(format!("{operator}.json"))
}

/// Run every case of `workload`, one thread per rank. Returns rank 0's reports.
fn run_workload(
    args: &Args,
    config: &BenchConfig,
    workload: &Workload,
    world_size: usize,
) -> anyhow::Result<Vec<OpReport>> {
    if world_size == 1 {
        let engine = PerfEngine::new(cpu_backend(args), &cpu_registry(1), workload, config.clone())?;
        return Ok(engine.perf_workload(workload));
    }

    let group = LocalGroup::new(world_size);
    let registry = cpu_registry(world_size);
    // A rank that fails here must not leave its peers blocked on the group
    let engines = (0..world_size)
        .map(|rank| {
            let backend = apply_limit(CpuBackend::with_group(rank, group.clone()), args);
            PerfEngine::new(backend, &registry, workload, config.clone())
                .with_context(|| format!("rank {rank}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut per_rank = std::thread::scope(|s| {
        let handles: Vec<_> = engines
            .into_iter()
            .map(|engine| {
                s.spawn(move || -> anyhow::Result<Vec<OpReport>> {
                    let reports = engine.perf_workload(workload);
                    engine.into_backend().destroy_process_group();
                    Ok(reports)
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| {
                h.join()
                    .map_err(|_| anyhow::anyhow!("rank {rank} panicked"))
                    .and_then(|r| r)
            })
            .collect::<anyhow::Result<Vec<_>>>()
    })?;
    Ok(per_rank.swap_remove(0))
}
