use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use flexcg::solver::backend::{Device, HostDevice};
use flexcg::solver::comm::{CommunicationBackend, SingleProcessComm};
use flexcg::solver::comm_thread::ThreadComm;
use flexcg::solver::gpu::{GpuCsrOperator, GpuJacobi, GpuVector, WgpuDevice};
use flexcg::solver::operator::{DistributedOperator, Laplacian2d};
use flexcg::solver::partition::{BlockPartitioner, Partitioner, SubdomainMap};
use flexcg::solver::pool::PoolStats;
use flexcg::solver::preconditioner::{Identity, InnerCg, Jacobi};
use flexcg::solver::scalar::Scalar;
use flexcg::solver::sparse_direct::solve_sparse_lu;
use flexcg::solver::{operator_fn, Operator};
use flexcg::sparse::CsrMatrix;
use flexcg::stats::Stats;
use flexcg::{FlexcgError, Pcg, PcgConfig, Result, SolveSummary, StoppingCriterion, Variant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PreconKind {
    Identity,
    Jacobi,
    InnerCg,
}

/// Solve a screened Poisson problem on a 2-D grid with PCG / FPCG
#[derive(Parser)]
#[command(name = "flexcg", version)]
struct Cli {
    /// Grid points in x
    #[arg(long, default_value_t = 64)]
    nx: usize,

    /// Grid points in y
    #[arg(long, default_value_t = 64)]
    ny: usize,

    /// Helmholtz shift added to the diagonal
    #[arg(long, default_value_t = 0.0)]
    lambda: f64,

    /// Number of in-process ranks (threads)
    #[arg(long, default_value_t = 1)]
    ranks: usize,

    /// Solver settings file (TOML); flags below override it
    #[arg(long)]
    config: Option<String>,

    /// PCG or FPCG
    #[arg(long)]
    variant: Option<Variant>,

    /// ABS/REL-RHS-2NORM or ABS/REL-INITRESID
    #[arg(long)]
    criterion: Option<StoppingCriterion>,

    #[arg(long)]
    tol: Option<f64>,

    #[arg(long)]
    max_iter: Option<usize>,

    #[arg(long, value_enum, default_value_t = PreconKind::Jacobi)]
    precon: PreconKind,

    /// CG steps per application of the inner-CG preconditioner
    #[arg(long, default_value_t = 4)]
    inner_steps: usize,

    /// Run the preconditioner in f32 with an f64 outer solve
    #[arg(long)]
    mixed: bool,

    /// Solve on the GPU (single rank, f32)
    #[arg(long)]
    gpu: bool,

    /// Use the MPI world communicator instead of threads
    #[cfg(feature = "distributed")]
    #[arg(long)]
    mpi: bool,

    /// Log every iteration
    #[arg(long)]
    verbose: bool,

    /// Compare against a sparse direct solve
    #[arg(long)]
    verify: bool,

    /// Print performance stats to stderr
    #[arg(long)]
    stats: bool,
}

/// What one rank hands back after its solve.
struct RankResult {
    map: SubdomainMap,
    x_owned: Vec<f64>,
    summary: SolveSummary,
    pool: PoolStats,
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise --verbose shows the per-iteration lines.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.verbose { "info" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn build_config(cli: &Cli) -> Result<PcgConfig> {
    let mut config = match &cli.config {
        Some(path) => PcgConfig::load(path)?,
        None => PcgConfig::default(),
    };
    if let Some(v) = cli.variant {
        config.variant = v;
    }
    if let Some(c) = cli.criterion {
        config.stopping_criterion = c;
    }
    if let Some(tol) = cli.tol {
        config.tolerance = tol;
    }
    if let Some(max_iter) = cli.max_iter {
        config.max_iterations = max_iter;
    }
    config.verbose |= cli.verbose;
    if cli.precon == PreconKind::InnerCg && !config.variant.is_flexible() {
        tracing::warn!("inner-CG preconditioner varies between applications; using FPCG");
        config.variant = Variant::Flexible;
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: &Cli) -> Result<()> {
    let mut stats = if cli.stats { Some(Stats::new()) } else { None };
    let config = build_config(cli)?;

    let setup_start = Instant::now();
    let problem = Laplacian2d::new(cli.nx, cli.ny, cli.lambda);
    let a: CsrMatrix<f64> = problem.to_csr();
    let b = vec![1.0; problem.n()];
    if let Some(ref mut s) = stats {
        s.add_phase("Assembly", setup_start.elapsed());
    }

    #[cfg(feature = "distributed")]
    if cli.mpi {
        return run_mpi(cli, &config, &a, &b, stats.as_mut());
    }

    let solve_start = Instant::now();
    let (x, summaries, pools) = if cli.gpu {
        if cli.ranks != 1 {
            return Err(FlexcgError::Config("--gpu runs a single rank".into()));
        }
        let (x, summary, pool) = solve_gpu(cli, &config, &a, &b)?;
        (x, vec![summary], vec![pool])
    } else {
        solve_threads(cli, &config, &a, &b)?
    };
    if let Some(ref mut s) = stats {
        s.add_phase("Solve", solve_start.elapsed());
    }

    let summary = &summaries[0];
    report(&problem, &config, summary, cli.ranks);

    if cli.verify {
        verify(&a, &b, &x, stats.as_mut())?;
    }

    if let Some(ref mut s) = stats {
        for summary in &summaries {
            s.record_solve(summary);
        }
        if let Some(pool) = pools.first() {
            s.record_pool(*pool);
        }
        s.display();
    }
    Ok(())
}

fn report(problem: &Laplacian2d, config: &PcgConfig, summary: &SolveSummary, ranks: usize) {
    println!(
        "{} on {}x{} grid (lambda = {}), {} rank(s): {} iterations, residual {:.6e} (target {:.6e}), {}",
        config.variant,
        problem.nx,
        problem.ny,
        problem.lambda,
        ranks,
        summary.iterations,
        summary.residual_norm,
        summary.tolerance,
        if summary.converged { "converged" } else { "NOT converged" }
    );
}

fn verify(a: &CsrMatrix<f64>, b: &[f64], x: &[f64], stats: Option<&mut Stats>) -> Result<()> {
    let start = Instant::now();
    let reference = solve_sparse_lu(a, b)?;
    let max_err = x
        .iter()
        .zip(&reference)
        .map(|(xi, ri)| (xi - ri).abs())
        .fold(0.0, f64::max);
    let max_ref = reference.iter().map(|v| v.abs()).fold(0.0, f64::max);
    println!(
        "max |x - x_direct| = {:.3e} (relative {:.3e})",
        max_err,
        if max_ref > 0.0 { max_err / max_ref } else { max_err }
    );
    if let Some(s) = stats {
        s.add_phase("Direct solve", start.elapsed());
    }
    Ok(())
}

/// Run every rank on its own thread and gather the owned pieces of `x`.
fn solve_threads(
    cli: &Cli,
    config: &PcgConfig,
    a: &CsrMatrix<f64>,
    b: &[f64],
) -> Result<(Vec<f64>, Vec<SolveSummary>, Vec<PoolStats>)> {
    let ranks = cli.ranks.max(1);
    let parts = BlockPartitioner.partition(a, ranks);

    let results: Vec<Result<RankResult>> = if ranks == 1 {
        vec![solve_rank_in(cli, config, a, b, &parts, Arc::new(SingleProcessComm))]
    } else {
        std::thread::scope(|s| {
            let handles: Vec<_> = ThreadComm::group(ranks)
                .into_iter()
                .map(|comm| {
                    let parts = &parts;
                    s.spawn(move || solve_rank_in(cli, config, a, b, parts, Arc::new(comm)))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(FlexcgError::Solve("rank thread panicked".into())))
                })
                .collect()
        })
    };

    let mut x = vec![0.0; a.nrows];
    let mut summaries = Vec::with_capacity(ranks);
    let mut pools = Vec::with_capacity(ranks);
    for result in results {
        let result = result?;
        result.map.gather_into(&result.x_owned, &mut x);
        summaries.push(result.summary);
        pools.push(result.pool);
    }
    Ok((x, summaries, pools))
}

fn solve_rank_in(
    cli: &Cli,
    config: &PcgConfig,
    a: &CsrMatrix<f64>,
    b: &[f64],
    parts: &[usize],
    comm: Arc<dyn CommunicationBackend>,
) -> Result<RankResult> {
    if cli.mixed {
        solve_rank::<f32>(cli, config, a, b, parts, comm)
    } else {
        solve_rank::<f64>(cli, config, a, b, parts, comm)
    }
}

/// One rank's solve with an f64 outer iteration and `P` preconditioner.
fn solve_rank<P: Scalar>(
    cli: &Cli,
    config: &PcgConfig,
    a: &CsrMatrix<f64>,
    b: &[f64],
    parts: &[usize],
    comm: Arc<dyn CommunicationBackend>,
) -> Result<RankResult> {
    let rank = comm.rank();
    let map = SubdomainMap::build(a, parts, rank, 1);
    let mut op = DistributedOperator::new(a, map.clone(), comm.clone())?;
    let n = map.n_owned();
    let n_total = map.local_size();

    let mut precon: Box<dyn Operator<Vec<P>>> = match cli.precon {
        PreconKind::Identity => Box::new(Identity { n }),
        PreconKind::Jacobi => Box::new(Jacobi::<P>::from_matrix(op.local_matrix(), 1.0)?),
        PreconKind::InnerCg => {
            let inner = DistributedOperator::new(&a.cast::<P>(), map.clone(), comm.clone())?;
            Box::new(InnerCg::new(inner, n, n_total, cli.inner_steps, comm.clone()))
        }
    };

    let mut pcg = Pcg::new(n, map.n_halo(), HostDevice::<f64, P>::new(), comm, config.clone())?;
    let mut x = vec![0.0; n_total];
    let mut r = map.scatter(b);
    pcg.solve_with_config(&mut op, precon.as_mut(), &mut x, &mut r)?;

    let summary = pcg
        .last_solve()
        .cloned()
        .ok_or_else(|| FlexcgError::Solve("solve finished without a summary".into()))?;
    x.truncate(n);
    Ok(RankResult {
        map,
        x_owned: x,
        summary,
        pool: pcg.pool_stats(),
    })
}

fn solve_gpu(
    cli: &Cli,
    config: &PcgConfig,
    a: &CsrMatrix<f64>,
    b: &[f64],
) -> Result<(Vec<f64>, SolveSummary, PoolStats)> {
    let device = WgpuDevice::new()?;
    tracing::info!(device = %device.name(), "using GPU");
    let n = a.nrows;

    let mut op = GpuCsrOperator::new(&device, &a.cast::<f32>())?;
    let mut precon: Box<dyn Operator<GpuVector>> = match cli.precon {
        PreconKind::Identity => {
            let dev = device.clone();
            Box::new(operator_fn(move |input: &GpuVector, output: &mut GpuVector| {
                dev.axpy(n, 1.0, input, 0.0, output)
            }))
        }
        PreconKind::Jacobi => Box::new(GpuJacobi::from_matrix(&device, a, 1.0)?),
        PreconKind::InnerCg => {
            return Err(FlexcgError::Config("inner-CG preconditioner is host-only".into()));
        }
    };

    let b32: Vec<f32> = b.iter().map(|&v| v as f32).collect();
    let mut x = device.upload(&vec![0.0f32; n])?;
    let mut r = device.upload(&b32)?;
    let mut pcg = Pcg::new(n, 0, device.clone(), Arc::new(SingleProcessComm), config.clone())?;
    pcg.solve_with_config(&mut op, precon.as_mut(), &mut x, &mut r)?;

    let summary = pcg
        .last_solve()
        .cloned()
        .ok_or_else(|| FlexcgError::Solve("solve finished without a summary".into()))?;
    let x = device.download(&x)?.iter().map(|&v| f64::from(v)).collect();
    Ok((x, summary, pcg.pool_stats()))
}

#[cfg(feature = "distributed")]
fn run_mpi(
    cli: &Cli,
    config: &PcgConfig,
    a: &CsrMatrix<f64>,
    b: &[f64],
    stats: Option<&mut Stats>,
) -> Result<()> {
    use flexcg::solver::comm_mpi::MpiComm;

    let _universe = mpi::initialize()
        .ok_or_else(|| FlexcgError::Config("MPI initialization failed".into()))?;
    let comm: Arc<dyn CommunicationBackend> = Arc::new(MpiComm::new());
    let (rank, ranks) = (comm.rank(), comm.num_ranks());
    let parts = BlockPartitioner.partition(a, ranks);

    let result = solve_rank_in(cli, config, a, b, &parts, comm.clone())?;
    let x = result.map.assemble(&result.x_owned, a.nrows, comm.as_ref());
    if rank != 0 {
        return Ok(());
    }

    let problem = Laplacian2d::new(cli.nx, cli.ny, cli.lambda);
    report(&problem, config, &result.summary, ranks);
    let mut stats = stats;
    if cli.verify {
        verify(a, b, &x, stats.as_deref_mut())?;
    }
    if let Some(s) = stats {
        s.record_solve(&result.summary);
        s.record_pool(result.pool);
        s.display();
    }
    Ok(())
}
