//! Performance statistics collection for `--stats` output.

use std::time::{Duration, Instant};

use crate::solver::pcg::SolveSummary;
use crate::solver::pool::PoolStats;

/// Collects phase timings and per-solve counters.
///
/// Created when `--stats` is passed, threaded as `Option<&mut Stats>`.
pub struct Stats {
    total_start: Instant,
    phases: Vec<(&'static str, Duration)>,
    pub solves: u32,
    pub converged: u32,
    pub iterations_per_solve: Vec<usize>,
    pub operator_applies: usize,
    pub precon_applies: usize,
    pub reductions: u64,
    pub converted_solves: u32,
    pub solve_time: Duration,
    pub pool: Option<PoolStats>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_start: Instant::now(),
            phases: Vec::new(),
            solves: 0,
            converged: 0,
            iterations_per_solve: Vec::new(),
            operator_applies: 0,
            precon_applies: 0,
            reductions: 0,
            converted_solves: 0,
            solve_time: Duration::ZERO,
            pool: None,
        }
    }

    /// Record a completed phase with its duration.
    pub fn add_phase(&mut self, name: &'static str, duration: Duration) {
        self.phases.push((name, duration));
    }

    /// Fold one solve into the counters.
    pub fn record_solve(&mut self, summary: &SolveSummary) {
        self.solves += 1;
        if summary.converged {
            self.converged += 1;
        }
        self.iterations_per_solve.push(summary.iterations);
        self.operator_applies += summary.operator_applies;
        self.precon_applies += summary.precon_applies;
        self.reductions += u64::from(summary.reductions);
        if summary.precision_converted {
            self.converted_solves += 1;
        }
        self.solve_time += summary.elapsed;
    }

    /// Latest scratch pool counters; replaces any earlier snapshot.
    pub fn record_pool(&mut self, pool: PoolStats) {
        self.pool = Some(pool);
    }

    pub fn mean_iterations(&self) -> f64 {
        if self.iterations_per_solve.is_empty() {
            return 0.0;
        }
        self.iterations_per_solve.iter().sum::<usize>() as f64 / self.iterations_per_solve.len() as f64
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        let total = self.total_start.elapsed();
        eprintln!();
        eprintln!("=== flexcg Performance Stats ===");

        for (name, dur) in &self.phases {
            eprintln!("  {:<24} {:>8.3}s", name, dur.as_secs_f64());
        }

        if self.solves > 0 {
            eprintln!("  Solves:                 {} ({} converged)", self.solves, self.converged);
            eprintln!("    Solve time:           {:>8.3}s", self.solve_time.as_secs_f64());
            let iters_str: Vec<String> = self.iterations_per_solve.iter().map(|i| i.to_string()).collect();
            eprintln!("    CG iters:             {}", iters_str.join(" / "));
            eprintln!("    CG avg:               {:.1}", self.mean_iterations());
            eprintln!("    Operator applies:     {}", self.operator_applies);
            eprintln!("    Precon applies:       {}", self.precon_applies);
            eprintln!("    Global reductions:    {}", self.reductions);
            if self.converted_solves > 0 {
                eprintln!("    Precision-converted:  {}", self.converted_solves);
            }
        }

        if let Some(pool) = &self.pool {
            eprintln!(
                "  Scratch pool:           hits={}  misses={}  idle={}  elements={}",
                pool.hits, pool.misses, pool.idle, pool.elements
            );
        }

        eprintln!("  ─────────────────────────────────");
        eprintln!("  Total:                  {:>8.3}s", total.as_secs_f64());
    }
}
