//! Performance statistics collection for `--stats` output.

use std::time::{Duration, Instant};

use crate::solver::newton::SolveOutcome;

/// Collects solver counters and phase timings.
///
/// Created when `--stats` is passed, threaded as `Option<&mut Stats>`.
/// Zero cost when `None`: no timing calls, no counter increments.
pub struct Stats {
    total_start: Instant,
    phases: Vec<(&'static str, Duration)>,
    // Nonlinear solves
    pub newton_iterations: u32,
    pub function_evals: u32,
    pub nonlinear_solves: u32,
    pub divergences: u32,
    // Operating point
    pub ramp_steps: u32,
    pub gmin_stages: u32,
    // Sweep
    pub sweep_points: u32,
    // Transient
    pub timesteps_accepted: u32,
    pub timesteps_rejected: u32,
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
            newton_iterations: 0,
            function_evals: 0,
            nonlinear_solves: 0,
            divergences: 0,
            ramp_steps: 0,
            gmin_stages: 0,
            sweep_points: 0,
            timesteps_accepted: 0,
            timesteps_rejected: 0,
        }
    }

    /// Record a completed phase with its duration.
    pub fn add_phase(&mut self, name: &'static str, duration: Duration) {
        self.phases.push((name, duration));
    }

    pub fn phases(&self) -> &[(&'static str, Duration)] {
        &self.phases
    }

    /// Count one nonlinear solve and its outcome.
    pub fn record_solve(&mut self, outcome: &SolveOutcome) {
        self.nonlinear_solves += 1;
        self.newton_iterations += outcome.iterations as u32;
        self.function_evals += outcome.function_evals as u32;
        if outcome.verdict.is_diverged() {
            self.divergences += 1;
        }
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        let total = self.total_start.elapsed();
        eprintln!();
        eprintln!("=== mixsolve stats ===");

        for (name, dur) in &self.phases {
            eprintln!("  {:<24} {:>8.3}s", name, dur.as_secs_f64());
        }

        if self.nonlinear_solves > 0 {
            eprintln!("  Nonlinear solves:       {}", self.nonlinear_solves);
            eprintln!("    Newton iterations:    {}", self.newton_iterations);
            eprintln!("    Function evals:       {}", self.function_evals);
            eprintln!("    Diverged:             {}", self.divergences);
        }

        if self.ramp_steps > 0 || self.gmin_stages > 0 {
            eprintln!("  Ramp steps:             {}  gmin stages={}", self.ramp_steps, self.gmin_stages);
        }

        if self.sweep_points > 0 {
            eprintln!("  Sweep points:           {}", self.sweep_points);
        }

        if self.timesteps_accepted > 0 || self.timesteps_rejected > 0 {
            eprintln!("  Timesteps:              accepted={}  rejected={}", self.timesteps_accepted, self.timesteps_rejected);
        }

        eprintln!("  ─────────────────────────────────");
        eprintln!("  Total:                  {:>8.3}s", total.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::convergence::Verdict;

    #[test]
    fn solves_accumulate_counters() {
        let mut stats = Stats::new();
        stats.record_solve(&SolveOutcome {
            verdict: Verdict::ConvergedAbsolute,
            iterations: 3,
            function_evals: 4,
        });
        stats.record_solve(&SolveOutcome {
            verdict: Verdict::DivergedIterationLimit,
            iterations: 30,
            function_evals: 31,
        });
        assert_eq!(stats.nonlinear_solves, 2);
        assert_eq!(stats.newton_iterations, 33);
        assert_eq!(stats.function_evals, 35);
        assert_eq!(stats.divergences, 1);
    }
}
