//! Explicit analysis state shared by the continuation controllers.
//!
//! Replaces process-wide solver state: each controller receives the context
//! by `&mut` and the coupled system receives a copy of [`TimeState`] before
//! every nonlinear solve.

use crate::config::{IntegrationScheme, SolverSettings};

/// Time-stepping state seen by the device and circuit during one solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeState {
    pub clock: f64,
    pub dt: f64,
    pub dt_last: f64,
    pub dt_last_last: f64,
    /// False during DC phases; time-derivative terms vanish.
    pub time_dependent: bool,
    pub scheme: IntegrationScheme,
    /// First step of a BDF2 run uses BDF1 coefficients.
    pub bdf2_restart: bool,
}

impl TimeState {
    /// Static state for DC phases.
    pub fn steady(clock: f64) -> Self {
        Self {
            clock,
            dt: f64::INFINITY,
            dt_last: f64::INFINITY,
            dt_last_last: f64::INFINITY,
            time_dependent: false,
            scheme: IntegrationScheme::Bdf1,
            bdf2_restart: false,
        }
    }

    /// Integration order the device should use for this step.
    pub fn effective_order(&self) -> usize {
        if self.bdf2_restart {
            1
        } else {
            self.scheme.order()
        }
    }
}

impl Default for TimeState {
    fn default() -> Self {
        Self::steady(0.0)
    }
}

/// Mutable state of the analysis currently running.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub settings: SolverSettings,
    pub time: TimeState,
    /// Accepted DC steps (ramp, gmin stage or sweep point) in the current phase.
    pub dc_cycles: usize,
    /// Accepted transient steps.
    pub t_cycles: usize,
}

impl AnalysisContext {
    pub fn new(settings: SolverSettings) -> Self {
        Self {
            settings,
            time: TimeState::default(),
            dc_cycles: 0,
            t_cycles: 0,
        }
    }
}
