//! Solver settings loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is valid.
//! Analysis commands themselves come from the netlist; these settings only
//! tune how each phase is solved.

use crate::error::{MixError, Result};
use serde_derive::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub newton: NewtonSettings,
    pub ramp: RampSettings,
    pub sweep: SweepSettings,
    pub transient: TransientSettings,
    pub device: BarSettings,
}

impl SolverSettings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject step sizes and tolerances that would stall or silently
    /// disable continuation.
    pub fn validate(&self) -> Result<()> {
        let ramp = &self.ramp;
        let sweep = &self.sweep;
        let tran = &self.transient;
        positive("ramp.voltage_step", ramp.voltage_step)?;
        positive("ramp.current_step", ramp.current_step)?;
        positive("ramp.gmin_init", ramp.gmin_init)?;
        positive("ramp.gmin", ramp.gmin)?;
        positive("sweep.voltage_step_max", sweep.voltage_step_max)?;
        positive("sweep.current_step_max", sweep.current_step_max)?;
        positive("transient.lte_rel_tol", tran.lte_rel_tol)?;
        positive("transient.lte_abs_tol", tran.lte_abs_tol)?;
        if let Some(max_step) = tran.max_step {
            positive("transient.max_step", max_step)?;
        }
        positive("newton.relax_factor", self.newton.relax_factor)
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(MixError::Config(format!("{name} must be finite and positive, got {value}")))
    }
}

/// Nonlinear solver tolerances and limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NewtonSettings {
    pub max_iterations: usize,
    pub max_function_evals: usize,
    /// Total residual norm threshold, multiplied by the global dof count.
    pub function_abs_tol: f64,
    /// Stagnation threshold on successive residual norms.
    pub function_rel_tol: f64,
    /// Normalised update-length threshold.
    pub step_rel_tol: f64,
    /// Multiplier applied to every group tolerance for the relaxed check.
    pub relax_factor: f64,
    pub groups: GroupTolerances,
    pub linear: LinearSettings,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            max_function_evals: 1000,
            function_abs_tol: 1e-12,
            function_rel_tol: 1e-14,
            step_rel_tol: 1e-5,
            relax_factor: 1e4,
            groups: GroupTolerances::default(),
            linear: LinearSettings::default(),
        }
    }
}

/// Absolute residual tolerance per equation group.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GroupTolerances {
    pub potential: f64,
    pub electron: f64,
    pub hole: f64,
    pub lattice_temperature: f64,
    pub electron_temperature: f64,
    pub hole_temperature: f64,
    pub electrode: f64,
}

impl Default for GroupTolerances {
    fn default() -> Self {
        Self {
            potential: 1e-9,
            electron: 1e-9,
            hole: 1e-9,
            lattice_temperature: 1e-9,
            electron_temperature: 1e-9,
            hole_temperature: 1e-9,
            electrode: 1e-9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearBackend {
    SparseLu,
    Dense,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinearSettings {
    pub backend: LinearBackend,
    /// Relative tolerance, multiplied by the global dof count.
    pub rel_tol: f64,
    /// Absolute tolerance, multiplied by the global dof count.
    pub abs_tol: f64,
}

impl Default for LinearSettings {
    fn default() -> Self {
        Self {
            backend: LinearBackend::SparseLu,
            rel_tol: 1e-12,
            abs_tol: 1e-20,
        }
    }
}

/// Operating-point source ramp and gmin relaxation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RampSettings {
    /// Largest source voltage increment per ramp step (V).
    pub voltage_step: f64,
    /// Largest source current increment per ramp step (A).
    pub current_step: f64,
    pub min_steps: usize,
    pub gmin_init: f64,
    pub gmin: f64,
    pub predict: bool,
}

impl Default for RampSettings {
    fn default() -> Self {
        Self {
            voltage_step: 0.25,
            current_step: 1e-3,
            min_steps: 1,
            gmin_init: 1e-6,
            gmin: 1e-12,
            predict: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    pub voltage_step_max: f64,
    pub current_step_max: f64,
    pub predict: bool,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            voltage_step_max: 1.0,
            current_step_max: 1e-2,
            predict: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationScheme {
    Bdf1,
    Bdf2,
}

impl IntegrationScheme {
    pub fn order(self) -> usize {
        match self {
            IntegrationScheme::Bdf1 => 1,
            IntegrationScheme::Bdf2 => 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransientSettings {
    pub scheme: IntegrationScheme,
    pub auto_step: bool,
    pub predict: bool,
    /// Solve a transient operating point before the first step.
    pub tran_op: bool,
    pub lte_rel_tol: f64,
    pub lte_abs_tol: f64,
    /// Upper bound on the step size; 10x the nominal step when unset.
    pub max_step: Option<f64>,
}

impl Default for TransientSettings {
    fn default() -> Self {
        Self {
            scheme: IntegrationScheme::Bdf2,
            auto_step: true,
            predict: true,
            tran_op: true,
            lte_rel_tol: 1e-3,
            lte_abs_tol: 1e-6,
            max_step: None,
        }
    }
}

/// Reference resistive-bar device parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BarSettings {
    pub nodes: usize,
    /// Conductance of each segment at the reference carrier density (S).
    pub segment_conductance: f64,
    pub reference_density: f64,
    /// Quadratic field dependence of the carrier density.
    pub nonlinearity: f64,
    /// Capacitance to ground of each interior node (F).
    pub node_capacitance: f64,
    pub anode: String,
    pub cathode: String,
    /// Current waveform injected at the mid node, e.g. `"PWL(0 0 1 1m)"`.
    pub injection: Option<String>,
}

impl Default for BarSettings {
    fn default() -> Self {
        Self {
            nodes: 11,
            segment_conductance: 1e-2,
            reference_density: 1.0,
            nonlinearity: 0.0,
            node_capacitance: 0.0,
            anode: "anode".into(),
            cathode: "cathode".into(),
            injection: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let s = SolverSettings::from_toml_str("").unwrap();
        assert_eq!(s.newton.max_iterations, 30);
        assert_eq!(s.transient.scheme, IntegrationScheme::Bdf2);
        assert_eq!(s.newton.linear.backend, LinearBackend::SparseLu);
        assert!(s.ramp.predict);
    }

    #[test]
    fn partial_sections_override_fields() {
        let s = SolverSettings::from_toml_str(
            r#"
            [ramp]
            voltage_step = 1.0

            [transient]
            scheme = "bdf1"
            max_step = 0.5

            [newton.linear]
            backend = "dense"
            "#,
        )
        .unwrap();
        assert_eq!(s.ramp.voltage_step, 1.0);
        assert_eq!(s.ramp.min_steps, 1);
        assert_eq!(s.transient.scheme, IntegrationScheme::Bdf1);
        assert_eq!(s.transient.max_step, Some(0.5));
        assert_eq!(s.newton.linear.backend, LinearBackend::Dense);
    }

    #[test]
    fn defaults_are_valid() {
        assert!(SolverSettings::default().validate().is_ok());
    }

    #[test]
    fn each_step_and_tolerance_must_be_positive() {
        let cases: [(&str, fn(&mut SolverSettings)); 11] = [
            ("ramp.voltage_step", |s| s.ramp.voltage_step = 0.0),
            ("ramp.current_step", |s| s.ramp.current_step = -1e-3),
            ("ramp.gmin_init", |s| s.ramp.gmin_init = 0.0),
            ("ramp.gmin", |s| s.ramp.gmin = f64::NAN),
            ("sweep.voltage_step_max", |s| s.sweep.voltage_step_max = 0.0),
            ("sweep.current_step_max", |s| s.sweep.current_step_max = f64::INFINITY),
            ("transient.lte_rel_tol", |s| s.transient.lte_rel_tol = 0.0),
            ("transient.lte_abs_tol", |s| s.transient.lte_abs_tol = -1.0),
            ("transient.max_step", |s| s.transient.max_step = Some(0.0)),
            ("transient.max_step", |s| s.transient.max_step = Some(-2.0)),
            ("newton.relax_factor", |s| s.newton.relax_factor = 0.0),
        ];
        for (name, breaks) in cases {
            let mut s = SolverSettings::default();
            breaks(&mut s);
            match s.validate() {
                Err(MixError::Config(msg)) => assert!(msg.contains(name), "{msg}"),
                other => panic!("{name}: expected a config error, got {other:?}"),
            }
        }
    }

    #[test]
    fn invalid_values_in_file_are_rejected() {
        let err = SolverSettings::from_toml_str("[ramp]\nvoltage_step = 0.0").unwrap_err();
        assert!(matches!(err, MixError::Config(_)), "{err}");
        let err = SolverSettings::from_toml_str("[transient]\nmax_step = -1.0").unwrap_err();
        assert!(matches!(err, MixError::Config(_)), "{err}");
    }

    #[test]
    fn unknown_scheme_is_an_error() {
        let err = SolverSettings::from_toml_str("[transient]\nscheme = \"rk4\"").unwrap_err();
        assert!(format!("{err}").contains("Settings file error"));
    }
}
