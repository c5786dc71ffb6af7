//! Run configuration: adaptive-step bounds, tolerances, save cadence and stopping criteria.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::numerics::linear::{KrylovMethod, DEFAULT_MAX_REFINEMENTS};
use crate::numerics::ErrorNorm;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be positive and finite, got {value}")]
    NotPositive { name: &'static str, value: f64 },
    #[error("dt_init ({dt_init}) must not exceed dt_max ({dt_max})")]
    InitialStepTooLarge { dt_init: f64, dt_max: f64 },
    #[error("dt_min ({dt_min}) must not exceed dt_init ({dt_init})")]
    MinimumStepTooLarge { dt_min: f64, dt_init: f64 },
    #[error("max_step_growth must be greater than 1, got {0}")]
    StepGrowth(f64),
    #[error("step_safety must lie in (0, 1], got {0}")]
    StepSafety(f64),
    #[error("terminal_psi must lie in [0, 1], got {0}")]
    TerminalPsi(f64),
    #[error("{0} must be at least 1")]
    ZeroCount(&'static str),
    #[error("psi_magnitude_limit must exceed 1, got {0}")]
    PsiLimit(f64),
    #[error("epsilon must lie in [-1, 1], got {value} at ({x}, {y})")]
    Epsilon { value: f64, x: f64, y: f64 },
    #[error("measurement path {0:?} needs at least two points")]
    PathTooShort(String),
    #[error("{field} has {found} entries, the mesh needs {expected}")]
    FieldLength {
        field: &'static str,
        expected: usize,
        found: usize,
    },
}

/// When the recorder stores a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum SaveCadence {
    /// Every `n`-th accepted step.
    EverySteps(usize),
    /// Whenever at least this much simulated time has passed since the last record.
    EveryTime(f64),
}

/// Stop once `max |Δ|ψ||` over the last `window` of simulated time is below `tolerance`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SteadyStateCriterion {
    pub window: f64,
    pub tolerance: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Total simulated time.
    pub solve_time: f64,
    pub dt_init: f64,
    pub dt_max: f64,
    pub dt_min: f64,
    /// Local error tolerance on ψ per step.
    pub error_tolerance: f64,
    pub error_norm: ErrorNorm,
    pub max_step_growth: f64,
    pub step_safety: f64,
    /// Consecutive failed attempts (solver failure or instability) before aborting.
    pub max_solve_retries: usize,
    pub linear_tolerance: f64,
    /// Krylov iterations per solve pass.
    pub linear_max_iterations: usize,
    /// Iterative-refinement passes after the first solve.
    pub linear_max_refinements: usize,
    pub linear_method: KrylovMethod,
    pub save_cadence: SaveCadence,
    pub steady_state: Option<SteadyStateCriterion>,
    pub psi_magnitude_limit: f64,
    /// Order parameter imposed on terminal vertices, `None` leaves them free.
    pub terminal_psi: Option<f64>,
    /// Accepted steps between progress log lines.
    pub progress_interval: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            solve_time: 1.0,
            dt_init: 1e-3,
            dt_max: 0.1,
            dt_min: 1e-9,
            error_tolerance: 1e-3,
            error_norm: ErrorNorm::Max,
            max_step_growth: 2.0,
            step_safety: 0.9,
            max_solve_retries: 10,
            linear_tolerance: 1e-10,
            linear_max_iterations: 5000,
            linear_max_refinements: DEFAULT_MAX_REFINEMENTS,
            linear_method: KrylovMethod::default(),
            save_cadence: SaveCadence::EveryTime(1.0),
            steady_state: None,
            psi_magnitude_limit: 2.0,
            terminal_psi: Some(0.0),
            progress_interval: 100,
        }
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { name, value })
    }
}

impl SolverOptions {
    pub fn new(solve_time: f64) -> Self {
        Self {
            solve_time,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("solve_time", self.solve_time)?;
        positive("dt_init", self.dt_init)?;
        positive("dt_max", self.dt_max)?;
        positive("dt_min", self.dt_min)?;
        positive("error_tolerance", self.error_tolerance)?;
        positive("linear_tolerance", self.linear_tolerance)?;
        if self.dt_init > self.dt_max {
            return Err(ConfigError::InitialStepTooLarge {
                dt_init: self.dt_init,
                dt_max: self.dt_max,
            });
        }
        if self.dt_min > self.dt_init {
            return Err(ConfigError::MinimumStepTooLarge {
                dt_min: self.dt_min,
                dt_init: self.dt_init,
            });
        }
        if !(self.max_step_growth > 1.0 && self.max_step_growth.is_finite()) {
            return Err(ConfigError::StepGrowth(self.max_step_growth));
        }
        if !(self.step_safety > 0.0 && self.step_safety <= 1.0) {
            return Err(ConfigError::StepSafety(self.step_safety));
        }
        if let Some(psi) = self.terminal_psi {
            if !(0.0..=1.0).contains(&psi) {
                return Err(ConfigError::TerminalPsi(psi));
            }
        }
        if !(self.psi_magnitude_limit > 1.0) {
            return Err(ConfigError::PsiLimit(self.psi_magnitude_limit));
        }
        if self.max_solve_retries == 0 {
            return Err(ConfigError::ZeroCount("max_solve_retries"));
        }
        if self.linear_max_iterations == 0 {
            return Err(ConfigError::ZeroCount("linear_max_iterations"));
        }
        if self.progress_interval == 0 {
            return Err(ConfigError::ZeroCount("progress_interval"));
        }
        match self.save_cadence {
            SaveCadence::EverySteps(0) => return Err(ConfigError::ZeroCount("save_cadence")),
            SaveCadence::EverySteps(_) => {}
            SaveCadence::EveryTime(dt) => positive("save_cadence", dt)?,
        }
        if let Some(steady) = &self.steady_state {
            positive("steady_state.window", steady.window)?;
            positive("steady_state.tolerance", steady.tolerance)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(SolverOptions::new(10.0).validate(), Ok(()));
    }

    #[test]
    fn inconsistent_steps_are_rejected() {
        let options = SolverOptions {
            dt_init: 1.0,
            dt_max: 0.1,
            ..SolverOptions::new(10.0)
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InitialStepTooLarge { .. })
        ));

        let options = SolverOptions {
            terminal_psi: Some(1.5),
            ..SolverOptions::new(10.0)
        };
        assert_eq!(options.validate(), Err(ConfigError::TerminalPsi(1.5)));

        let options = SolverOptions {
            save_cadence: SaveCadence::EveryTime(-1.0),
            ..SolverOptions::new(10.0)
        };
        assert!(options.validate().is_err());

        let options = SolverOptions::new(f64::NAN);
        assert!(matches!(
            options.validate(),
            Err(ConfigError::NotPositive { name: "solve_time", .. })
        ));
    }

    #[test]
    fn options_round_trip_through_json() {
        let options = SolverOptions {
            save_cadence: SaveCadence::EverySteps(5),
            steady_state: Some(SteadyStateCriterion {
                window: 2.0,
                tolerance: 1e-4,
            }),
            ..SolverOptions::new(3.0)
        };
        let text = serde_json::to_string(&options).unwrap();
        let back: SolverOptions = serde_json::from_str(&text).unwrap();
        assert_eq!(back, options);

        let partial: SolverOptions = serde_json::from_str(r#"{"solve_time": 7.0}"#).unwrap();
        assert_eq!(partial.solve_time, 7.0);
        assert_eq!(partial.dt_max, 0.1);
        assert_eq!(partial.linear_method, KrylovMethod::ConjugateGradient);

        let bicgstab: SolverOptions =
            serde_json::from_str(r#"{"linear_method": "BiCgStab", "linear_max_refinements": 0}"#)
                .unwrap();
        assert_eq!(bicgstab.linear_method, KrylovMethod::BiCgStab);
        assert_eq!(bicgstab.linear_max_refinements, 0);
    }
}
