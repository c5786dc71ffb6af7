//! Adaptive time stepping with step-doubling error control.
//!
//! An attempt takes one step of `dt` and two steps of `dt/2` from the same
//! accepted state. Their difference estimates the local error; the two-half-step
//! result becomes the new state when the estimate is within tolerance.

use log::{debug, warn};
use thiserror::Error;

use super::linear::{KrylovSolver, LinearSolveFailure};
use super::ErrorNorm;
use crate::config::SolverOptions;
use crate::physics::state::FieldState;
use crate::physics::tdgl::{AdvanceError, TdglModel};

#[derive(Clone, Debug)]
pub struct StepSuccess {
    pub state: FieldState,
    pub dt_taken: f64,
    pub error_estimate: f64,
    /// Suggested size of the next step.
    pub dt_next: f64,
    pub linear_iterations: usize,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum RejectReason {
    #[error("local error {error:.3e} exceeds tolerance {tolerance:.3e}")]
    ErrorTooLarge { error: f64, tolerance: f64 },
    #[error("linear solve failed: {0}")]
    LinearSolve(#[from] LinearSolveFailure),
    #[error("|psi| reached {max_abs_psi:.3}, above the limit {limit:.3}")]
    Unstable { max_abs_psi: f64, limit: f64 },
    #[error("no real |psi|^2 update at vertex {vertex} (discriminant {discriminant:.3e})")]
    NoRealRoot { vertex: usize, discriminant: f64 },
}

impl From<AdvanceError> for RejectReason {
    fn from(error: AdvanceError) -> Self {
        match error {
            AdvanceError::LinearSolve(failure) => RejectReason::LinearSolve(failure),
            AdvanceError::NoRealRoot {
                vertex,
                discriminant,
            } => RejectReason::NoRealRoot {
                vertex,
                discriminant,
            },
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum FatalReason {
    #[error("non-finite values in {field} at t = {time}")]
    NonFinite { field: &'static str, time: f64 },
}

#[derive(Clone, Debug)]
pub enum StepOutcome {
    Accepted(StepSuccess),
    Rejected(RejectReason),
    Fatal(FatalReason),
}

pub struct TimeStepper {
    model: TdglModel,
    solver: KrylovSolver,
    tolerance: f64,
    norm: ErrorNorm,
    max_growth: f64,
    safety: f64,
    dt_max: f64,
    psi_limit: f64,
}

impl TimeStepper {
    pub fn new(model: TdglModel, options: &SolverOptions) -> Self {
        let solver = KrylovSolver {
            max_refinements: options.linear_max_refinements,
            ..KrylovSolver::new(options.linear_tolerance, options.linear_max_iterations)
        }
        .with_method(options.linear_method);
        Self {
            model,
            solver,
            tolerance: options.error_tolerance,
            norm: options.error_norm,
            max_growth: options.max_step_growth,
            safety: options.step_safety,
            dt_max: options.dt_max,
            psi_limit: options.psi_magnitude_limit,
        }
    }

    pub fn model(&self) -> &TdglModel {
        &self.model
    }

    /// Step size following an accepted step of `dt` with error `error`.
    pub fn next_step_size(&self, dt: f64, error: f64) -> f64 {
        let factor = if error > 0.0 {
            (self.safety * (self.tolerance / error).sqrt()).clamp(1.0, self.max_growth)
        } else {
            self.max_growth
        };
        (dt * factor).min(self.dt_max)
    }

    /// Full-step and two-half-step candidates from `state`.
    fn candidates(
        &self,
        state: &FieldState,
        dt: f64,
    ) -> Result<(FieldState, FieldState, usize), AdvanceError> {
        let (full, it_full) = self.model.advance(state, dt, &self.solver)?;
        let (mid, it_mid) = self.model.advance(state, 0.5 * dt, &self.solver)?;
        let (half, it_half) = self.model.advance(&mid, 0.5 * dt, &self.solver)?;
        Ok((full, half, it_full + it_mid + it_half))
    }

    /// Local error estimate of a step of `dt` from `state`, without accepting anything.
    pub fn error_estimate(&self, state: &FieldState, dt: f64) -> Result<f64, RejectReason> {
        let (full, half, _) = self.candidates(state, dt)?;
        Ok(self.norm.distance(&half.psi, &full.psi))
    }

    /// Attempt one step of `dt` from the accepted `state`, which is left untouched.
    pub fn attempt(&self, state: &FieldState, dt: f64) -> StepOutcome {
        if let Some(field) = non_finite_field(state) {
            return StepOutcome::Fatal(FatalReason::NonFinite {
                field,
                time: state.time,
            });
        }
        let (full, half, iterations) = match self.candidates(state, dt) {
            Ok(candidates) => candidates,
            Err(AdvanceError::LinearSolve(failure)) => {
                warn!("t = {:.4e}, dt = {dt:.3e}: {failure}", state.time);
                return StepOutcome::Rejected(RejectReason::LinearSolve(failure));
            }
            Err(error) => {
                debug!("t = {:.4e}, dt = {dt:.3e}: {error}", state.time);
                return StepOutcome::Rejected(error.into());
            }
        };

        for candidate in [&full, &half] {
            if let Some(field) = non_finite_field(candidate) {
                return StepOutcome::Fatal(FatalReason::NonFinite {
                    field,
                    time: candidate.time,
                });
            }
        }

        let max_abs_psi = half.max_abs_psi();
        if max_abs_psi > self.psi_limit {
            warn!("t = {:.4e}, dt = {dt:.3e}: max |psi| = {max_abs_psi:.3}", state.time);
            return StepOutcome::Rejected(RejectReason::Unstable {
                max_abs_psi,
                limit: self.psi_limit,
            });
        }

        let error = self.norm.distance(&half.psi, &full.psi);
        if error > self.tolerance {
            debug!(
                "t = {:.4e}, dt = {dt:.3e}: error {error:.3e} above tolerance",
                state.time
            );
            return StepOutcome::Rejected(RejectReason::ErrorTooLarge {
                error,
                tolerance: self.tolerance,
            });
        }

        StepOutcome::Accepted(StepSuccess {
            state: half,
            dt_taken: dt,
            error_estimate: error,
            dt_next: self.next_step_size(dt, error),
            linear_iterations: iterations,
        })
    }
}

fn non_finite_field(state: &FieldState) -> Option<&'static str> {
    if !state.psi.iter().all(|p| p.re.is_finite() && p.im.is_finite()) {
        Some("psi")
    } else if !state.mu.iter().all(|m| m.is_finite()) {
        Some("mu")
    } else {
        None
    }
}
