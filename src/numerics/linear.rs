use std::sync::Arc;

use kryst::solver::{BiCgStabSolver, CgSolver, LinearSolver};
use kryst::{
    parallel::{NoComm, UniverseComm},
    preconditioner::PcSide,
    ConvergedReason,
};
use log::{debug, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::relative_residual;
use super::sparse::{to_kryst, CsrMatrix, CsrMatrixExt};
use super::timing::record_linear_solve;

/// Correction solves allowed after the initial one.
pub const DEFAULT_MAX_REFINEMENTS: usize = 4;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinearSolveFailure {
    #[error("system size mismatch: matrix is {rows}x{cols}, right-hand side has {rhs} entries")]
    DimensionMismatch { rows: usize, cols: usize, rhs: usize },
    #[error("non-finite values in the {0}")]
    NonFinite(&'static str),
    #[error("Krylov solver error: {0}")]
    Solver(String),
    #[error("relative residual {residual:.3e} above tolerance {tolerance:.3e} after {iterations} iterations ({reason:?})")]
    NotConverged {
        residual: f64,
        tolerance: f64,
        iterations: usize,
        /// Stopping reason of the last Krylov solve.
        reason: ConvergedReason,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KrylovMethod {
    /// Conjugate gradients; both systems of a step are symmetric positive definite.
    #[default]
    ConjugateGradient,
    BiCgStab,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LinearSolveStats {
    pub iterations: usize,
    /// Relative residual of the unscaled system.
    pub relative_residual: f64,
    pub refinements: usize,
}

/// Krylov solve with symmetric Jacobi scaling `D^-1/2 A D^-1/2`.
///
/// Convergence is judged on the true residual of the unscaled system. After the
/// initial solve up to `max_refinements` correction solves run on the current
/// residual; the loop stops early once a correction fails to reduce it.
#[derive(Clone, Debug)]
pub struct KrylovSolver {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub max_refinements: usize,
    pub method: KrylovMethod,
}

impl KrylovSolver {
    pub fn new(tolerance: f64, max_iterations: usize) -> Self {
        Self {
            tolerance,
            max_iterations,
            max_refinements: DEFAULT_MAX_REFINEMENTS,
            method: KrylovMethod::default(),
        }
    }

    pub fn with_method(mut self, method: KrylovMethod) -> Self {
        self.method = method;
        self
    }

    pub fn solve(
        &self,
        matrix: &CsrMatrix<f64>,
        rhs: &DVector<f64>,
        initial_guess: Option<&DVector<f64>>,
    ) -> Result<(DVector<f64>, LinearSolveStats), LinearSolveFailure> {
        let n = matrix.nrows();
        if matrix.ncols() != n || rhs.len() != n {
            return Err(LinearSolveFailure::DimensionMismatch {
                rows: n,
                cols: matrix.ncols(),
                rhs: rhs.len(),
            });
        }
        if !rhs.iter().all(|v| v.is_finite()) {
            return Err(LinearSolveFailure::NonFinite("right-hand side"));
        }
        if !matrix.values().iter().all(|v| v.is_finite()) {
            return Err(LinearSolveFailure::NonFinite("matrix"));
        }

        let b_norm = rhs.norm();
        if b_norm == 0.0 {
            return Ok((DVector::zeros(n), LinearSolveStats::default()));
        }

        let scale: Vec<f64> = matrix
            .diagonal_entries()
            .into_iter()
            .map(|d| if d.abs() < 1e-300 { 1.0 } else { 1.0 / d.abs().sqrt() })
            .collect();
        let mut scaled = matrix.clone();
        let (offsets, cols) = (matrix.row_offsets(), matrix.col_indices());
        let values = scaled.values_mut();
        for i in 0..n {
            for k in offsets[i]..offsets[i + 1] {
                values[k] *= scale[i] * scale[cols[k]];
            }
        }
        let op = kryst::matrix::op::CsrOp::new(Arc::new(to_kryst(&scaled)));

        let mut x = match initial_guess {
            Some(x0) if x0.len() == n && x0.iter().all(|v| v.is_finite()) => x0.clone(),
            _ => DVector::zeros(n),
        };
        let mut residual = rhs - matrix.mul_vec(&x);
        let mut stats = LinearSolveStats {
            relative_residual: relative_residual(residual.norm(), b_norm),
            ..LinearSolveStats::default()
        };
        let mut reason = ConvergedReason::Continued;

        for pass in 0..=self.max_refinements {
            if stats.relative_residual <= self.tolerance {
                return Ok((x, stats));
            }
            if pass > 0 {
                stats.refinements += 1;
                debug!(
                    "refinement pass {pass}: relative residual {:.3e}",
                    stats.relative_residual
                );
            }

            // Correction A dx = r on the scaled system: (S A S) y = S r, dx = S y.
            let scaled_rhs = DVector::from_iterator(
                n,
                residual.iter().zip(scale.iter()).map(|(r, s)| r * s),
            );
            let inner_tol = (self.tolerance * b_norm / residual.norm()).clamp(1e-15, 0.1);
            let mut y = DVector::zeros(n);
            let solve_stats = record_linear_solve(|| self.krylov(&op, &scaled_rhs, &mut y, inner_tol))
                .map_err(|e| {
                    warn!("{:?} failed on a {n}x{n} system: {e}", self.method);
                    LinearSolveFailure::Solver(e)
                })?;
            stats.iterations += solve_stats.iterations;
            reason = solve_stats.reason;
            if reason == ConvergedReason::DivergedDtol {
                return Err(LinearSolveFailure::NotConverged {
                    residual: stats.relative_residual,
                    tolerance: self.tolerance,
                    iterations: stats.iterations,
                    reason,
                });
            }
            if !y.iter().all(|v| v.is_finite()) {
                return Err(LinearSolveFailure::NonFinite("solution"));
            }

            let candidate = &x + y.component_mul(&DVector::from_column_slice(&scale));
            let candidate_residual = rhs - matrix.mul_vec(&candidate);
            let candidate_relative = relative_residual(candidate_residual.norm(), b_norm);
            if candidate_relative >= stats.relative_residual {
                debug!(
                    "correction stalled at relative residual {:.3e} ({reason:?})",
                    stats.relative_residual
                );
                break;
            }
            x = candidate;
            residual = candidate_residual;
            stats.relative_residual = candidate_relative;
        }

        if stats.relative_residual <= self.tolerance {
            return Ok((x, stats));
        }
        Err(LinearSolveFailure::NotConverged {
            residual: stats.relative_residual,
            tolerance: self.tolerance,
            iterations: stats.iterations,
            reason,
        })
    }

    fn krylov(
        &self,
        op: &kryst::matrix::op::CsrOp<f64>,
        rhs: &DVector<f64>,
        x: &mut DVector<f64>,
        rtol: f64,
    ) -> Result<kryst::SolveStats<f64>, String> {
        let n = rhs.len();
        let mut workspace = kryst::context::ksp_context::Workspace::new(n);
        let comm = UniverseComm::NoComm(NoComm {});
        if self.method == KrylovMethod::ConjugateGradient {
            let mut solver = CgSolver::new(rtol, self.max_iterations);
            solver.setup_workspace(&mut workspace);
            match solver.solve(
                op,
                None,
                rhs.as_slice(),
                x.as_mut_slice(),
                PcSide::Left,
                &comm,
                None,
                Some(&mut workspace),
            ) {
                Ok(stats) => return Ok(stats),
                // An indefinite system is retried with BiCGStab.
                Err(e) => {
                    debug!("CG failed ({e:?}), retrying with BiCGStab");
                    x.fill(0.0);
                    workspace = kryst::context::ksp_context::Workspace::new(n);
                }
            }
        }
        let mut solver = BiCgStabSolver::new(rtol, self.max_iterations);
        solver.setup_workspace(&mut workspace);
        solver
            .solve(
                op,
                None,
                rhs.as_slice(),
                x.as_mut_slice(),
                PcSide::Left,
                &comm,
                None,
                Some(&mut workspace),
            )
            .map_err(|e| format!("{e:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerics::sparse::CooMatrix;
    use approx::assert_relative_eq;

    fn poisson_1d(n: usize) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(n, n);
        for i in 0..n {
            coo.push(i, i, 2.0);
            if i > 0 {
                coo.push(i, i - 1, -1.0);
            }
            if i + 1 < n {
                coo.push(i, i + 1, -1.0);
            }
        }
        CsrMatrix::from(&coo)
    }

    /// Diagonally dominant tridiagonal matrix, condition number about 3.
    fn well_conditioned(n: usize) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(n, n);
        for i in 0..n {
            coo.push(i, i, 4.0);
            if i > 0 {
                coo.push(i, i - 1, -1.0);
            }
            if i + 1 < n {
                coo.push(i, i + 1, -1.0);
            }
        }
        CsrMatrix::from(&coo)
    }

    /// Poisson matrix with a strongly varying diagonal shift.
    fn badly_scaled(n: usize) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(n, n);
        for i in 0..n {
            let shift = 10f64.powi((i % 7) as i32);
            coo.push(i, i, 2.0 + shift);
            if i > 0 {
                coo.push(i, i - 1, -1.0);
            }
            if i + 1 < n {
                coo.push(i, i + 1, -1.0);
            }
        }
        CsrMatrix::from(&coo)
    }

    #[test]
    fn solves_to_requested_residual() {
        let n = 50;
        let a = poisson_1d(n);
        let expected = DVector::from_fn(n, |i, _| (i as f64 * 0.1).sin());
        let b = a.mul_vec(&expected);
        for method in [KrylovMethod::ConjugateGradient, KrylovMethod::BiCgStab] {
            let solver = KrylovSolver::new(1e-10, 1000).with_method(method);
            let (x, stats) = solver.solve(&a, &b, None).unwrap();
            assert!(stats.relative_residual <= 1e-10);
            for i in 0..n {
                assert_relative_eq!(x[i], expected[i], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn tight_tolerance_is_met_on_a_badly_scaled_system() {
        let n = 200;
        let a = badly_scaled(n);
        let expected = DVector::from_fn(n, |i, _| 1.0 + (i as f64 * 0.37).cos());
        let b = a.mul_vec(&expected);
        let (x, stats) = KrylovSolver::new(1e-12, 2000).solve(&a, &b, None).unwrap();
        assert!(stats.relative_residual <= 1e-12);
        let true_residual = (&b - a.mul_vec(&x)).norm() / b.norm();
        assert!(true_residual <= 1e-12);
    }

    #[test]
    fn refinement_recovers_from_a_short_iteration_budget() {
        let n = 60;
        let a = well_conditioned(n);
        let b = DVector::from_fn(n, |i, _| (i as f64).sqrt());
        // Too few iterations for one solve, enough over several corrections.
        let solver = KrylovSolver {
            max_refinements: 30,
            ..KrylovSolver::new(1e-10, 2)
        };
        let (x, stats) = solver.solve(&a, &b, None).unwrap();
        assert!(stats.refinements > 0);
        assert!(stats.relative_residual <= 1e-10);
        assert!((&b - a.mul_vec(&x)).norm() / b.norm() <= 1e-10);
    }

    #[test]
    fn exhausted_budget_reports_the_krylov_reason() {
        let n = 200;
        let a = well_conditioned(n);
        let b = DVector::from_fn(n, |i, _| (i as f64 * 0.3).sin() + 2.0);
        let solver = KrylovSolver {
            max_refinements: 0,
            ..KrylovSolver::new(1e-12, 1)
        };
        match solver.solve(&a, &b, None) {
            Err(LinearSolveFailure::NotConverged {
                reason, residual, ..
            }) => {
                assert_eq!(reason, ConvergedReason::DivergedMaxIts);
                assert!(residual > 1e-12 && residual < 1.0);
            }
            other => panic!("expected NotConverged, got {other:?}"),
        }
    }

    #[test]
    fn zero_rhs_gives_zero_solution() {
        let a = poisson_1d(4);
        let (x, stats) = KrylovSolver::new(1e-10, 10)
            .solve(&a, &DVector::zeros(4), None)
            .unwrap();
        assert_eq!(x, DVector::zeros(4));
        assert_eq!(stats.iterations, 0);
    }

    #[test]
    fn exact_initial_guess_needs_no_iterations() {
        let a = poisson_1d(8);
        let x0 = DVector::from_element(8, 1.0);
        let b = a.mul_vec(&x0);
        let (_, stats) = KrylovSolver::new(1e-10, 10).solve(&a, &b, Some(&x0)).unwrap();
        assert_eq!(stats.iterations, 0);
    }

    #[test]
    fn rejects_bad_input() {
        let a = poisson_1d(3);
        let solver = KrylovSolver::new(1e-10, 10);
        assert!(matches!(
            solver.solve(&a, &DVector::zeros(4), None),
            Err(LinearSolveFailure::DimensionMismatch { .. })
        ));
        let b = DVector::from_vec(vec![1.0, f64::NAN, 0.0]);
        assert_eq!(
            solver.solve(&a, &b, None).unwrap_err(),
            LinearSolveFailure::NonFinite("right-hand side")
        );
    }
}
