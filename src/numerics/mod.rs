pub mod linear;
pub mod sparse;
pub mod stepper;
pub mod timing;

use nalgebra::DVector;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Norm used to compare two candidate order-parameter fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorNorm {
    /// Largest pointwise difference.
    Max,
    /// Root mean square of the pointwise differences.
    Rms,
}

impl ErrorNorm {
    pub fn distance(&self, a: &DVector<Complex64>, b: &DVector<Complex64>) -> f64 {
        let diffs = a.iter().zip(b.iter()).map(|(x, y)| (x - y).norm());
        match self {
            ErrorNorm::Max => diffs.fold(0.0, f64::max),
            ErrorNorm::Rms => {
                let n = a.len().max(1) as f64;
                (diffs.map(|d| d * d).sum::<f64>() / n).sqrt()
            }
        }
    }
}

pub fn relative_residual(residual_norm: f64, rhs_norm: f64) -> f64 {
    if rhs_norm > 0.0 {
        residual_norm / rhs_norm
    } else {
        residual_norm
    }
}
