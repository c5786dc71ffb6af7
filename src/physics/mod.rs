pub mod bc;
pub mod operators;
pub mod state;
pub mod tdgl;

use std::fmt;
use std::sync::Arc;

use glam::DVec2;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::discretization::mesh::Mesh;

/// Shared position-dependent scalar function.
pub type PFn = Arc<dyn Fn(DVec2) -> f64 + Send + Sync>;

/// A material parameter that may vary over the film, such as the disorder
/// parameter `ε(r)`.
#[derive(Clone)]
pub struct Parameter {
    func: PFn,
    constant: Option<f64>,
}

impl Parameter {
    pub fn constant(value: f64) -> Self {
        Self {
            func: Arc::new(move |_| value),
            constant: Some(value),
        }
    }

    pub fn new<F>(func: F) -> Self
    where
        F: Fn(DVec2) -> f64 + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            constant: None,
        }
    }

    pub fn evaluate(&self, position: DVec2) -> f64 {
        (self.func)(position)
    }

    pub fn as_constant(&self) -> Option<f64> {
        self.constant
    }

    /// Values at every mesh vertex.
    pub fn on_vertices(&self, mesh: &Mesh) -> DVector<f64> {
        DVector::from_iterator(
            mesh.num_vertices(),
            mesh.nodes.iter().map(|n| self.evaluate(n.position)),
        )
    }
}

impl From<f64> for Parameter {
    fn from(value: f64) -> Self {
        Parameter::constant(value)
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.constant {
            Some(v) => write!(f, "Parameter({v})"),
            None => write!(f, "Parameter(<fn>)"),
        }
    }
}

/// Material parameters of the dimensionless TDGL model.
#[derive(Clone, Debug)]
pub struct TdglParameters {
    /// Ratio of relaxation times of the order parameter amplitude and phase.
    pub u: f64,
    /// Inelastic scattering parameter.
    pub gamma: f64,
    /// Disorder parameter `ε(r)`, below 1 where superconductivity is suppressed.
    pub epsilon: Parameter,
}

impl Default for TdglParameters {
    fn default() -> Self {
        Self {
            u: 5.79,
            gamma: 10.0,
            epsilon: Parameter::constant(1.0),
        }
    }
}

impl TdglParameters {
    pub fn with_epsilon(mut self, epsilon: impl Into<Parameter>) -> Self {
        self.epsilon = epsilon.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.u.is_finite() && self.u > 0.0) {
            return Err(ConfigError::NotPositive {
                name: "u",
                value: self.u,
            });
        }
        if !(self.gamma.is_finite() && self.gamma >= 0.0) {
            return Err(ConfigError::NotPositive {
                name: "gamma",
                value: self.gamma,
            });
        }
        if let Some(value) = self.epsilon.as_constant() {
            check_epsilon(value, DVec2::ZERO)?;
        }
        Ok(())
    }

    /// [`TdglParameters::validate`], plus `ε` at every vertex of `mesh`.
    pub fn validate_on(&self, mesh: &Mesh) -> Result<(), ConfigError> {
        self.validate()?;
        for node in &mesh.nodes {
            check_epsilon(self.epsilon.evaluate(node.position), node.position)?;
        }
        Ok(())
    }

    pub fn summary(&self) -> ParameterSummary {
        ParameterSummary {
            u: self.u,
            gamma: self.gamma,
            epsilon: self.epsilon.as_constant(),
        }
    }
}

fn check_epsilon(value: f64, position: DVec2) -> Result<(), ConfigError> {
    if (-1.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Epsilon {
            value,
            x: position.x,
            y: position.y,
        })
    }
}

/// Serializable description of [`TdglParameters`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub u: f64,
    pub gamma: f64,
    /// `None` when `ε` varies over the film.
    pub epsilon: Option<f64>,
}

/// Applied vector potential `A(r, t)` in the film plane.
pub trait VectorPotential: Send + Sync {
    fn evaluate(&self, position: DVec2, time: f64) -> DVec2;

    /// `∂A/∂t`, zero for static fields.
    fn rate(&self, _position: DVec2, _time: f64) -> DVec2 {
        DVec2::ZERO
    }
}

/// Zero applied field.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoField;

impl VectorPotential for NoField {
    fn evaluate(&self, _position: DVec2, _time: f64) -> DVec2 {
        DVec2::ZERO
    }
}

/// Uniform perpendicular field `B_z` in the symmetric gauge, `A = B_z/2 (-y, x)`.
#[derive(Clone, Copy, Debug)]
pub struct UniformField {
    pub bz: f64,
}

impl VectorPotential for UniformField {
    fn evaluate(&self, p: DVec2, _time: f64) -> DVec2 {
        0.5 * self.bz * DVec2::new(-p.y, p.x)
    }
}

/// Uniform field ramped linearly from zero to `bz` over `ramp_time`.
#[derive(Clone, Copy, Debug)]
pub struct RampedField {
    pub bz: f64,
    pub ramp_time: f64,
}

impl RampedField {
    fn fraction(&self, time: f64) -> f64 {
        if self.ramp_time <= 0.0 {
            1.0
        } else {
            (time / self.ramp_time).clamp(0.0, 1.0)
        }
    }
}

impl VectorPotential for RampedField {
    fn evaluate(&self, p: DVec2, time: f64) -> DVec2 {
        0.5 * self.bz * self.fraction(time) * DVec2::new(-p.y, p.x)
    }

    fn rate(&self, p: DVec2, time: f64) -> DVec2 {
        if self.ramp_time > 0.0 && (0.0..self.ramp_time).contains(&time) {
            0.5 * self.bz / self.ramp_time * DVec2::new(-p.y, p.x)
        } else {
            DVec2::ZERO
        }
    }
}

/// Arbitrary static vector potential given as a closure.
pub struct PotentialFn<F>(pub F);

impl<F> VectorPotential for PotentialFn<F>
where
    F: Fn(DVec2) -> DVec2 + Send + Sync,
{
    fn evaluate(&self, p: DVec2, _time: f64) -> DVec2 {
        (self.0)(p)
    }
}
