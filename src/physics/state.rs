use nalgebra::DVector;
use num_complex::Complex64;

use crate::config::ConfigError;
use crate::discretization::mesh::Mesh;

/// Fields at a single instant. A step attempt never mutates the accepted state;
/// it produces a new one.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldState {
    pub time: f64,
    /// Order parameter per vertex.
    pub psi: DVector<Complex64>,
    /// Scalar potential per vertex.
    pub mu: DVector<f64>,
    /// Line integral of the applied vector potential along each edge.
    pub a_edge: DVector<f64>,
    /// Time derivative of `a_edge`.
    pub a_rate: DVector<f64>,
    /// Current through each mesh terminal.
    pub terminal_currents: Vec<f64>,
}

impl FieldState {
    /// Uniform order parameter, zero potential, no applied field.
    pub fn uniform(mesh: &Mesh, psi: Complex64) -> Self {
        Self {
            time: 0.0,
            psi: DVector::from_element(mesh.num_vertices(), psi),
            mu: DVector::zeros(mesh.num_vertices()),
            a_edge: DVector::zeros(mesh.num_edges()),
            a_rate: DVector::zeros(mesh.num_edges()),
            terminal_currents: vec![0.0; mesh.terminals.len()],
        }
    }

    pub fn from_psi(mesh: &Mesh, psi: DVector<Complex64>) -> Result<Self, ConfigError> {
        if psi.len() != mesh.num_vertices() {
            return Err(ConfigError::FieldLength {
                field: "psi",
                expected: mesh.num_vertices(),
                found: psi.len(),
            });
        }
        Ok(Self {
            psi,
            ..Self::uniform(mesh, Complex64::new(0.0, 0.0))
        })
    }

    /// Check that every field matches the mesh.
    pub fn check_dimensions(&self, mesh: &Mesh) -> Result<(), ConfigError> {
        let (nv, ne) = (mesh.num_vertices(), mesh.num_edges());
        let checks = [
            ("psi", self.psi.len(), nv),
            ("mu", self.mu.len(), nv),
            ("a_edge", self.a_edge.len(), ne),
            ("a_rate", self.a_rate.len(), ne),
            ("terminal_currents", self.terminal_currents.len(), mesh.terminals.len()),
        ];
        for (field, found, expected) in checks {
            if found != expected {
                return Err(ConfigError::FieldLength {
                    field,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    pub fn psi_magnitude(&self) -> DVector<f64> {
        self.psi.map(|p| p.norm())
    }

    pub fn max_abs_psi(&self) -> f64 {
        self.psi.iter().map(|p| p.norm()).fold(0.0, f64::max)
    }

    pub fn is_finite(&self) -> bool {
        self.psi.iter().all(|p| p.re.is_finite() && p.im.is_finite())
            && self.mu.iter().all(|m| m.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::geometry::{Domain, Polygon};
    use crate::discretization::{generate_mesh, MeshOptions};

    #[test]
    fn uniform_and_from_psi() {
        let domain = Domain::new(Polygon::rectangle("film", 2.0, 1.0, [0.0, 0.0]), 0.4);
        let mesh = generate_mesh(&domain, &MeshOptions::default()).unwrap();
        let state = FieldState::uniform(&mesh, Complex64::new(0.8, 0.0));
        assert!(state.check_dimensions(&mesh).is_ok());
        assert!((state.max_abs_psi() - 0.8).abs() < 1e-15);
        assert!(state.is_finite());

        let short = DVector::from_element(3, Complex64::new(1.0, 0.0));
        assert!(matches!(
            FieldState::from_psi(&mesh, short),
            Err(ConfigError::FieldLength { field: "psi", .. })
        ));
    }
}
