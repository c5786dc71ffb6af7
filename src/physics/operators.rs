//! Sparse finite-volume operators on the vertex/edge structure of a [`Mesh`].
//!
//! Scalars live on vertices, fluxes on edges. For an edge `e = (t, h)` with
//! length `l_e` and dual length `d_e`:
//!
//! - gradient: `(G f)_e = (f_h - f_t) / l_e`
//! - divergence: `(Div J)_i = (1/a_i) Σ_e d_e J_e (δ_{i=t} - δ_{i=h})`
//! - Laplacian: `L = Div ∘ G`, i.e. `(L f)_i = (1/a_i) Σ_e (d_e/l_e)(f_k - f_i)`
//!
//! `a_i` is the dual area of vertex `i`. The covariant versions replace `f_h`
//! by `U_e ψ_h` with link variable `U_e = exp(-i θ_e)`.

use nalgebra::DVector;
use num_complex::Complex64;

use crate::discretization::mesh::Mesh;
use crate::numerics::sparse::{CooMatrix, CsrMatrix, CsrMatrixExt};
use crate::numerics::timing::record_assembly;

pub struct DiscreteOperators {
    pub gradient: CsrMatrix<f64>,
    pub divergence: CsrMatrix<f64>,
    pub laplacian: CsrMatrix<f64>,
    /// Area-weighted Laplacian `K = diag(a) L`, symmetric negative semi-definite.
    pub stiffness: CsrMatrix<f64>,
    /// Edge weights `d_e / l_e`.
    pub edge_weights: DVector<f64>,
    pub dual_areas: DVector<f64>,
}

impl DiscreteOperators {
    pub fn new(mesh: &Mesh) -> Self {
        record_assembly(|| {
            let (nv, ne) = (mesh.num_vertices(), mesh.num_edges());
            let dual_areas = DVector::from_vec(mesh.dual_areas());
            let edge_weights = DVector::from_iterator(
                ne,
                mesh.edges.iter().map(|e| e.dual_length / e.length),
            );

            let mut gradient = CooMatrix::new(ne, nv);
            let mut divergence = CooMatrix::new(nv, ne);
            let mut stiffness = CooMatrix::new(nv, nv);
            for (k, edge) in mesh.edges.iter().enumerate() {
                let (t, h) = (edge.tail(), edge.head());
                gradient.push(k, h, 1.0 / edge.length);
                gradient.push(k, t, -1.0 / edge.length);

                divergence.push(t, k, edge.dual_length / dual_areas[t]);
                divergence.push(h, k, -edge.dual_length / dual_areas[h]);

                let w = edge_weights[k];
                stiffness.push(t, h, w);
                stiffness.push(h, t, w);
                stiffness.push(t, t, -w);
                stiffness.push(h, h, -w);
            }

            let stiffness = CsrMatrix::from(&stiffness);
            let mut laplacian = stiffness.clone();
            let inv_area: Vec<f64> = dual_areas.iter().map(|a| 1.0 / a).collect();
            laplacian.scale_rows(&inv_area);

            Self {
                gradient: CsrMatrix::from(&gradient),
                divergence: CsrMatrix::from(&divergence),
                laplacian,
                stiffness,
                edge_weights,
                dual_areas,
            }
        })
    }

    /// Net outflow `Σ_e d_e J_e (δ_{i=t} - δ_{i=h})` of an edge field from each control volume.
    pub fn outflow(&self, flux: &DVector<f64>) -> DVector<f64> {
        self.divergence.mul_vec(flux).component_mul(&self.dual_areas)
    }

    /// Covariant gradient `(U_e ψ_h - ψ_t) / l_e` for link phases `θ_e`.
    pub fn covariant_gradient(&self, mesh: &Mesh, link_phases: &DVector<f64>) -> CsrMatrix<Complex64> {
        let (nv, ne) = (mesh.num_vertices(), mesh.num_edges());
        let mut coo = CooMatrix::new(ne, nv);
        for (k, edge) in mesh.edges.iter().enumerate() {
            let link = link_variable(link_phases[k]);
            coo.push(k, edge.head(), link / edge.length);
            coo.push(k, edge.tail(), Complex64::new(-1.0 / edge.length, 0.0));
        }
        CsrMatrix::from(&coo)
    }

    /// Area-weighted covariant Laplacian `K_A`; Hermitian negative semi-definite.
    pub fn covariant_stiffness(&self, mesh: &Mesh, link_phases: &DVector<f64>) -> CsrMatrix<Complex64> {
        let nv = mesh.num_vertices();
        let mut coo = CooMatrix::new(nv, nv);
        for (k, edge) in mesh.edges.iter().enumerate() {
            let (t, h) = (edge.tail(), edge.head());
            let w = self.edge_weights[k];
            let link = link_variable(link_phases[k]);
            coo.push(t, h, link * w);
            coo.push(h, t, link.conj() * w);
            coo.push(t, t, Complex64::new(-w, 0.0));
            coo.push(h, h, Complex64::new(-w, 0.0));
        }
        CsrMatrix::from(&coo)
    }

    /// Covariant Laplacian `(∇ - iA)²` on vertices.
    pub fn covariant_laplacian(&self, mesh: &Mesh, link_phases: &DVector<f64>) -> CsrMatrix<Complex64> {
        let mut laplacian = self.covariant_stiffness(mesh, link_phases);
        let inv_area: Vec<Complex64> = self
            .dual_areas
            .iter()
            .map(|a| Complex64::new(1.0 / a, 0.0))
            .collect();
        laplacian.scale_rows(&inv_area);
        laplacian
    }
}

/// `U_e = exp(-i θ_e)`.
pub fn link_variable(phase: f64) -> Complex64 {
    Complex64::from_polar(1.0, -phase)
}
