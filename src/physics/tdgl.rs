//! Assembly of the order-parameter and potential systems of one semi-implicit step.
//!
//! The order parameter obeys
//!
//! ```text
//! u / sqrt(1 + γ²|ψ|²) (∂t + iμ + γ²/2 ∂t|ψ|²) ψ = (ε - |ψ|²) ψ + (∇ - iA)² ψ
//! ```
//!
//! and the potential follows from current conservation,
//! `∇²μ = ∇·J_s - ∇·∂tA` with `J_s = Im[ψ* (∇ - iA) ψ]`.
//!
//! A step first solves the implicit covariant diffusion problem for an
//! intermediate field `w`, then applies the `γ²/2 ∂t|ψ|²` term vertex by vertex:
//! with `z = γ²/2 exp(-iμΔt) ψⁿ` and `w' = w + z|ψⁿ|²`, the new order parameter is
//! `ψ = w' - z s` where `s = |ψ|²` is the smaller root of
//! `|z|² s² - (2 Re(w' z̄) + 1) s + |w'|² = 0`.

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::DVector;
use num_complex::Complex64;
use thiserror::Error;

use super::bc::{BoundaryConditions, BoundaryError, ResolvedBoundary};
use super::operators::{link_variable, DiscreteOperators};
use super::state::FieldState;
use super::{TdglParameters, VectorPotential};
use crate::discretization::mesh::Mesh;
use crate::numerics::linear::{KrylovSolver, LinearSolveFailure};
use crate::numerics::sparse::{
    build_with_dirichlet, join_complex, real_embedding, split_complex, CooMatrix, CsrMatrix,
    CsrMatrixExt,
};
use crate::numerics::timing::record_assembly;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum AdvanceError {
    #[error(transparent)]
    LinearSolve(#[from] LinearSolveFailure),
    /// The `|ψ|²` update has no real non-negative root at `vertex`; the step is too large.
    #[error("no real |psi|^2 update at vertex {vertex} (discriminant {discriminant:.3e})")]
    NoRealRoot { vertex: usize, discriminant: f64 },
}

pub struct TdglModel {
    mesh: Arc<Mesh>,
    operators: Arc<DiscreteOperators>,
    params: TdglParameters,
    epsilon: DVector<f64>,
    potential: Arc<dyn VectorPotential>,
    bcs: BoundaryConditions,
    boundary: ResolvedBoundary,
    psi_fixed: HashMap<usize, Complex64>,
    mu_fixed: HashMap<usize, f64>,
    /// Per mesh terminal: vertices and normalized injection weights.
    injection: Vec<(Vec<usize>, Vec<f64>)>,
}

impl TdglModel {
    pub fn new(
        mesh: Arc<Mesh>,
        operators: Arc<DiscreteOperators>,
        params: TdglParameters,
        bcs: BoundaryConditions,
        potential: Arc<dyn VectorPotential>,
        terminal_psi: Option<f64>,
    ) -> Result<Self, BoundaryError> {
        let boundary = bcs.resolve(&mesh)?;

        let mut psi_fixed = HashMap::new();
        if let Some(value) = terminal_psi {
            for terminal in &mesh.terminals {
                for &v in &terminal.vertices {
                    psi_fixed.insert(v, Complex64::new(value, 0.0));
                }
            }
        }
        psi_fixed.extend(boundary.pinned_psi.iter().map(|(&v, &p)| (v, p)));

        let mut mu_fixed: HashMap<usize, f64> = boundary.pinned_mu.clone();
        if let Some(v) = boundary.gauge_vertex {
            mu_fixed.insert(v, 0.0);
        }

        let injection = mesh
            .terminals
            .iter()
            .map(|t| {
                let total: f64 = t.weights.iter().sum();
                (
                    t.vertices.clone(),
                    t.weights.iter().map(|w| w / total).collect(),
                )
            })
            .collect();

        Ok(Self {
            epsilon: params.epsilon.on_vertices(&mesh),
            mesh,
            operators,
            params,
            potential,
            bcs,
            boundary,
            psi_fixed,
            mu_fixed,
            injection,
        })
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    pub fn operators(&self) -> &Arc<DiscreteOperators> {
        &self.operators
    }

    pub fn parameters(&self) -> &TdglParameters {
        &self.params
    }

    pub fn boundary(&self) -> &ResolvedBoundary {
        &self.boundary
    }

    pub fn terminal_currents(&self, time: f64) -> Vec<f64> {
        self.boundary.terminal_currents(&self.bcs, time)
    }

    /// Line integrals of `A` and `∂tA` along every edge (midpoint rule).
    pub fn edge_potential(&self, time: f64) -> (DVector<f64>, DVector<f64>) {
        let ne = self.mesh.num_edges();
        let mut a_edge = DVector::zeros(ne);
        let mut a_rate = DVector::zeros(ne);
        for (k, edge) in self.mesh.edges.iter().enumerate() {
            let d = self.mesh.nodes[edge.head()].position - self.mesh.nodes[edge.tail()].position;
            a_edge[k] = self.potential.evaluate(edge.midpoint, time).dot(d);
            a_rate[k] = self.potential.rate(edge.midpoint, time).dot(d);
        }
        (a_edge, a_rate)
    }

    /// State at `time` with the potential, terminal currents and clamps applied.
    pub fn prepare(&self, mut state: FieldState) -> FieldState {
        let (a_edge, a_rate) = self.edge_potential(state.time);
        state.a_edge = a_edge;
        state.a_rate = a_rate;
        state.terminal_currents = self.terminal_currents(state.time);
        for (&v, &p) in &self.psi_fixed {
            state.psi[v] = p;
        }
        for (&v, &m) in &self.mu_fixed {
            state.mu[v] = m;
        }
        state
    }

    pub fn supercurrent(&self, psi: &DVector<Complex64>, a_edge: &DVector<f64>) -> DVector<f64> {
        supercurrent(&self.mesh, psi, a_edge)
    }

    pub fn normal_current(&self, mu: &DVector<f64>, a_rate: &DVector<f64>) -> DVector<f64> {
        normal_current(&self.mesh, mu, a_rate)
    }

    /// Current injected into each vertex, spread over terminals by boundary length.
    pub fn current_injection(&self, currents: &[f64]) -> DVector<f64> {
        let mut q = DVector::zeros(self.mesh.num_vertices());
        for ((vertices, weights), current) in self.injection.iter().zip(currents) {
            for (&v, &w) in vertices.iter().zip(weights) {
                q[v] += current * w;
            }
        }
        q
    }

    /// Real-embedded system for the intermediate field `w` of a step of `dt`
    /// from `state`, with the vector potential `a_edge` at the end of the step:
    ///
    /// `a c/Δt w - K_A w = a (c/Δt exp(-iμΔt) ψ + (ε - |ψ|²) ψ)`
    ///
    /// with Dirichlet rows for the clamped vertices. The matrix is symmetric
    /// positive definite.
    pub fn assemble_psi(
        &self,
        state: &FieldState,
        a_edge: &DVector<f64>,
        dt: f64,
    ) -> (CsrMatrix<f64>, DVector<f64>) {
        record_assembly(|| {
            let n = self.mesh.num_vertices();
            let (u, gamma_sq) = (self.params.u, self.params.gamma.powi(2));
            let areas = &self.operators.dual_areas;
            let stiffness = self.operators.covariant_stiffness(&self.mesh, a_edge);

            let mut coo = CooMatrix::new(n, n);
            let mut rhs = DVector::from_element(n, Complex64::new(0.0, 0.0));
            for i in 0..n {
                let psi = state.psi[i];
                let abs_sq = psi.norm_sqr();
                let c = u / (1.0 + gamma_sq * abs_sq).sqrt();
                let rotated = Complex64::from_polar(1.0, -state.mu[i] * dt) * psi;
                let nonlinear = (self.epsilon[i] - abs_sq) * psi;

                coo.push(i, i, Complex64::new(areas[i] * c / dt, 0.0));
                rhs[i] = areas[i] * (rotated * (c / dt) + nonlinear);
                for (j, v) in stiffness.row_entries(i) {
                    coo.push(i, j, -v);
                }
            }

            let matrix = build_with_dirichlet(&coo, &self.psi_fixed, &mut rhs);
            (real_embedding(&matrix), split_complex(&rhs))
        })
    }

    /// Order parameter at the end of a step of `dt` from `state`, given the
    /// intermediate field `w`. Clamped vertices keep their value.
    pub fn apply_psi_update(
        &self,
        state: &FieldState,
        w: &DVector<Complex64>,
        dt: f64,
    ) -> Result<DVector<Complex64>, AdvanceError> {
        let half_gamma_sq = 0.5 * self.params.gamma.powi(2);
        let mut psi = w.clone();
        for i in 0..psi.len() {
            if self.psi_fixed.contains_key(&i) {
                continue;
            }
            let old = state.psi[i];
            let z = Complex64::from_polar(half_gamma_sq, -state.mu[i] * dt) * old;
            let w = w[i] + z * old.norm_sqr();
            let (z_sq, w_sq) = (z.norm_sqr(), w.norm_sqr());
            let b = 2.0 * (w * z.conj()).re + 1.0;
            let discriminant = b * b - 4.0 * z_sq * w_sq;
            let denominator = b + discriminant.max(0.0).sqrt();
            if !(discriminant >= 0.0 && denominator > 0.0) {
                return Err(AdvanceError::NoRealRoot {
                    vertex: i,
                    discriminant,
                });
            }
            psi[i] = w - z * (2.0 * w_sq / denominator);
        }
        Ok(psi)
    }

    /// Potential system `-K μ = q - outflow(J_s) + outflow(∂tA)` with Dirichlet
    /// rows at the gauge vertex and pinned sites.
    pub fn assemble_mu(
        &self,
        supercurrent: &DVector<f64>,
        a_rate: &DVector<f64>,
        currents: &[f64],
    ) -> (CsrMatrix<f64>, DVector<f64>) {
        record_assembly(|| {
            let n = self.mesh.num_vertices();
            let stiffness = &self.operators.stiffness;
            let field_rate = DVector::from_iterator(
                self.mesh.num_edges(),
                self.mesh
                    .edges
                    .iter()
                    .enumerate()
                    .map(|(k, e)| a_rate[k] / e.length),
            );
            let mut rhs = self.current_injection(currents) - self.operators.outflow(supercurrent)
                + self.operators.outflow(&field_rate);

            let mut coo = CooMatrix::new(n, n);
            for (i, j, v) in stiffness.triplet_iter() {
                coo.push(i, j, -*v);
            }
            let matrix = build_with_dirichlet(&coo, &self.mu_fixed, &mut rhs);
            (matrix, rhs)
        })
    }

    /// One semi-implicit step of length `dt`. Returns the new state and the number
    /// of Krylov iterations spent.
    pub fn advance(
        &self,
        state: &FieldState,
        dt: f64,
        solver: &KrylovSolver,
    ) -> Result<(FieldState, usize), AdvanceError> {
        let time = state.time + dt;
        let (a_edge, a_rate) = self.edge_potential(time);
        let currents = self.terminal_currents(time);

        let (matrix, rhs) = self.assemble_psi(state, &a_edge, dt);
        let (x, psi_stats) = solver.solve(&matrix, &rhs, Some(&split_complex(&state.psi)))?;
        let psi = self.apply_psi_update(state, &join_complex(&x), dt)?;

        let supercurrent = self.supercurrent(&psi, &a_edge);
        let (matrix, rhs) = self.assemble_mu(&supercurrent, &a_rate, &currents);
        let (mu, mu_stats) = solver.solve(&matrix, &rhs, Some(&state.mu))?;

        Ok((
            FieldState {
                time,
                psi,
                mu,
                a_edge,
                a_rate,
                terminal_currents: currents,
            },
            psi_stats.iterations + mu_stats.iterations,
        ))
    }
}

/// `J_s = Im[conj(ψ_t) U_e ψ_h] / l_e` per edge.
pub fn supercurrent(mesh: &Mesh, psi: &DVector<Complex64>, a_edge: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(
        mesh.num_edges(),
        mesh.edges.iter().enumerate().map(|(k, edge)| {
            (psi[edge.tail()].conj() * link_variable(a_edge[k]) * psi[edge.head()]).im / edge.length
        }),
    )
}

/// `J_n = -(μ_h - μ_t)/l_e - ȧ_e/l_e` per edge.
pub fn normal_current(mesh: &Mesh, mu: &DVector<f64>, a_rate: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(
        mesh.num_edges(),
        mesh.edges.iter().enumerate().map(|(k, edge)| {
            -(mu[edge.head()] - mu[edge.tail()]) / edge.length - a_rate[k] / edge.length
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::geometry::{Domain, Polygon};
    use crate::discretization::{generate_mesh, MeshOptions};
    use crate::physics::NoField;
    use approx::assert_relative_eq;

    fn strip_model(current: f64) -> TdglModel {
        let domain = Domain::new(Polygon::rectangle("film", 6.0, 2.0, [0.0, 0.0]), 0.4)
            .with_terminal(Polygon::rectangle("source", 0.2, 2.2, [-3.0, 0.0]))
            .with_terminal(Polygon::rectangle("drain", 0.2, 2.2, [3.0, 0.0]));
        let mesh = Arc::new(generate_mesh(&domain, &MeshOptions::default()).unwrap());
        let ops = Arc::new(DiscreteOperators::new(&mesh));
        let bcs = BoundaryConditions::new()
            .with_terminal("source", current)
            .with_terminal("drain", -current);
        TdglModel::new(
            mesh,
            ops,
            TdglParameters::default(),
            bcs,
            Arc::new(NoField),
            Some(0.0),
        )
        .unwrap()
    }

    #[test]
    fn injection_sums_to_terminal_current() {
        let model = strip_model(0.3);
        let q = model.current_injection(&model.terminal_currents(0.0));
        assert_relative_eq!(q.sum(), 0.0, epsilon = 1e-12);
        let source: f64 = model.mesh().terminal("source").unwrap().vertices.iter().map(|&v| q[v]).sum();
        assert_relative_eq!(source, 0.3, epsilon = 1e-12);
    }

    #[test]
    fn psi_system_is_symmetric_and_clamps_terminals() {
        let model = strip_model(0.0);
        let state = model.prepare(FieldState::uniform(model.mesh(), Complex64::new(1.0, 0.0)));
        let (a_edge, _) = model.edge_potential(0.0);
        let (matrix, rhs) = model.assemble_psi(&state, &a_edge, 0.01);
        assert_eq!(matrix, matrix.transpose());
        let v = model.mesh().terminal("drain").unwrap().vertices[0];
        assert_eq!(rhs[v], 0.0);
        assert_eq!(matrix.entry(v, v), 1.0);
        assert!(matrix.diagonal_entries().iter().all(|&d| d > 0.0));
    }

    #[test]
    fn uniform_update_conserves_the_quadratic() {
        let model = strip_model(0.0);
        let state = model.prepare(FieldState::uniform(model.mesh(), Complex64::new(0.6, 0.2)));
        let w = DVector::from_element(model.mesh().num_vertices(), Complex64::new(0.65, 0.21));
        let psi = model.apply_psi_update(&state, &w, 1e-3).unwrap();
        let gamma_sq = model.parameters().gamma.powi(2);
        let v = model
            .mesh()
            .nodes
            .iter()
            .position(|n| !n.on_boundary)
            .unwrap();
        // ψ = w + γ²/2 ψⁿ (|ψⁿ|² - |ψ|²) with μ = 0.
        let expected =
            w[v] + 0.5 * gamma_sq * state.psi[v] * (state.psi[v].norm_sqr() - psi[v].norm_sqr());
        assert_relative_eq!(psi[v].re, expected.re, epsilon = 1e-9);
        assert_relative_eq!(psi[v].im, expected.im, epsilon = 1e-9);
        // Clamped terminal vertices are untouched.
        let t = model.mesh().terminal("source").unwrap().vertices[0];
        assert_eq!(psi[t], w[t]);
    }

    #[test]
    fn unchanged_intermediate_field_leaves_psi_unchanged() {
        let model = strip_model(0.0);
        let state = model.prepare(FieldState::uniform(model.mesh(), Complex64::new(0.8, -0.3)));
        let psi = model.apply_psi_update(&state, &state.psi, 0.01).unwrap();
        for (new, old) in psi.iter().zip(state.psi.iter()) {
            assert_relative_eq!(new.re, old.re, epsilon = 1e-10);
            assert_relative_eq!(new.im, old.im, epsilon = 1e-10);
        }
    }

    #[test]
    fn runaway_intermediate_field_has_no_real_root() {
        let model = strip_model(0.0);
        let state = model.prepare(FieldState::uniform(model.mesh(), Complex64::new(1.0, 0.0)));
        // w' anti-parallel to z: 2 Re(w' z̄) + 1 < 0.
        let w = DVector::from_element(model.mesh().num_vertices(), Complex64::new(-200.0, 0.0));
        assert!(matches!(
            model.apply_psi_update(&state, &w, 0.01),
            Err(AdvanceError::NoRealRoot { .. })
        ));
    }

    #[test]
    fn normal_state_carries_the_current_as_normal_current() {
        let model = strip_model(0.2);
        let state = model.prepare(FieldState::uniform(model.mesh(), Complex64::new(0.0, 0.0)));
        let solver = KrylovSolver::new(1e-10, 5000);
        let (next, _) = model.advance(&state, 0.01, &solver).unwrap();
        // Voltage drop of a normal strip: μ falls from source to drain.
        let source = model.mesh().terminal("source").unwrap().vertices[0];
        let drain = model.mesh().terminal("drain").unwrap().vertices[0];
        assert!(next.mu[source] > next.mu[drain]);
        assert_relative_eq!(next.mu[drain], 0.0, epsilon = 1e-8);
        // Ohmic strip of width 2 and length 6: Δμ ≈ I L / W.
        assert_relative_eq!(next.mu[source] - next.mu[drain], 0.2 * 6.0 / 2.0, max_relative = 0.1);
    }

    #[test]
    fn supercurrent_of_phase_gradient() {
        let model = strip_model(0.0);
        let mesh = model.mesh().clone();
        let k = 0.1;
        let psi = DVector::from_iterator(
            mesh.num_vertices(),
            mesh.nodes.iter().map(|n| Complex64::from_polar(1.0, k * n.position.x)),
        );
        let js = model.supercurrent(&psi, &DVector::zeros(mesh.num_edges()));
        for (e, edge) in mesh.edges.iter().enumerate() {
            let d = mesh.nodes[edge.head()].position - mesh.nodes[edge.tail()].position;
            let expected = (k * d.x).sin() / edge.length;
            assert_relative_eq!(js[e], expected, epsilon = 1e-12);
        }
    }
}
