//! Physical quantities derived from a field snapshot.

use std::collections::VecDeque;
use std::f64::consts::PI;

use glam::DVec2;
use nalgebra::DVector;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::discretization::geometry::Polygon;
use crate::discretization::mesh::Mesh;
use crate::physics::operators::link_variable;
use crate::physics::state::FieldState;
use crate::physics::tdgl::{normal_current, supercurrent};

/// Named polyline across which the net current is measured.
///
/// Current is counted positive when it crosses from the left to the right of
/// the direction of travel along the polyline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPath {
    pub name: String,
    pub points: Vec<[f64; 2]>,
}

impl MeasurementPath {
    pub fn new(name: impl Into<String>, points: Vec<[f64; 2]>) -> Result<Self, ConfigError> {
        let name = name.into();
        if points.len() < 2 {
            return Err(ConfigError::PathTooShort(name));
        }
        Ok(Self { name, points })
    }

    /// Straight two-point path.
    pub fn line(name: impl Into<String>, from: [f64; 2], to: [f64; 2]) -> Self {
        Self {
            name: name.into(),
            points: vec![from, to],
        }
    }

    /// Primal edges whose segment crosses the polyline, each with the sign of a
    /// tail-to-head flux. Currents through them are weighted by the dual length.
    pub fn crossings(&self, mesh: &Mesh) -> Vec<(usize, f64)> {
        let nseg = self.points.len().saturating_sub(1);
        let mut crossings = Vec::new();
        for (k, edge) in mesh.edges.iter().enumerate() {
            let p = mesh.nodes[edge.tail()].position;
            let q = mesh.nodes[edge.head()].position;
            for s in 0..nseg {
                let a = DVec2::from(self.points[s]);
                let b = DVec2::from(self.points[s + 1]);
                if let Some(sign) = crossing_sign(p, q, a, b, s + 1 == nseg) {
                    crossings.push((k, sign));
                    break;
                }
            }
        }
        crossings
    }
}

/// Sign of the crossing of edge `p → q` over segment `a → b`: `+1` left to right,
/// `-1` right to left. Sides are half-open so a vertex on the line is counted once;
/// the segment is half-open at `b` unless it ends the polyline.
fn crossing_sign(p: DVec2, q: DVec2, a: DVec2, b: DVec2, closed_end: bool) -> Option<f64> {
    let s = b - a;
    let len_sq = s.length_squared();
    if len_sq == 0.0 {
        return None;
    }
    let sp = s.perp_dot(p - a);
    let sq = s.perp_dot(q - a);
    let (left_p, left_q) = (sp >= 0.0, sq >= 0.0);
    if left_p == left_q {
        return None;
    }
    let x = p + (q - p) * (sp / (sp - sq));
    let u = (x - a).dot(s) / len_sq;
    let inside = u >= 0.0 && (u < 1.0 || (closed_end && u <= 1.0));
    inside.then_some(if left_p { 1.0 } else { -1.0 })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observables {
    /// Supercurrent density per edge.
    pub supercurrent: Vec<f64>,
    pub normal_current: Vec<f64>,
    /// Phase winding per cell in units of 2π.
    pub vorticity: Vec<f64>,
    /// Net current through each measurement path, in path order.
    pub path_currents: Vec<f64>,
    /// `μ_a - μ_b` per probe pair.
    pub probe_voltages: Vec<f64>,
    /// `θ_a - θ_b` per probe pair, wrapped to `(-π, π]`.
    #[serde(default)]
    pub probe_phases: Vec<f64>,
    pub max_abs_psi: f64,
    pub mean_abs_psi: f64,
}

impl Observables {
    pub fn compute(mesh: &Mesh, state: &FieldState, paths: &[MeasurementPath]) -> Self {
        let js = supercurrent(mesh, &state.psi, &state.a_edge);
        let jn = normal_current(mesh, &state.mu, &state.a_rate);

        let path_currents = paths
            .iter()
            .map(|path| {
                path.crossings(mesh)
                    .into_iter()
                    .map(|(k, sign)| sign * (js[k] + jn[k]) * mesh.edges[k].dual_length)
                    .sum()
            })
            .collect();

        let probe_voltages = mesh
            .probes
            .iter()
            .map(|&(a, b)| state.mu[a] - state.mu[b])
            .collect();
        let probe_phases = mesh
            .probes
            .iter()
            .map(|&(a, b)| phase_difference(&state.psi, a, b))
            .collect();

        let magnitude = state.psi_magnitude();
        let mean_abs_psi = if magnitude.is_empty() {
            0.0
        } else {
            magnitude.mean()
        };

        Self {
            vorticity: vorticity(mesh, &state.psi, &state.a_edge),
            supercurrent: js.iter().copied().collect(),
            normal_current: jn.iter().copied().collect(),
            path_currents,
            probe_voltages,
            probe_phases,
            max_abs_psi: magnitude.iter().copied().fold(0.0, f64::max),
            mean_abs_psi,
        }
    }

    /// Total number of vortices (net winding) in the film.
    pub fn net_winding(&self) -> f64 {
        self.vorticity.iter().sum()
    }
}

/// `θ_a - θ_b` wrapped to `(-π, π]`; zero when either amplitude vanishes.
pub fn phase_difference(psi: &DVector<Complex64>, a: usize, b: usize) -> f64 {
    (psi[a] * psi[b].conj()).arg()
}

/// Fluxoid through a closed loop in units of the flux quantum, split into the
/// flux of the vector potential and the supercurrent contribution
/// `∮ J_s/|ψ|² · dl`. Their sum is close to an integer when the loop runs
/// through superconducting film.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fluxoid {
    pub flux_part: f64,
    pub supercurrent_part: f64,
}

impl Fluxoid {
    pub fn total(&self) -> f64 {
        self.flux_part + self.supercurrent_part
    }
}

/// Fluxoid around `polygon`, evaluated on the closed chain of mesh edges that
/// follows its outline.
pub fn polygon_fluxoid(mesh: &Mesh, state: &FieldState, polygon: &Polygon) -> Fluxoid {
    let mut flux = 0.0;
    let mut gauge_invariant = 0.0;
    for (k, forward) in edge_loop(mesh, polygon) {
        let edge = &mesh.edges[k];
        let (from, to, a) = if forward {
            (edge.tail(), edge.head(), state.a_edge[k])
        } else {
            (edge.head(), edge.tail(), -state.a_edge[k])
        };
        flux += a;
        gauge_invariant += (state.psi[from].conj() * link_variable(a) * state.psi[to]).arg();
    }
    Fluxoid {
        flux_part: flux / (2.0 * PI),
        supercurrent_part: gauge_invariant / (2.0 * PI),
    }
}

/// Closed chain of `(edge, traversed tail → head)` through the vertices nearest
/// to the outline of `polygon`.
pub fn edge_loop(mesh: &Mesh, polygon: &Polygon) -> Vec<(usize, bool)> {
    let (min_edge, _) = mesh.edge_length_range();
    let step = 0.25 * min_edge;
    let mut anchors: Vec<usize> = Vec::new();
    if step.is_finite() && step > 0.0 {
        for (a, b) in polygon.segments() {
            let n = ((b - a).length() / step).ceil().max(1.0) as usize;
            for i in 0..n {
                let v = mesh.nearest_vertex(a + (b - a) * (i as f64 / n as f64));
                if anchors.last() != Some(&v) {
                    anchors.push(v);
                }
            }
        }
    }
    while anchors.len() > 1 && anchors.first() == anchors.last() {
        anchors.pop();
    }
    if anchors.len() < 2 {
        return Vec::new();
    }

    let mut chain = Vec::new();
    for (i, &from) in anchors.iter().enumerate() {
        let to = anchors[(i + 1) % anchors.len()];
        chain.extend(shortest_edge_path(mesh, from, to));
    }
    chain
}

/// Fewest-edge path from `from` to `to`.
fn shortest_edge_path(mesh: &Mesh, from: usize, to: usize) -> Vec<(usize, bool)> {
    let mut came_by: Vec<Option<usize>> = vec![None; mesh.num_vertices()];
    let mut visited = vec![false; mesh.num_vertices()];
    let mut queue = VecDeque::from([from]);
    visited[from] = true;
    while let Some(v) = queue.pop_front() {
        if v == to {
            break;
        }
        for &k in &mesh.nodes[v].edge_ids {
            let edge = &mesh.edges[k];
            let next = if edge.tail() == v { edge.head() } else { edge.tail() };
            if !visited[next] {
                visited[next] = true;
                came_by[next] = Some(k);
                queue.push_back(next);
            }
        }
    }

    let mut path = Vec::new();
    let mut v = to;
    while let Some(k) = came_by[v] {
        let edge = &mesh.edges[k];
        let forward = edge.head() == v;
        path.push((k, forward));
        v = if forward { edge.tail() } else { edge.head() };
    }
    path.reverse();
    path
}

/// Winding of the gauge-invariant phase around every cell, in units of 2π.
pub fn vorticity(mesh: &Mesh, psi: &DVector<Complex64>, a_edge: &DVector<f64>) -> Vec<f64> {
    mesh.cells
        .iter()
        .map(|cell| {
            let mut winding = 0.0;
            for side in 0..3 {
                let from = cell.vertices[side];
                let to = cell.vertices[(side + 1) % 3];
                let k = cell.edge_ids[side];
                let edge = &mesh.edges[k];
                let link = if edge.tail() == from {
                    link_variable(a_edge[k])
                } else {
                    link_variable(a_edge[k]).conj()
                };
                winding += (psi[from].conj() * link * psi[to]).arg();
            }
            winding / (2.0 * PI)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::geometry::{Domain, Polygon};
    use crate::discretization::{generate_mesh, MeshOptions};
    use approx::assert_relative_eq;

    fn square() -> Mesh {
        let domain = Domain::new(Polygon::rectangle("film", 4.0, 4.0, [0.0, 0.0]), 0.4)
            .with_probe_points([-1.5, 0.0], [1.5, 0.0]);
        generate_mesh(&domain, &MeshOptions::default()).unwrap()
    }

    #[test]
    fn single_vortex_winds_once() {
        let mesh = square();
        let center = DVec2::new(0.05, 0.03);
        let psi = DVector::from_iterator(
            mesh.num_vertices(),
            mesh.nodes.iter().map(|n| {
                let d = n.position - center;
                Complex64::from_polar(1.0, d.y.atan2(d.x))
            }),
        );
        let zero = DVector::zeros(mesh.num_edges());
        let vorticity = vorticity(&mesh, &psi, &zero);
        let total: f64 = vorticity.iter().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        let max = vorticity.iter().copied().fold(0.0, f64::max);
        assert_relative_eq!(max, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn uniform_flow_through_a_cut() {
        let mesh = square();
        let mut state = FieldState::uniform(&mesh, Complex64::new(0.0, 0.0));
        // μ falling linearly in x drives a unit normal current in +x.
        for (i, node) in mesh.nodes.iter().enumerate() {
            state.mu[i] = -node.position.x;
        }
        let upward = MeasurementPath::line("up", [0.0, -2.5], [0.0, 2.5]);
        let downward = MeasurementPath::line("down", [0.0, 2.5], [0.0, -2.5]);
        let obs = Observables::compute(&mesh, &state, &[upward, downward]);
        // Width 4 times unit current density.
        assert_relative_eq!(obs.path_currents[0], 4.0, max_relative = 0.05);
        assert_relative_eq!(obs.path_currents[1], -obs.path_currents[0], epsilon = 1e-9);
        assert_eq!(obs.supercurrent.len(), mesh.num_edges());
        assert_relative_eq!(obs.max_abs_psi, 0.0);
        // Probes at x = -1.5 and 1.5.
        assert_eq!(obs.probe_voltages.len(), 1);
        assert!(obs.probe_voltages[0] > 2.5);
    }

    fn vortex_at(mesh: &Mesh, center: DVec2) -> FieldState {
        let psi = DVector::from_iterator(
            mesh.num_vertices(),
            mesh.nodes.iter().map(|n| {
                let d = n.position - center;
                Complex64::from_polar(1.0, d.y.atan2(d.x))
            }),
        );
        FieldState {
            psi,
            ..FieldState::uniform(mesh, Complex64::new(1.0, 0.0))
        }
    }

    #[test]
    fn edge_loop_is_closed() {
        let mesh = square();
        let ring = Polygon::circle("ring", 1.2, 24, [0.0, 0.0]);
        let chain = edge_loop(&mesh, &ring);
        assert!(chain.len() > 8);
        let ends = |&(k, forward): &(usize, bool)| {
            let e = &mesh.edges[k];
            if forward { (e.tail(), e.head()) } else { (e.head(), e.tail()) }
        };
        for pair in chain.windows(2) {
            assert_eq!(ends(&pair[0]).1, ends(&pair[1]).0);
        }
        assert_eq!(ends(chain.last().unwrap()).1, ends(&chain[0]).0);
    }

    #[test]
    fn fluxoid_counts_an_enclosed_vortex() {
        let mesh = square();
        let state = vortex_at(&mesh, DVec2::new(0.05, 0.03));
        let around = Polygon::circle("around", 1.2, 24, [0.0, 0.0]);
        let fluxoid = polygon_fluxoid(&mesh, &state, &around);
        assert_relative_eq!(fluxoid.flux_part, 0.0);
        assert_relative_eq!(fluxoid.total(), 1.0, epsilon = 1e-9);

        let beside = Polygon::circle("beside", 0.5, 16, [1.2, 1.2]);
        assert_relative_eq!(polygon_fluxoid(&mesh, &state, &beside).total(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn fluxoid_splits_flux_and_supercurrent() {
        let mesh = square();
        let mut state = FieldState::uniform(&mesh, Complex64::new(1.0, 0.0));
        // Symmetric gauge of a uniform field bz: A = bz/2 (-y, x).
        let bz = 0.2;
        for (k, edge) in mesh.edges.iter().enumerate() {
            let d = mesh.nodes[edge.head()].position - mesh.nodes[edge.tail()].position;
            let m = edge.midpoint;
            state.a_edge[k] = 0.5 * bz * DVec2::new(-m.y, m.x).dot(d);
        }
        let ring = Polygon::circle("ring", 1.2, 24, [0.0, 0.0]);
        let chain = edge_loop(&mesh, &ring);
        let enclosed: f64 = {
            // Shoelace area of the edge chain.
            let mut twice = 0.0;
            for &(k, forward) in &chain {
                let e = &mesh.edges[k];
                let (p, q) = if forward { (e.tail(), e.head()) } else { (e.head(), e.tail()) };
                twice += mesh.nodes[p].position.perp_dot(mesh.nodes[q].position);
            }
            0.5 * twice
        };
        let fluxoid = polygon_fluxoid(&mesh, &state, &ring);
        assert_relative_eq!(fluxoid.flux_part, bz * enclosed / (2.0 * PI), max_relative = 1e-9);
        // A uniform ψ carries the Meissner screening current, which cancels the flux.
        assert_relative_eq!(fluxoid.total(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn probe_phase_difference() {
        let mesh = square();
        let mut state = FieldState::uniform(&mesh, Complex64::new(1.0, 0.0));
        for (i, node) in mesh.nodes.iter().enumerate() {
            state.psi[i] = Complex64::from_polar(0.9, 0.2 * node.position.x);
        }
        let obs = Observables::compute(&mesh, &state, &[]);
        let (a, b) = mesh.probes[0];
        let expected = 0.2 * (mesh.nodes[a].position.x - mesh.nodes[b].position.x);
        assert_eq!(obs.probe_phases.len(), 1);
        assert_relative_eq!(obs.probe_phases[0], expected, epsilon = 1e-12);
        assert!(obs.probe_phases[0] < 0.0);
    }

    #[test]
    fn short_paths_are_rejected() {
        assert_eq!(
            MeasurementPath::new("p", vec![[0.0, 0.0]]),
            Err(ConfigError::PathTooShort("p".into()))
        );
    }
}
