use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use glam::DVec2;
use num_complex::Complex64;
use thiserror::Error;

use crate::discretization::mesh::Mesh;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BoundaryError {
    #[error("terminal '{0}' is not attached to the mesh")]
    UnknownTerminal(String),
    #[error("terminal '{0}' has more than one current protocol")]
    DuplicateTerminal(String),
    #[error("terminal currents sum to {sum:.3e} at t = {time}, they must sum to zero")]
    CurrentImbalance { time: f64, sum: f64 },
    #[error("current of terminal '{name}' is not finite at t = {time}")]
    NonFiniteCurrent { name: String, time: f64 },
    #[error("pinned site refers to vertex {vertex}, but the mesh has {num_vertices} vertices")]
    VertexOutOfRange { vertex: usize, num_vertices: usize },
    #[error("pinned site selector matched no vertex")]
    EmptySelection,
    #[error("pinned site fixes neither psi nor mu")]
    NothingPinned,
}

/// Shared function of time, used for current protocols.
pub type TFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Local trait allowing convenient conversion into [`TFn`].
pub trait IntoTFn {
    fn into_tfn(self) -> TFn;
}

/// Constant current protocol.
pub fn c(val: f64) -> TFn {
    Arc::new(move |_| val)
}

impl IntoTFn for f64 {
    fn into_tfn(self) -> TFn {
        c(self)
    }
}

impl<F> IntoTFn for F
where
    F: Fn(f64) -> f64 + Send + Sync + 'static,
{
    fn into_tfn(self) -> TFn {
        Arc::new(self)
    }
}

/// Current injected through a named terminal; positive current flows into the film.
#[derive(Clone)]
pub struct Terminal {
    pub name: String,
    pub current: TFn,
}

impl fmt::Debug for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Terminal({}, I(0) = {})", self.name, (self.current)(0.0))
    }
}

#[derive(Clone)]
pub enum SiteSelector {
    /// Mesh vertex closest to a point.
    Nearest([f64; 2]),
    Vertex(usize),
    /// Every vertex whose position satisfies the predicate.
    Predicate(Arc<dyn Fn(DVec2) -> bool + Send + Sync>),
}

/// Vertices whose order parameter and/or potential are held fixed.
#[derive(Clone)]
pub struct PinnedSite {
    pub on: SiteSelector,
    pub psi: Option<Complex64>,
    pub mu: Option<f64>,
}

#[derive(Clone, Default)]
pub struct BoundaryConditions {
    terminals: Vec<Terminal>,
    pinned: Vec<PinnedSite>,
}

/// Boundary conditions resolved to mesh vertex indices.
#[derive(Clone, Debug, Default)]
pub struct ResolvedBoundary {
    /// For each mesh terminal, the index of its protocol in the boundary conditions.
    pub protocol_of_terminal: Vec<Option<usize>>,
    pub pinned_psi: HashMap<usize, Complex64>,
    pub pinned_mu: HashMap<usize, f64>,
    /// Vertex with `μ = 0`, absent when user-pinned `μ` sites fix the gauge.
    pub gauge_vertex: Option<usize>,
}

impl BoundaryConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_terminal(mut self, name: impl Into<String>, current: impl IntoTFn) -> Self {
        self.terminals.push(Terminal {
            name: name.into(),
            current: current.into_tfn(),
        });
        self
    }

    pub fn with_pinned(mut self, site: PinnedSite) -> Self {
        self.pinned.push(site);
        self
    }

    pub fn terminals(&self) -> &[Terminal] {
        &self.terminals
    }

    /// Currents of every terminal in declaration order.
    pub fn currents(&self, time: f64) -> Vec<f64> {
        self.terminals.iter().map(|t| (t.current)(time)).collect()
    }

    /// Check the current protocols at `samples` evenly spaced times in
    /// `[start, start + duration]`.
    pub fn check_currents(
        &self,
        start: f64,
        duration: f64,
        samples: usize,
    ) -> Result<(), BoundaryError> {
        let samples = samples.max(1);
        for k in 0..=samples {
            let time = start + duration * k as f64 / samples as f64;
            let currents = self.currents(time);
            for (terminal, current) in self.terminals.iter().zip(&currents) {
                if !current.is_finite() {
                    return Err(BoundaryError::NonFiniteCurrent {
                        name: terminal.name.clone(),
                        time,
                    });
                }
            }
            let sum: f64 = currents.iter().sum();
            let scale = currents.iter().map(|c| c.abs()).fold(1.0, f64::max);
            if sum.abs() > 1e-9 * scale {
                return Err(BoundaryError::CurrentImbalance { time, sum });
            }
        }
        Ok(())
    }

    pub fn resolve(&self, mesh: &Mesh) -> Result<ResolvedBoundary, BoundaryError> {
        let mut protocol_of_terminal = vec![None; mesh.terminals.len()];
        for (k, terminal) in self.terminals.iter().enumerate() {
            let slot = mesh
                .terminals
                .iter()
                .position(|t| t.name == terminal.name)
                .ok_or_else(|| BoundaryError::UnknownTerminal(terminal.name.clone()))?;
            if protocol_of_terminal[slot].is_some() {
                return Err(BoundaryError::DuplicateTerminal(terminal.name.clone()));
            }
            protocol_of_terminal[slot] = Some(k);
        }

        let mut pinned_psi = HashMap::new();
        let mut pinned_mu = HashMap::new();
        for site in &self.pinned {
            if site.psi.is_none() && site.mu.is_none() {
                return Err(BoundaryError::NothingPinned);
            }
            let vertices: Vec<usize> = match &site.on {
                SiteSelector::Nearest(p) => vec![mesh.nearest_vertex(DVec2::from_array(*p))],
                SiteSelector::Vertex(v) => {
                    if *v >= mesh.num_vertices() {
                        return Err(BoundaryError::VertexOutOfRange {
                            vertex: *v,
                            num_vertices: mesh.num_vertices(),
                        });
                    }
                    vec![*v]
                }
                SiteSelector::Predicate(pred) => (0..mesh.num_vertices())
                    .filter(|&v| pred(mesh.nodes[v].position))
                    .collect(),
            };
            if vertices.is_empty() {
                return Err(BoundaryError::EmptySelection);
            }
            for v in vertices {
                if let Some(psi) = site.psi {
                    pinned_psi.insert(v, psi);
                }
                if let Some(mu) = site.mu {
                    pinned_mu.insert(v, mu);
                }
            }
        }

        let gauge_vertex = if pinned_mu.is_empty() {
            Some(
                mesh.terminals
                    .last()
                    .and_then(|t| t.vertices.first().copied())
                    .unwrap_or(0),
            )
        } else {
            None
        };

        Ok(ResolvedBoundary {
            protocol_of_terminal,
            pinned_psi,
            pinned_mu,
            gauge_vertex,
        })
    }
}

impl ResolvedBoundary {
    /// Current through each mesh terminal; terminals without a protocol carry none.
    pub fn terminal_currents(&self, bcs: &BoundaryConditions, time: f64) -> Vec<f64> {
        let currents = bcs.currents(time);
        self.protocol_of_terminal
            .iter()
            .map(|slot| slot.map_or(0.0, |k| currents[k]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::geometry::{Domain, Polygon};
    use crate::discretization::{generate_mesh, MeshOptions};

    fn strip() -> Mesh {
        let domain = Domain::new(Polygon::rectangle("film", 4.0, 2.0, [0.0, 0.0]), 0.5)
            .with_terminal(Polygon::rectangle("source", 0.2, 2.2, [-2.0, 0.0]))
            .with_terminal(Polygon::rectangle("drain", 0.2, 2.2, [2.0, 0.0]));
        generate_mesh(&domain, &MeshOptions::default()).unwrap()
    }

    #[test]
    fn resolves_terminals_and_gauge() {
        let mesh = strip();
        let bcs = BoundaryConditions::new()
            .with_terminal("source", 0.5)
            .with_terminal("drain", |t: f64| -0.5 + 0.0 * t);
        let resolved = bcs.resolve(&mesh).unwrap();
        assert_eq!(resolved.protocol_of_terminal, vec![Some(0), Some(1)]);
        let drain = mesh.terminal("drain").unwrap();
        assert_eq!(resolved.gauge_vertex, Some(drain.vertices[0]));
        assert_eq!(resolved.terminal_currents(&bcs, 1.0), vec![0.5, -0.5]);
        assert!(bcs.check_currents(0.0, 10.0, 10).is_ok());
    }

    #[test]
    fn rejects_unknown_terminal_and_imbalance() {
        let mesh = strip();
        let unknown = BoundaryConditions::new().with_terminal("gate", 0.0);
        assert_eq!(
            unknown.resolve(&mesh).unwrap_err(),
            BoundaryError::UnknownTerminal("gate".into())
        );

        let ramp = BoundaryConditions::new()
            .with_terminal("source", |t: f64| t)
            .with_terminal("drain", -1.0);
        assert!(matches!(
            ramp.check_currents(0.0, 2.0, 4),
            Err(BoundaryError::CurrentImbalance { .. })
        ));
    }

    #[test]
    fn currents_are_checked_over_the_run_window() {
        let switched = BoundaryConditions::new()
            .with_terminal("source", |t: f64| if t < 3.0 { 1.0 } else { 2.0 })
            .with_terminal("drain", -1.0);
        assert!(switched.check_currents(0.0, 2.0, 8).is_ok());
        match switched.check_currents(5.0, 2.0, 8) {
            Err(BoundaryError::CurrentImbalance { time, sum }) => {
                assert_eq!(time, 5.0);
                assert_eq!(sum, 1.0);
            }
            other => panic!("expected an imbalance, got {other:?}"),
        }
    }

    #[test]
    fn pinned_mu_replaces_gauge_vertex() {
        let mesh = strip();
        let bcs = BoundaryConditions::new().with_pinned(PinnedSite {
            on: SiteSelector::Nearest([0.0, 0.0]),
            psi: Some(Complex64::new(0.0, 0.0)),
            mu: Some(0.0),
        });
        let resolved = bcs.resolve(&mesh).unwrap();
        assert_eq!(resolved.gauge_vertex, None);
        assert_eq!(resolved.pinned_psi.len(), 1);

        let bad = BoundaryConditions::new().with_pinned(PinnedSite {
            on: SiteSelector::Vertex(usize::MAX),
            psi: None,
            mu: Some(0.0),
        });
        assert!(matches!(
            bad.resolve(&mesh),
            Err(BoundaryError::VertexOutOfRange { .. })
        ));
    }
}
