use std::collections::HashMap;

use glam::DVec2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::geometry::Polygon;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshGenerationError {
    #[error("polygon '{name}' has {count} points, at least 3 are required")]
    TooFewPoints { name: String, count: usize },
    #[error("polygon '{name}' has zero area")]
    ZeroArea { name: String },
    #[error("polygon '{name}' is self-intersecting")]
    SelfIntersecting { name: String },
    #[error("polygon '{name}' has a non-finite point")]
    NonFinitePoint { name: String },
    #[error("outlines of '{first}' and '{second}' intersect")]
    IntersectingBoundaries { first: String, second: String },
    #[error("hole '{name}' is not inside the film")]
    HoleOutsideFilm { name: String },
    #[error("maximum edge length must be positive and finite, got {0}")]
    InvalidEdgeLength(f64),
    #[error("cell {cell} is degenerate (area {area:.3e})")]
    DegenerateCell { cell: usize, area: f64 },
    #[error("edge ({0}, {1}) is shared by more than two cells")]
    NonManifoldEdge(usize, usize),
    #[error("cell {cell} references vertex {vertex}, but the mesh has {num_vertices} vertices")]
    VertexOutOfRange {
        cell: usize,
        vertex: usize,
        num_vertices: usize,
    },
    #[error("terminal '{0}' does not contain any boundary vertex")]
    EmptyTerminal(String),
    #[error("triangulation did not converge after {passes} refinement passes")]
    NotConverged { passes: usize },
    #[error("refinement needs more than {limit} vertices")]
    VertexBudgetExceeded { limit: usize },
    #[error("triangulation failed: {0}")]
    Triangulation(String),
    #[error("triangulation produced no cells")]
    EmptyMesh,
}

/// A mesh vertex and its finite-volume control volume.
#[derive(Clone, Debug)]
pub struct Node {
    pub position: DVec2,
    /// Area of the dual (Voronoi) cell around the vertex.
    pub dual_area: f64,
    pub on_boundary: bool,
    pub edge_ids: Vec<usize>,
}

/// A triangle, vertices in counter-clockwise order.
#[derive(Clone, Debug)]
pub struct Cell {
    pub id: usize,
    pub vertices: [usize; 3],
    pub area: f64,
    pub circumcenter: DVec2,
    /// Sides (v0,v1), (v1,v2), (v2,v0).
    pub edge_ids: [usize; 3],
}

/// An edge between two vertices, `vertices[0] < vertices[1]`.
/// The edge is directed from `vertices[0]` (tail) to `vertices[1]` (head).
#[derive(Clone, Debug)]
pub struct Edge {
    pub vertices: [usize; 2],
    pub length: f64,
    /// Length of the dual edge joining the circumcenters of the adjacent cells
    /// (signed, cotangent formula).
    pub dual_length: f64,
    pub midpoint: DVec2,
    /// Tuple of (cell, optional second cell). `None` marks a boundary edge.
    pub cell_ids: (usize, Option<usize>),
}

impl Edge {
    pub fn is_boundary(&self) -> bool {
        self.cell_ids.1.is_none()
    }

    pub fn tail(&self) -> usize {
        self.vertices[0]
    }

    pub fn head(&self) -> usize {
        self.vertices[1]
    }
}

/// Boundary vertices belonging to a named current terminal.
#[derive(Clone, Debug)]
pub struct TerminalSites {
    pub name: String,
    pub vertices: Vec<usize>,
    /// Share of the terminal's boundary length attributed to each vertex.
    pub weights: Vec<f64>,
}

/// The complete computational grid.
#[derive(Clone, Debug)]
pub struct Mesh {
    pub nodes: Vec<Node>,
    pub cells: Vec<Cell>,
    pub edges: Vec<Edge>,
    pub boundary_vertices: Vec<usize>,
    pub terminals: Vec<TerminalSites>,
    /// Vertex pairs used as voltage probes.
    pub probes: Vec<(usize, usize)>,
}

/// Plain-array form of a mesh, used for persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshData {
    pub vertices: Vec<[f64; 2]>,
    pub cells: Vec<[usize; 3]>,
    pub edges: Vec<[usize; 2]>,
}

/// Relative area below which a triangle counts as degenerate.
const DEGENERATE_AREA: f64 = 1e-12;

impl Mesh {
    /// Build a mesh from vertex coordinates and triangle indices, computing every
    /// derived geometric quantity.
    pub fn from_triangulation(
        points: Vec<DVec2>,
        triangles: Vec<[usize; 3]>,
    ) -> Result<Self, MeshGenerationError> {
        if triangles.is_empty() {
            return Err(MeshGenerationError::EmptyMesh);
        }
        let num_vertices = points.len();

        let scale = bounding_box_diagonal(&points).powi(2);
        let mut cells = Vec::with_capacity(triangles.len());
        for (id, tri) in triangles.into_iter().enumerate() {
            for &v in &tri {
                if v >= num_vertices {
                    return Err(MeshGenerationError::VertexOutOfRange {
                        cell: id,
                        vertex: v,
                        num_vertices,
                    });
                }
            }
            let mut tri = tri;
            let mut area = signed_triangle_area(points[tri[0]], points[tri[1]], points[tri[2]]);
            if area < 0.0 {
                tri.swap(1, 2);
                area = -area;
            }
            if area <= DEGENERATE_AREA * scale {
                return Err(MeshGenerationError::DegenerateCell { cell: id, area });
            }
            cells.push(Cell {
                id,
                vertices: tri,
                area,
                circumcenter: circumcenter(points[tri[0]], points[tri[1]], points[tri[2]]),
                edge_ids: [0; 3],
            });
        }

        // Unique edges and edge/cell adjacency.
        let mut edge_index: HashMap<[usize; 2], usize> = HashMap::new();
        let mut edges: Vec<Edge> = Vec::new();
        for cell in cells.iter_mut() {
            let [a, b, c] = cell.vertices;
            for (k, (i, j)) in [(a, b), (b, c), (c, a)].into_iter().enumerate() {
                let key = if i < j { [i, j] } else { [j, i] };
                let id = match edge_index.get(&key) {
                    Some(&id) => {
                        let edge = &mut edges[id];
                        if edge.cell_ids.1.is_some() {
                            return Err(MeshGenerationError::NonManifoldEdge(key[0], key[1]));
                        }
                        edge.cell_ids.1 = Some(cell.id);
                        id
                    }
                    None => {
                        let (p, q) = (points[key[0]], points[key[1]]);
                        edges.push(Edge {
                            vertices: key,
                            length: p.distance(q),
                            dual_length: 0.0,
                            midpoint: (p + q) * 0.5,
                            cell_ids: (cell.id, None),
                        });
                        edge_index.insert(key, edges.len() - 1);
                        edges.len() - 1
                    }
                };
                cell.edge_ids[k] = id;
            }
        }

        let mut nodes: Vec<Node> = points
            .iter()
            .map(|&position| Node {
                position,
                dual_area: 0.0,
                on_boundary: false,
                edge_ids: Vec::new(),
            })
            .collect();

        for (id, edge) in edges.iter().enumerate() {
            nodes[edge.tail()].edge_ids.push(id);
            nodes[edge.head()].edge_ids.push(id);
            if edge.is_boundary() {
                nodes[edge.tail()].on_boundary = true;
                nodes[edge.head()].on_boundary = true;
            }
        }

        // Cotangent dual edge lengths and mixed Voronoi control volumes.
        for cell in &cells {
            let [a, b, c] = cell.vertices;
            let corners = [(a, b, c), (b, c, a), (c, a, b)];
            let cots: Vec<f64> = corners
                .iter()
                .map(|&(k, i, j)| cotangent(points[k], points[i], points[j]))
                .collect();

            // Side k of the cell lies opposite the corner (k + 2) % 3.
            for k in 0..3 {
                let edge = &mut edges[cell.edge_ids[k]];
                edge.dual_length += 0.5 * edge.length * cots[(k + 2) % 3];
            }

            let obtuse = cots.iter().position(|&cot| cot < 0.0);
            for (idx, &(v, _, _)) in corners.iter().enumerate() {
                let share = match obtuse {
                    Some(o) if o == idx => cell.area / 2.0,
                    Some(_) => cell.area / 4.0,
                    None => {
                        let (i, j) = (corners[(idx + 1) % 3].0, corners[(idx + 2) % 3].0);
                        let p = points[v];
                        (p.distance_squared(points[i]) * cots[(idx + 2) % 3]
                            + p.distance_squared(points[j]) * cots[(idx + 1) % 3])
                            / 8.0
                    }
                };
                nodes[v].dual_area += share;
            }
        }

        let boundary_vertices = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.on_boundary)
            .map(|(i, _)| i)
            .collect();

        Ok(Self {
            nodes,
            cells,
            edges,
            boundary_vertices,
            terminals: Vec::new(),
            probes: Vec::new(),
        })
    }

    /// Rebuild a mesh from its persisted form.
    pub fn from_data(data: &MeshData) -> Result<Self, MeshGenerationError> {
        let points = data.vertices.iter().map(|p| DVec2::from_array(*p)).collect();
        Self::from_triangulation(points, data.cells.clone())
    }

    pub fn to_data(&self) -> MeshData {
        MeshData {
            vertices: self.nodes.iter().map(|n| n.position.to_array()).collect(),
            cells: self.cells.iter().map(|c| c.vertices).collect(),
            edges: self.edges.iter().map(|e| e.vertices).collect(),
        }
    }

    /// Attach terminals: every boundary vertex inside (or on) a terminal polygon
    /// belongs to it.
    pub fn with_terminals(mut self, terminals: &[Polygon]) -> Result<Self, MeshGenerationError> {
        let tol = 1e-9 * bounding_box_diagonal(&self.positions());
        let mut sites = Vec::with_capacity(terminals.len());
        for polygon in terminals {
            let vertices: Vec<usize> = self
                .boundary_vertices
                .iter()
                .copied()
                .filter(|&v| polygon.contains_or_touches(self.nodes[v].position, tol))
                .collect();
            if vertices.is_empty() {
                return Err(MeshGenerationError::EmptyTerminal(polygon.name.clone()));
            }

            let mut weights = vec![0.0; vertices.len()];
            let slot: HashMap<usize, usize> =
                vertices.iter().enumerate().map(|(k, &v)| (v, k)).collect();
            for edge in self.edges.iter().filter(|e| e.is_boundary()) {
                if let (Some(&a), Some(&b)) = (slot.get(&edge.tail()), slot.get(&edge.head())) {
                    weights[a] += edge.length / 2.0;
                    weights[b] += edge.length / 2.0;
                }
            }
            // Isolated vertices still carry current.
            let fallback = weights.iter().cloned().fold(0.0, f64::max).max(1.0);
            for w in weights.iter_mut().filter(|w| **w == 0.0) {
                *w = fallback;
            }

            sites.push(TerminalSites {
                name: polygon.name.clone(),
                vertices,
                weights,
            });
        }
        self.terminals = sites;
        Ok(self)
    }

    /// Attach voltage probes at the vertices nearest to each point pair.
    pub fn with_probes(mut self, probe_points: &[([f64; 2], [f64; 2])]) -> Self {
        self.probes = probe_points
            .iter()
            .map(|(a, b)| {
                (
                    self.nearest_vertex(DVec2::from_array(*a)),
                    self.nearest_vertex(DVec2::from_array(*b)),
                )
            })
            .collect();
        self
    }

    pub fn nearest_vertex(&self, p: DVec2) -> usize {
        self.nodes
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.position
                    .distance_squared(p)
                    .total_cmp(&b.position.distance_squared(p))
            })
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    pub fn num_vertices(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn positions(&self) -> Vec<DVec2> {
        self.nodes.iter().map(|n| n.position).collect()
    }

    pub fn dual_areas(&self) -> Vec<f64> {
        self.nodes.iter().map(|n| n.dual_area).collect()
    }

    pub fn total_area(&self) -> f64 {
        self.cells.iter().map(|c| c.area).sum()
    }

    pub fn terminal(&self, name: &str) -> Option<&TerminalSites> {
        self.terminals.iter().find(|t| t.name == name)
    }

    /// Smallest interior angle over all cells, in degrees.
    pub fn min_angle_deg(&self) -> f64 {
        self.cells
            .iter()
            .map(|c| {
                let [a, b, c] = c.vertices.map(|v| self.nodes[v].position);
                min_triangle_angle(a, b, c)
            })
            .fold(f64::INFINITY, f64::min)
            .to_degrees()
    }

    /// (min, max) edge length.
    pub fn edge_length_range(&self) -> (f64, f64) {
        self.edges.iter().fold((f64::INFINITY, 0.0_f64), |(lo, hi), e| {
            (lo.min(e.length), hi.max(e.length))
        })
    }
}

pub fn signed_triangle_area(a: DVec2, b: DVec2, c: DVec2) -> f64 {
    0.5 * (b - a).perp_dot(c - a)
}

pub fn circumcenter(a: DVec2, b: DVec2, c: DVec2) -> DVec2 {
    let bp = b - a;
    let cp = c - a;
    let d = 2.0 * bp.perp_dot(cp);
    let (b2, c2) = (bp.length_squared(), cp.length_squared());
    a + DVec2::new(cp.y * b2 - bp.y * c2, bp.x * c2 - cp.x * b2) / d
}

/// Cotangent of the angle at `k` in the triangle (k, i, j).
fn cotangent(k: DVec2, i: DVec2, j: DVec2) -> f64 {
    let (u, v) = (i - k, j - k);
    u.dot(v) / u.perp_dot(v).abs()
}

pub fn min_triangle_angle(a: DVec2, b: DVec2, c: DVec2) -> f64 {
    let angle = |p: DVec2, q: DVec2, r: DVec2| (q - p).angle_to(r - p).abs();
    angle(a, b, c).min(angle(b, c, a)).min(angle(c, a, b))
}

fn bounding_box_diagonal(points: &[DVec2]) -> f64 {
    let (lo, hi) = points.iter().fold(
        (DVec2::splat(f64::INFINITY), DVec2::splat(f64::NEG_INFINITY)),
        |(lo, hi), p| (lo.min(*p), hi.max(*p)),
    );
    if points.is_empty() {
        0.0
    } else {
        lo.distance(hi)
    }
}
