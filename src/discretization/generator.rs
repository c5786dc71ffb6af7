use std::collections::{HashMap, HashSet};

use glam::DVec2;
use log::{debug, info};
use spade::{
    AngleLimit, ConstrainedDelaunayTriangulation, Point2, RefinementParameters,
    Triangulation,
};
use spade::handles::FixedVertexHandle;

use super::geometry::{segments_intersect, Domain, Polygon};
use super::mesh::{signed_triangle_area, Mesh, MeshGenerationError};

/// Controls for [`generate_mesh`].
#[derive(Clone, Debug)]
pub struct MeshOptions {
    /// Overrides [`Domain::max_edge_length`] when set.
    pub max_edge_length: Option<f64>,
    /// Cells with a smaller interior angle are refined.
    pub min_angle_deg: f64,
    /// Rounds of boundary splitting after the Delaunay refinement.
    pub max_refinement_passes: usize,
    /// Upper bound on the number of mesh vertices.
    pub max_vertices: usize,
    /// Laplacian smoothing sweeps over interior vertices, 0 disables it.
    pub smoothing_iterations: usize,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            max_edge_length: None,
            min_angle_deg: 20.0,
            max_refinement_passes: 16,
            max_vertices: 1_000_000,
            smoothing_iterations: 0,
        }
    }
}

/// Corners sharper than this keep their small angles.
const SHARP_CORNER: f64 = std::f64::consts::FRAC_PI_3;

type Segment = (DVec2, DVec2);

/// Boundary of `polygon` cut into pieces no longer than `spacing`.
fn sample_outline(polygon: &Polygon, spacing: f64) -> Vec<Segment> {
    let mut segments = Vec::new();
    for (a, b) in polygon.segments() {
        let pieces = ((a.distance(b) / spacing).ceil() as usize).max(1);
        for k in 0..pieces {
            segments.push((
                a.lerp(b, k as f64 / pieces as f64),
                a.lerp(b, (k + 1) as f64 / pieces as f64),
            ));
        }
    }
    segments
}

fn sharp_corners(polygon: &Polygon) -> impl Iterator<Item = DVec2> + '_ {
    let vertices: Vec<DVec2> = polygon.vertices().collect();
    let n = vertices.len();
    (0..n).filter_map(move |i| {
        let (prev, a, next) = (vertices[(i + n - 1) % n], vertices[i], vertices[(i + 1) % n]);
        ((prev - a).angle_to(next - a).abs() < SHARP_CORNER).then_some(a)
    })
}

fn validate_polygon(polygon: &Polygon) -> Result<(), MeshGenerationError> {
    if polygon.points.len() < 3 {
        return Err(MeshGenerationError::TooFewPoints {
            name: polygon.name.clone(),
            count: polygon.points.len(),
        });
    }
    if !polygon.vertices().all(|p| p.is_finite()) {
        return Err(MeshGenerationError::NonFinitePoint {
            name: polygon.name.clone(),
        });
    }
    let scale = polygon.perimeter().powi(2);
    if polygon.area() <= 1e-12 * scale {
        return Err(MeshGenerationError::ZeroArea {
            name: polygon.name.clone(),
        });
    }
    if polygon.is_self_intersecting() {
        return Err(MeshGenerationError::SelfIntersecting {
            name: polygon.name.clone(),
        });
    }
    Ok(())
}

fn outlines_cross(a: &Polygon, b: &Polygon) -> bool {
    a.segments()
        .any(|(p, q)| b.segments().any(|(r, s)| segments_intersect(p, q, r, s)))
}

fn validate_domain(domain: &Domain, spacing: f64) -> Result<(), MeshGenerationError> {
    if !(spacing.is_finite() && spacing > 0.0) {
        return Err(MeshGenerationError::InvalidEdgeLength(spacing));
    }
    validate_polygon(&domain.film)?;
    for (i, hole) in domain.holes.iter().enumerate() {
        validate_polygon(hole)?;
        if !hole.vertices().all(|p| domain.film.contains(p)) {
            return Err(MeshGenerationError::HoleOutsideFilm {
                name: hole.name.clone(),
            });
        }
        let crossing = std::iter::once(&domain.film)
            .chain(&domain.holes[..i])
            .find(|other| outlines_cross(other, hole));
        if let Some(other) = crossing {
            return Err(MeshGenerationError::IntersectingBoundaries {
                first: other.name.clone(),
                second: hole.name.clone(),
            });
        }
    }
    for terminal in &domain.terminals {
        validate_polygon(terminal)?;
    }
    Ok(())
}

fn key(p: DVec2) -> (u64, u64) {
    (p.x.to_bits(), p.y.to_bits())
}

/// Constrained Delaunay triangulation of the boundary `segments`, refined to the
/// angle and area limits. Returns the vertices and the triangles inside `domain`.
fn refine(
    segments: &[Segment],
    domain: &Domain,
    spacing: f64,
    options: &MeshOptions,
) -> Result<(Vec<DVec2>, Vec<[usize; 3]>), MeshGenerationError> {
    let mut cdt = ConstrainedDelaunayTriangulation::<Point2<f64>>::new();
    let mut handles: HashMap<(u64, u64), FixedVertexHandle> = HashMap::new();
    let mut insert = |cdt: &mut ConstrainedDelaunayTriangulation<Point2<f64>>,
                      p: DVec2|
     -> Result<FixedVertexHandle, MeshGenerationError> {
        if let Some(&h) = handles.get(&key(p)) {
            return Ok(h);
        }
        let h = cdt
            .insert(Point2::new(p.x, p.y))
            .map_err(|e| MeshGenerationError::Triangulation(format!("{e:?}")))?;
        handles.insert(key(p), h);
        Ok(h)
    };
    for &(a, b) in segments {
        let (ha, hb) = (insert(&mut cdt, a)?, insert(&mut cdt, b)?);
        if ha == hb {
            continue;
        }
        if !cdt.can_add_constraint(ha, hb) {
            return Err(MeshGenerationError::Triangulation(format!(
                "boundary segment ({}, {}) - ({}, {}) crosses another one",
                a.x, a.y, b.x, b.y
            )));
        }
        cdt.add_constraint(ha, hb);
    }

    let max_area = 3.0_f64.sqrt() / 4.0 * spacing * spacing;
    let budget = options.max_vertices.saturating_sub(cdt.num_vertices());
    let parameters = RefinementParameters::<f64>::new()
        .exclude_outer_faces(true)
        .with_angle_limit(AngleLimit::from_deg(options.min_angle_deg))
        .with_max_allowed_area(max_area)
        .with_max_additional_vertices(budget);
    let result = cdt.refine(parameters);
    if !result.refinement_complete {
        return Err(MeshGenerationError::VertexBudgetExceeded {
            limit: options.max_vertices,
        });
    }

    let points: Vec<DVec2> = cdt
        .vertices()
        .map(|v| {
            let p = v.position();
            DVec2::new(p.x, p.y)
        })
        .collect();
    let triangles: Vec<[usize; 3]> = cdt
        .inner_faces()
        .filter(|face| !result.excluded_faces.contains(&face.fix()))
        .map(|face| face.vertices().map(|v| v.fix().index()))
        .filter(|t| {
            let centroid = (points[t[0]] + points[t[1]] + points[t[2]]) / 3.0;
            domain.contains(centroid)
        })
        .collect();
    Ok((points, triangles))
}

/// Edges that belong to exactly one triangle, as `(edge, opposite vertex)`.
fn boundary_edges(triangles: &[[usize; 3]]) -> Vec<((usize, usize), usize)> {
    let mut uses: HashMap<(usize, usize), (usize, usize)> = HashMap::new();
    for t in triangles {
        for k in 0..3 {
            let (u, v, w) = (t[k], t[(k + 1) % 3], t[(k + 2) % 3]);
            uses.entry((u.min(v), u.max(v))).or_insert((0, w)).0 += 1;
        }
    }
    let mut edges: Vec<_> = uses
        .into_iter()
        .filter(|(_, (count, _))| *count == 1)
        .map(|(edge, (_, w))| (edge, w))
        .collect();
    // Insertion order decides ties between cocircular points.
    edges.sort_unstable();
    edges
}

/// Generate a triangular mesh of `domain`, attaching its terminals and probes.
///
/// The film and hole outlines are sampled at the target edge length and
/// triangulated with quality refinement. A boundary edge seen under an obtuse
/// angle would get a negative dual length, so such edges are split and the
/// interior is refined again, up to `max_refinement_passes` times.
pub fn generate_mesh(domain: &Domain, options: &MeshOptions) -> Result<Mesh, MeshGenerationError> {
    let spacing = options.max_edge_length.unwrap_or(domain.max_edge_length);
    validate_domain(domain, spacing)?;

    let outlines = || std::iter::once(&domain.film).chain(domain.holes.iter());
    let corners: HashSet<(u64, u64)> = outlines().flat_map(sharp_corners).map(key).collect();
    let mut segments: Vec<Segment> = outlines().flat_map(|p| sample_outline(p, spacing)).collect();
    let passes = options.max_refinement_passes;

    for pass in 0..=passes {
        let (points, triangles) = refine(&segments, domain, spacing, options)?;
        if triangles.is_empty() {
            return Err(MeshGenerationError::EmptyMesh);
        }

        let boundary = boundary_edges(&triangles);
        let obtuse: HashSet<(usize, usize)> = boundary
            .iter()
            .filter(|&&((u, v), w)| {
                let (pu, pv, pw) = (points[u], points[v], points[w]);
                // Angles at sharp input corners cannot be improved by splitting.
                let at_corner = [pu, pv, pw].iter().any(|&p| corners.contains(&key(p)));
                !at_corner && (pu - pw).dot(pv - pw) < -1e-12 * pu.distance_squared(pv)
            })
            .map(|&(edge, _)| edge)
            .collect();

        if obtuse.is_empty() {
            let (mut points, triangles) = compact(points, triangles);
            if options.smoothing_iterations > 0 {
                smooth(&mut points, &triangles, options.smoothing_iterations);
            }
            let mesh = Mesh::from_triangulation(points, triangles)?
                .with_terminals(&domain.terminals)?
                .with_probes(&domain.probe_points);
            let (lo, hi) = mesh.edge_length_range();
            info!(
                "Generated mesh: {} vertices, {} cells, {} edges (edge length {:.3}..{:.3}, min angle {:.1} deg) after {} passes",
                mesh.num_vertices(),
                mesh.num_cells(),
                mesh.num_edges(),
                lo,
                hi,
                mesh.min_angle_deg(),
                pass
            );
            return Ok(mesh);
        }

        debug!("mesh pass {pass}: {} obtuse boundary edges, splitting", obtuse.len());
        if pass == passes {
            break;
        }
        segments = boundary
            .iter()
            .flat_map(|&((u, v), _)| {
                let (a, b) = (points[u], points[v]);
                if obtuse.contains(&(u, v)) {
                    let mid = a.lerp(b, 0.5);
                    vec![(a, mid), (mid, b)]
                } else {
                    vec![(a, b)]
                }
            })
            .collect();
    }

    Err(MeshGenerationError::NotConverged { passes })
}

/// Drop vertices that no triangle references and renumber.
fn compact(points: Vec<DVec2>, triangles: Vec<[usize; 3]>) -> (Vec<DVec2>, Vec<[usize; 3]>) {
    let mut index = vec![usize::MAX; points.len()];
    let mut kept = Vec::new();
    for t in &triangles {
        for &v in t {
            if index[v] == usize::MAX {
                index[v] = kept.len();
                kept.push(points[v]);
            }
        }
    }
    let triangles = triangles.into_iter().map(|t| t.map(|v| index[v])).collect();
    (kept, triangles)
}

/// Laplacian smoothing of interior vertices. A move is undone if it would flip
/// or collapse an incident triangle.
pub fn smooth(points: &mut [DVec2], triangles: &[[usize; 3]], iterations: usize) {
    let n = points.len();
    let mut neighbors: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    let mut incident: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut edge_uses: HashMap<(usize, usize), usize> = HashMap::new();
    for (ti, &[a, b, c]) in triangles.iter().enumerate() {
        for (u, v) in [(a, b), (b, c), (c, a)] {
            neighbors[u].insert(v);
            neighbors[v].insert(u);
            *edge_uses.entry((u.min(v), u.max(v))).or_default() += 1;
        }
        for v in [a, b, c] {
            incident[v].push(ti);
        }
    }
    let boundary: HashSet<usize> = edge_uses
        .iter()
        .filter(|(_, &count)| count == 1)
        .flat_map(|(&(u, v), _)| [u, v])
        .collect();

    for _ in 0..iterations {
        for v in 0..n {
            if boundary.contains(&v) || neighbors[v].is_empty() {
                continue;
            }
            let old = points[v];
            let target = neighbors[v].iter().map(|&k| points[k]).sum::<DVec2>()
                / neighbors[v].len() as f64;
            points[v] = target;
            let valid = incident[v].iter().all(|&ti| {
                let [a, b, c] = triangles[ti].map(|k| points[k]);
                signed_triangle_area(a, b, c) > 0.0
            });
            if !valid {
                points[v] = old;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rectangle_mesh_covers_the_domain() {
        let domain = Domain::new(Polygon::rectangle("film", 4.0, 2.0, [0.0, 0.0]), 0.4);
        let mesh = generate_mesh(&domain, &MeshOptions::default()).unwrap();
        assert_relative_eq!(mesh.total_area(), 8.0, epsilon = 1e-9);
        assert_relative_eq!(mesh.dual_areas().iter().sum::<f64>(), 8.0, epsilon = 1e-9);
        assert!(mesh.min_angle_deg() >= 19.9, "min angle {}", mesh.min_angle_deg());
        assert!(mesh.edges.iter().all(|e| e.dual_length >= -1e-12));
    }

    #[test]
    fn holes_stay_empty() {
        let domain = Domain::new(Polygon::rectangle("film", 4.0, 4.0, [0.0, 0.0]), 0.3)
            .with_hole(Polygon::circle("hole", 0.8, 24, [0.0, 0.0]));
        let mesh = generate_mesh(&domain, &MeshOptions::default()).unwrap();
        assert_relative_eq!(mesh.total_area(), domain.area(), epsilon = 1e-9);
        let hole = &domain.holes[0];
        assert!(mesh.cells.iter().all(|c| {
            let centroid = c.vertices.iter().map(|&v| mesh.nodes[v].position).sum::<DVec2>() / 3.0;
            !hole.contains(centroid)
        }));
    }

    #[test]
    fn invalid_input_is_rejected() {
        let two_points = Domain::new(Polygon::new("film", vec![[0.0, 0.0], [1.0, 0.0]]), 0.1);
        assert!(matches!(
            generate_mesh(&two_points, &MeshOptions::default()),
            Err(MeshGenerationError::TooFewPoints { count: 2, .. })
        ));

        let flat = Domain::new(
            Polygon::new("film", vec![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0]]),
            0.1,
        );
        assert!(matches!(
            generate_mesh(&flat, &MeshOptions::default()),
            Err(MeshGenerationError::ZeroArea { .. })
        ));

        let outside = Domain::new(Polygon::rectangle("film", 2.0, 2.0, [0.0, 0.0]), 0.2)
            .with_hole(Polygon::rectangle("hole", 1.0, 1.0, [3.0, 0.0]));
        assert!(matches!(
            generate_mesh(&outside, &MeshOptions::default()),
            Err(MeshGenerationError::HoleOutsideFilm { .. })
        ));

        let bad_spacing = Domain::new(Polygon::rectangle("film", 2.0, 2.0, [0.0, 0.0]), 0.0);
        assert!(matches!(
            generate_mesh(&bad_spacing, &MeshOptions::default()),
            Err(MeshGenerationError::InvalidEdgeLength(_))
        ));

        let nan = Domain::new(
            Polygon::new("film", vec![[0.0, 0.0], [1.0, 0.0], [f64::NAN, 1.0]]),
            0.1,
        );
        assert!(matches!(
            generate_mesh(&nan, &MeshOptions::default()),
            Err(MeshGenerationError::NonFinitePoint { .. })
        ));
    }

    #[test]
    fn smoothing_keeps_orientation_and_boundary() {
        let domain = Domain::new(Polygon::circle("disk", 2.0, 24, [0.0, 0.0]), 0.4);
        let options = MeshOptions {
            smoothing_iterations: 3,
            ..MeshOptions::default()
        };
        let mesh = generate_mesh(&domain, &options).unwrap();
        assert_relative_eq!(mesh.total_area(), domain.area(), epsilon = 1e-9);
        assert!(mesh.cells.iter().all(|c| c.area > 0.0));
    }
}
