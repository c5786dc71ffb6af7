use glam::DVec2;
use serde::{Deserialize, Serialize};

/// A closed polygon. The last point connects back to the first one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub name: String,
    pub points: Vec<[f64; 2]>,
}

impl Polygon {
    pub fn new(name: impl Into<String>, points: Vec<[f64; 2]>) -> Self {
        Self {
            name: name.into(),
            points,
        }
    }

    /// Axis-aligned rectangle centered on `center`.
    pub fn rectangle(name: impl Into<String>, width: f64, height: f64, center: [f64; 2]) -> Self {
        let (hw, hh) = (width / 2.0, height / 2.0);
        let [cx, cy] = center;
        Self::new(
            name,
            vec![
                [cx - hw, cy - hh],
                [cx + hw, cy - hh],
                [cx + hw, cy + hh],
                [cx - hw, cy + hh],
            ],
        )
    }

    /// Regular `n`-gon approximating a circle.
    pub fn circle(name: impl Into<String>, radius: f64, n: usize, center: [f64; 2]) -> Self {
        let points = (0..n)
            .map(|k| {
                let phi = 2.0 * std::f64::consts::PI * k as f64 / n as f64;
                [center[0] + radius * phi.cos(), center[1] + radius * phi.sin()]
            })
            .collect();
        Self::new(name, points)
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        Self::new(
            self.name.clone(),
            self.points.iter().map(|p| [p[0] + dx, p[1] + dy]).collect(),
        )
    }

    pub fn vertices(&self) -> impl Iterator<Item = DVec2> + '_ {
        self.points.iter().map(|p| DVec2::from_array(*p))
    }

    /// Boundary segments `(start, end)`, including the closing one.
    pub fn segments(&self) -> impl Iterator<Item = (DVec2, DVec2)> + '_ {
        let n = self.points.len();
        (0..n).map(move |i| {
            (
                DVec2::from_array(self.points[i]),
                DVec2::from_array(self.points[(i + 1) % n]),
            )
        })
    }

    /// Shoelace area, positive for counter-clockwise orientation.
    pub fn signed_area(&self) -> f64 {
        self.segments().map(|(a, b)| a.perp_dot(b)).sum::<f64>() / 2.0
    }

    pub fn area(&self) -> f64 {
        self.signed_area().abs()
    }

    pub fn perimeter(&self) -> f64 {
        self.segments().map(|(a, b)| a.distance(b)).sum()
    }

    /// Even-odd point-in-polygon test. Points exactly on the boundary may go either way;
    /// use [`Polygon::contains_or_touches`] when boundary points must be included.
    pub fn contains(&self, p: DVec2) -> bool {
        let mut inside = false;
        for (a, b) in self.segments() {
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
                if p.x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    pub fn contains_or_touches(&self, p: DVec2, tol: f64) -> bool {
        self.contains(p) || self.distance_to_boundary(p) <= tol
    }

    pub fn distance_to_boundary(&self, p: DVec2) -> f64 {
        self.segments()
            .map(|(a, b)| point_segment_distance(p, a, b))
            .fold(f64::INFINITY, f64::min)
    }

    /// True if two non-adjacent edges intersect.
    pub fn is_self_intersecting(&self) -> bool {
        let segs: Vec<(DVec2, DVec2)> = self.segments().collect();
        let n = segs.len();
        for i in 0..n {
            for j in (i + 1)..n {
                let adjacent = j == i + 1 || (i == 0 && j == n - 1);
                if adjacent {
                    continue;
                }
                if segments_intersect(segs[i].0, segs[i].1, segs[j].0, segs[j].1) {
                    return true;
                }
            }
        }
        false
    }
}

/// Input geometry for mesh generation: a film with optional holes, named current
/// terminals and voltage probe points.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Domain {
    pub film: Polygon,
    pub holes: Vec<Polygon>,
    /// Regions whose overlap with the film boundary defines terminal vertices.
    pub terminals: Vec<Polygon>,
    /// Pairs of points whose potential difference is reported as a voltage.
    pub probe_points: Vec<([f64; 2], [f64; 2])>,
    pub max_edge_length: f64,
}

impl Domain {
    pub fn new(film: Polygon, max_edge_length: f64) -> Self {
        Self {
            film,
            holes: Vec::new(),
            terminals: Vec::new(),
            probe_points: Vec::new(),
            max_edge_length,
        }
    }

    pub fn with_hole(mut self, hole: Polygon) -> Self {
        self.holes.push(hole);
        self
    }

    pub fn with_terminal(mut self, terminal: Polygon) -> Self {
        self.terminals.push(terminal);
        self
    }

    pub fn with_probe_points(mut self, a: [f64; 2], b: [f64; 2]) -> Self {
        self.probe_points.push((a, b));
        self
    }

    /// Film area minus hole areas.
    pub fn area(&self) -> f64 {
        self.film.area() - self.holes.iter().map(Polygon::area).sum::<f64>()
    }

    /// True if `p` is inside the film and outside every hole.
    pub fn contains(&self, p: DVec2) -> bool {
        self.film.contains(p) && !self.holes.iter().any(|h| h.contains(p))
    }
}

pub fn point_segment_distance(p: DVec2, a: DVec2, b: DVec2) -> f64 {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq == 0.0 {
        return p.distance(a);
    }
    let s = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    p.distance(a + ab * s)
}

fn orientation(a: DVec2, b: DVec2, c: DVec2) -> f64 {
    (b - a).perp_dot(c - a)
}

/// Proper or touching intersection of two closed segments.
pub fn segments_intersect(p1: DVec2, p2: DVec2, q1: DVec2, q2: DVec2) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    let on_segment = |a: DVec2, b: DVec2, c: DVec2| {
        c.x >= a.x.min(b.x) && c.x <= a.x.max(b.x) && c.y >= a.y.min(b.y) && c.y <= a.y.max(b.y)
    };
    (d1 == 0.0 && on_segment(q1, q2, p1))
        || (d2 == 0.0 && on_segment(q1, q2, p2))
        || (d3 == 0.0 && on_segment(p1, p2, q1))
        || (d4 == 0.0 && on_segment(p1, p2, q2))
}
