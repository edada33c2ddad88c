use nalgebra::{Matrix3, Vector3};

const PLANE_TOLERANCE: f64 = 1e-9;

/// Volume, centroid and inertia tensor (about the centroid, unit density) of a solid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassProperties {
    pub volume: f64,
    pub centroid: Vector3<f64>,
    pub inertia: Matrix3<f64>,
}

impl MassProperties {
    pub fn inertia_determinant(&self) -> f64 {
        self.inertia.determinant()
    }
}

/// One planar face of a convex hull, as vertex indices in counter-clockwise order seen
/// from outside.
#[derive(Debug, Clone, PartialEq)]
pub struct Facet {
    pub normal: Vector3<f64>,
    pub offset: f64,
    pub vertices: Vec<usize>,
}

/// Computes the facets of the convex hull of `points`.
///
/// Every non-degenerate vertex triple is tested as a supporting plane; coplanar vertices
/// are merged into one polygonal facet. The cost is quartic in the vertex count, which is
/// fine for the few dozen vertices a particle shape carries. Returns `None` when the
/// points do not span a volume.
pub fn convex_hull(points: &[Vector3<f64>]) -> Option<Vec<Facet>> {
    let n = points.len();
    if n < 4 {
        return None;
    }
    let scale = points.iter().map(|p| p.norm()).fold(1.0_f64, f64::max);
    let tol = PLANE_TOLERANCE * scale;

    let mut facets: Vec<Facet> = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                let cross = (points[j] - points[i]).cross(&(points[k] - points[i]));
                let norm = cross.norm();
                if norm <= tol * scale {
                    continue;
                }
                let mut normal = cross / norm;
                let mut offset = normal.dot(&points[i]);
                let above = points.iter().any(|p| normal.dot(p) - offset > tol);
                let below = points.iter().any(|p| normal.dot(p) - offset < -tol);
                if above && below {
                    continue;
                }
                if above {
                    normal = -normal;
                    offset = -offset;
                }
                let known = facets.iter().any(|f| {
                    (f.normal - normal).norm() < 1e-6 && (f.offset - offset).abs() < tol
                });
                if known {
                    continue;
                }
                let on_plane: Vec<usize> = (0..n)
                    .filter(|&m| (normal.dot(&points[m]) - offset).abs() <= tol)
                    .collect();
                facets.push(Facet {
                    normal,
                    offset,
                    vertices: order_around(points, &on_plane, &normal),
                });
            }
        }
    }

    if facets.len() < 4 { None } else { Some(facets) }
}

fn order_around(points: &[Vector3<f64>], indices: &[usize], normal: &Vector3<f64>) -> Vec<usize> {
    let center = indices.iter().map(|&i| points[i]).sum::<Vector3<f64>>() / indices.len() as f64;
    let u = (points[indices[0]] - center).normalize();
    let w = normal.cross(&u);
    let mut ordered: Vec<(f64, usize)> = indices
        .iter()
        .map(|&i| {
            let d = points[i] - center;
            (d.dot(&w).atan2(d.dot(&u)), i)
        })
        .collect();
    ordered.sort_by(|a, b| a.0.total_cmp(&b.0));
    ordered.into_iter().map(|(_, i)| i).collect()
}

/// Mass properties of the convex hull of `points`.
///
/// The hull is split into tetrahedra spanned by an interior point and a fan
/// triangulation of each facet; the second moments use the closed-form tetrahedron
/// covariance `V/20 (Σ vᵢvᵢᵀ + s sᵀ)`.
pub fn mass_properties(points: &[Vector3<f64>]) -> Option<MassProperties> {
    let facets = convex_hull(points)?;
    let interior = points.iter().sum::<Vector3<f64>>() / points.len() as f64;

    let mut volume = 0.0;
    let mut first_moment = Vector3::zeros();
    let mut covariance = Matrix3::zeros();
    for facet in &facets {
        let corners: Vec<Vector3<f64>> = facet.vertices.iter().map(|&i| points[i]).collect();
        let hub = corners.iter().sum::<Vector3<f64>>() / corners.len() as f64;
        for e in 0..corners.len() {
            let (a, b) = (corners[e], corners[(e + 1) % corners.len()]);
            let tet = [interior, hub, a, b];
            let v = ((hub - interior).cross(&(a - interior)))
                .dot(&(b - interior))
                .abs()
                / 6.0;
            if v == 0.0 {
                continue;
            }
            let s: Vector3<f64> = tet.iter().sum();
            volume += v;
            first_moment += s * (v / 4.0);
            let mut c = s * s.transpose();
            for p in &tet {
                c += p * p.transpose();
            }
            covariance += c * (v / 20.0);
        }
    }
    if volume <= 0.0 {
        return None;
    }
    let centroid = first_moment / volume;
    let central = covariance - centroid * centroid.transpose() * volume;
    let inertia = Matrix3::identity() * central.trace() - central;
    Some(MassProperties {
        volume,
        centroid,
        inertia,
    })
}
