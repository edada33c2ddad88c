use super::hull::{self, MassProperties};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Geometry of one particle type as seen by the shape Monte Carlo driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShapeParams {
    /// A convex polyhedron given by its vertices in the body frame. `diameter` is the
    /// diameter of the circumsphere centered at the body origin.
    Polyhedron {
        vertices: Vec<Vector3<f64>>,
        diameter: f64,
    },
    /// An ellipsoid with half-axes `a`, `b`, `c` along the body x, y and z axes.
    Ellipsoid { a: f64, b: f64, c: f64 },
}

impl ShapeParams {
    /// Creates a polyhedron and derives its circumsphere diameter from the vertices.
    pub fn polyhedron(vertices: Vec<Vector3<f64>>) -> Self {
        let diameter = circumsphere_diameter(&vertices);
        ShapeParams::Polyhedron { vertices, diameter }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ShapeParams::Polyhedron { .. } => "polyhedron",
            ShapeParams::Ellipsoid { .. } => "ellipsoid",
        }
    }

    /// Volume, centroid and unit-density inertia tensor, or `None` for a degenerate
    /// polyhedron.
    pub fn mass_properties(&self) -> Option<MassProperties> {
        match self {
            ShapeParams::Polyhedron { vertices, .. } => hull::mass_properties(vertices),
            &ShapeParams::Ellipsoid { a, b, c } => {
                let volume = 4.0 / 3.0 * PI * a * b * c;
                let inertia = Matrix3::from_diagonal(&Vector3::new(
                    b * b + c * c,
                    a * a + c * c,
                    a * a + b * b,
                )) * (volume / 5.0);
                Some(MassProperties {
                    volume,
                    centroid: Vector3::zeros(),
                    inertia,
                })
            }
        }
    }

    /// Determinant of the inertia tensor, `0.0` for degenerate shapes.
    pub fn inertia_determinant(&self) -> f64 {
        self.mass_properties()
            .map(|mp| mp.inertia_determinant())
            .unwrap_or(0.0)
    }
}

pub(crate) fn circumsphere_diameter(vertices: &[Vector3<f64>]) -> f64 {
    2.0 * vertices
        .iter()
        .map(|v| v.norm_squared())
        .fold(0.0, f64::max)
        .sqrt()
}
