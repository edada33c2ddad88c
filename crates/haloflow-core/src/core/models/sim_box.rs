use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Orthorhombic simulation box centered at the origin.
///
/// The box spans `[-L/2, L/2)` along every axis. Periodic axes wrap positions and
/// count image crossings; non-periodic axes are hard walls that particles must not cross.
/// In two dimensions the z extent is kept but excluded from the volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimBox {
    lengths: Vector3<f64>,
    periodic: [bool; 3],
    dimensions: usize,
}

impl SimBox {
    /// Creates a fully periodic three-dimensional box.
    ///
    /// # Arguments
    ///
    /// * `lengths` - The edge lengths along x, y and z.
    pub fn new(lengths: Vector3<f64>) -> Self {
        Self {
            lengths,
            periodic: [true; 3],
            dimensions: 3,
        }
    }

    /// Creates a fully periodic cube with edge length `l`.
    pub fn cubic(l: f64) -> Self {
        Self::new(Vector3::new(l, l, l))
    }

    /// Returns a copy with the given periodic flags.
    pub fn with_periodic(mut self, periodic: [bool; 3]) -> Self {
        self.periodic = periodic;
        self
    }

    /// Returns a copy flagged as two-dimensional (z is never periodic then).
    pub fn two_dimensional(mut self) -> Self {
        self.dimensions = 2;
        self.periodic[2] = false;
        self
    }

    pub fn lengths(&self) -> Vector3<f64> {
        self.lengths
    }

    pub fn periodic(&self) -> [bool; 3] {
        self.periodic
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn lo(&self) -> Point3<f64> {
        Point3::from(-self.lengths * 0.5)
    }

    pub fn hi(&self) -> Point3<f64> {
        Point3::from(self.lengths * 0.5)
    }

    /// Volume in three dimensions, area in two.
    pub fn volume(&self) -> f64 {
        if self.dimensions == 2 {
            self.lengths.x * self.lengths.y
        } else {
            self.lengths.x * self.lengths.y * self.lengths.z
        }
    }

    /// Multiplies each edge length by the matching factor. Positions are not touched.
    pub fn scale(&mut self, factors: &Vector3<f64>) {
        self.lengths.component_mul_assign(factors);
    }

    /// Fractional coordinate of `position` along `axis` (0 at the low face, 1 at the high face).
    pub fn fraction(&self, position: &Point3<f64>, axis: usize) -> f64 {
        (position[axis] - self.lo()[axis]) / self.lengths[axis]
    }

    /// Returns `true` if `position` is inside the box along every non-periodic axis.
    pub fn contains_along_walls(&self, position: &Point3<f64>) -> bool {
        let (lo, hi) = (self.lo(), self.hi());
        (0..self.dimensions)
            .filter(|&axis| !self.periodic[axis])
            .all(|axis| position[axis] >= lo[axis] && position[axis] <= hi[axis])
    }

    /// Wraps `position` back into the box along periodic axes, updating `image`.
    pub fn wrap(&self, position: &mut Point3<f64>, image: &mut Vector3<i32>) {
        for axis in 0..3 {
            if self.periodic[axis] {
                self.wrap_axis(position, image, axis);
            }
        }
    }

    /// Wraps along a single axis, regardless of its periodic flag.
    pub fn wrap_axis(&self, position: &mut Point3<f64>, image: &mut Vector3<i32>, axis: usize) {
        let l = self.lengths[axis];
        let shift = ((position[axis] + 0.5 * l) / l).floor();
        if shift != 0.0 {
            position[axis] -= shift * l;
            image[axis] += shift as i32;
        }
        // Rounding can leave the coordinate exactly on the high face.
        if position[axis] >= 0.5 * l {
            position[axis] -= l;
            image[axis] += 1;
        }
    }

    /// Applies the minimum-image convention to a separation vector.
    pub fn min_image(&self, mut delta: Vector3<f64>) -> Vector3<f64> {
        for axis in 0..3 {
            if self.periodic[axis] {
                let l = self.lengths[axis];
                delta[axis] -= l * (delta[axis] / l).round();
            }
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_updates_position_and_image() {
        let sim_box = SimBox::cubic(10.0);
        let mut pos = Point3::new(6.0, -12.0, 4.0);
        let mut image = Vector3::zeros();
        sim_box.wrap(&mut pos, &mut image);
        assert!((pos.x - -4.0).abs() < 1e-12);
        assert!((pos.y - -2.0).abs() < 1e-12);
        assert!((pos.z - 4.0).abs() < 1e-12);
        assert_eq!(image, Vector3::new(1, -1, 0));
    }

    #[test]
    fn wrap_leaves_walls_alone() {
        let sim_box = SimBox::cubic(10.0).with_periodic([true, false, true]);
        let mut pos = Point3::new(0.0, 7.0, 0.0);
        let mut image = Vector3::zeros();
        sim_box.wrap(&mut pos, &mut image);
        assert!((pos.y - 7.0).abs() < 1e-12);
        assert!(!sim_box.contains_along_walls(&pos));
    }

    #[test]
    fn min_image_picks_nearest_copy() {
        let sim_box = SimBox::cubic(10.0);
        let d = sim_box.min_image(Vector3::new(9.0, -6.0, 1.0));
        assert!((d.x - -1.0).abs() < 1e-12);
        assert!((d.y - 4.0).abs() < 1e-12);
        assert!((d.z - 1.0).abs() < 1e-12);
    }

    #[test]
    fn two_dimensional_volume_is_an_area() {
        let sim_box = SimBox::new(Vector3::new(2.0, 3.0, 1.0)).two_dimensional();
        assert!((sim_box.volume() - 6.0).abs() < 1e-12);
        assert!(!sim_box.periodic()[2]);
    }
}
