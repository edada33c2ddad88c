use super::ShapeMoveError;
use super::hull;
use super::params::{ShapeParams, circumsphere_diameter};
use nalgebra::{Matrix3, Vector3};
use rand::{Rng, RngCore};
use std::fmt;

/// Capability interface of a shape-move generator.
///
/// The driver calls [`prepare`](Self::prepare) before a trial, [`propose`](Self::propose)
/// to mutate a copy of the current shape, and [`rollback`](Self::rollback) when the trial
/// is rejected. Accepted trials need no callback.
pub trait ShapeMoveProposer {
    fn prepare(&mut self, timestep: u64);

    fn propose(
        &mut self,
        timestep: u64,
        type_id: usize,
        shape: &mut ShapeParams,
        rng: &mut dyn RngCore,
    ) -> Result<(), ShapeMoveError>;

    fn rollback(&mut self, timestep: u64);

    /// Inertia tensor determinant of the last proposed shape.
    fn determinant(&self) -> f64;
}

fn random_direction(rng: &mut dyn RngCore) -> Option<Vector3<f64>> {
    let v = Vector3::new(
        rng.gen_range(-1.0..1.0),
        rng.gen_range(-1.0..1.0),
        rng.gen_range(-1.0..1.0),
    );
    let norm = v.norm();
    (norm > 0.0).then(|| v / norm)
}

fn check_type(step_size: &[f64], type_id: usize) -> Result<(), ShapeMoveError> {
    if type_id >= step_size.len() {
        return Err(ShapeMoveError::UnknownType {
            type_id,
            n_types: step_size.len(),
        });
    }
    Ok(())
}

/// Random vertex displacements of a convex polyhedron at constant volume.
///
/// Each vertex moves with probability `mix_ratio` by a random vector of length up to the
/// type's step size. The result is recentered on its hull centroid and rescaled to the
/// target volume; the step size is scaled by the same factor so that it stays
/// proportional to the particle size, and is restored on rollback.
#[derive(Debug, Clone)]
pub struct GeneralizedMove {
    step_size: Vec<f64>,
    step_size_backup: Vec<f64>,
    mix_ratio: f64,
    volume: f64,
    determinant: f64,
}

impl GeneralizedMove {
    pub fn new(n_types: usize, step_size: f64, mix_ratio: f64, volume: f64) -> Self {
        Self {
            step_size: vec![step_size; n_types],
            step_size_backup: vec![step_size; n_types],
            mix_ratio: mix_ratio.min(1.0),
            volume,
            determinant: 1.0,
        }
    }

    pub fn step_size(&self, type_id: usize) -> Option<f64> {
        self.step_size.get(type_id).copied()
    }
}

impl ShapeMoveProposer for GeneralizedMove {
    fn prepare(&mut self, _timestep: u64) {
        self.step_size_backup.clone_from(&self.step_size);
    }

    fn propose(
        &mut self,
        _timestep: u64,
        type_id: usize,
        shape: &mut ShapeParams,
        rng: &mut dyn RngCore,
    ) -> Result<(), ShapeMoveError> {
        check_type(&self.step_size, type_id)?;
        let ShapeParams::Polyhedron { vertices, diameter } = shape else {
            return Err(ShapeMoveError::Unsupported {
                mover: "generalized",
                shape: shape.kind(),
            });
        };

        let step = self.step_size[type_id];
        for v in vertices.iter_mut() {
            if rng.r#gen::<f64>() < self.mix_ratio {
                if let Some(dir) = random_direction(rng) {
                    *v += dir * (rng.r#gen::<f64>() * step);
                }
            }
        }

        let mp = hull::mass_properties(vertices).ok_or(ShapeMoveError::DegenerateHull {
            vertices: vertices.len(),
        })?;
        let scale = (self.volume / mp.volume).cbrt();
        for v in vertices.iter_mut() {
            *v = (*v - mp.centroid) * scale;
        }
        *diameter = circumsphere_diameter(vertices);
        self.determinant = mp.inertia_determinant() * scale.powi(15);
        self.step_size[type_id] *= scale;
        Ok(())
    }

    fn rollback(&mut self, _timestep: u64) {
        std::mem::swap(&mut self.step_size, &mut self.step_size_backup);
    }

    fn determinant(&self) -> f64 {
        self.determinant
    }
}

/// Always proposes the same target shape.
#[derive(Debug, Clone)]
pub struct ConstantMove {
    target: ShapeParams,
    determinant: f64,
}

impl ConstantMove {
    pub fn new(target: ShapeParams) -> Self {
        let determinant = target.inertia_determinant();
        Self {
            target,
            determinant,
        }
    }
}

impl ShapeMoveProposer for ConstantMove {
    fn prepare(&mut self, _timestep: u64) {}

    fn propose(
        &mut self,
        _timestep: u64,
        _type_id: usize,
        shape: &mut ShapeParams,
        _rng: &mut dyn RngCore,
    ) -> Result<(), ShapeMoveError> {
        shape.clone_from(&self.target);
        Ok(())
    }

    fn rollback(&mut self, _timestep: u64) {}

    fn determinant(&self) -> f64 {
        self.determinant
    }
}

/// Elastic deformations: an axis stretch with probability `scale_ratio`, otherwise a
/// simple shear.
///
/// A stretch multiplies one randomly chosen body axis by `s ∈ [1/(1+m), 1+m]` where `m`
/// is the step size. Ellipsoids instead change their aspect ratio `a/b` by a random
/// log-step at constant volume, and cannot be sheared.
#[derive(Debug, Clone)]
pub struct ElasticMove {
    step_size: Vec<f64>,
    scale_ratio: f64,
    determinant: f64,
}

impl ElasticMove {
    pub fn new(n_types: usize, step_size: f64, scale_ratio: f64) -> Self {
        Self {
            step_size: vec![step_size; n_types],
            scale_ratio: scale_ratio.min(1.0),
            determinant: 0.0,
        }
    }

    fn stretch(shape: &mut ShapeParams, step: f64, rng: &mut dyn RngCore) {
        match shape {
            ShapeParams::Polyhedron { vertices, diameter } => {
                let step = if (0.0..=1.0).contains(&step) { step } else { 0.0 };
                let s_max = 1.0 + step;
                let s = 1.0 / s_max + rng.r#gen::<f64>() * (s_max - 1.0 / s_max);
                let axis = rng.gen_range(0..3);
                for v in vertices.iter_mut() {
                    v[axis] *= s;
                }
                *diameter = circumsphere_diameter(vertices);
            }
            ShapeParams::Ellipsoid { a, b, c } => {
                let volume = *a * *b * *c;
                let ratio = (*a / *b).ln() + rng.r#gen::<f64>() * 2.0 * step - step;
                let x = ratio.exp();
                let minor = (volume / x).cbrt();
                *a = x * minor;
                *b = minor;
                *c = minor;
            }
        }
    }

    fn shear(
        vertices: &mut [Vector3<f64>],
        diameter: &mut f64,
        step: f64,
        rng: &mut dyn RngCore,
    ) {
        let gamma = rng.r#gen::<f64>() * 2.0 * step - step;
        let (row, col) = [(0, 1), (0, 2), (1, 2), (1, 0), (2, 0), (2, 1)][rng.gen_range(0..6)];
        let mut m = Matrix3::identity();
        m[(row, col)] = gamma;
        for v in vertices.iter_mut() {
            *v = m * *v;
        }
        *diameter = circumsphere_diameter(vertices);
    }
}

impl ShapeMoveProposer for ElasticMove {
    fn prepare(&mut self, _timestep: u64) {}

    fn propose(
        &mut self,
        _timestep: u64,
        type_id: usize,
        shape: &mut ShapeParams,
        rng: &mut dyn RngCore,
    ) -> Result<(), ShapeMoveError> {
        check_type(&self.step_size, type_id)?;
        let step = self.step_size[type_id];
        if rng.r#gen::<f64>() < self.scale_ratio {
            Self::stretch(shape, step, rng);
        } else {
            match shape {
                ShapeParams::Polyhedron { vertices, diameter } => {
                    Self::shear(vertices, diameter, step, rng)
                }
                ShapeParams::Ellipsoid { .. } => {
                    return Err(ShapeMoveError::Unsupported {
                        mover: "elastic shear",
                        shape: "ellipsoid",
                    });
                }
            }
        }
        self.determinant = shape.inertia_determinant();
        Ok(())
    }

    fn rollback(&mut self, _timestep: u64) {}

    fn determinant(&self) -> f64 {
        self.determinant
    }
}

/// Proposal function of a user move. It mutates the shape and returns the inertia
/// tensor determinant of the result.
pub type ShapeMoveFn = Box<
    dyn FnMut(u64, usize, &mut ShapeParams, &mut dyn RngCore) -> Result<f64, ShapeMoveError>
        + Send,
>;

/// A move supplied as an in-process closure.
pub struct UserMove {
    propose: ShapeMoveFn,
    determinant: f64,
}

impl UserMove {
    pub fn new(propose: ShapeMoveFn) -> Self {
        Self {
            propose,
            determinant: 0.0,
        }
    }
}

impl fmt::Debug for UserMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserMove")
            .field("determinant", &self.determinant)
            .finish_non_exhaustive()
    }
}

impl ShapeMoveProposer for UserMove {
    fn prepare(&mut self, _timestep: u64) {}

    fn propose(
        &mut self,
        timestep: u64,
        type_id: usize,
        shape: &mut ShapeParams,
        rng: &mut dyn RngCore,
    ) -> Result<(), ShapeMoveError> {
        self.determinant = (self.propose)(timestep, type_id, shape, rng)?;
        Ok(())
    }

    fn rollback(&mut self, _timestep: u64) {}

    fn determinant(&self) -> f64 {
        self.determinant
    }
}

/// The closed set of shape-move strategies.
#[derive(Debug)]
pub enum ShapeMove {
    Generalized(GeneralizedMove),
    Constant(ConstantMove),
    Elastic(ElasticMove),
    User(UserMove),
}

impl ShapeMove {
    fn inner(&mut self) -> &mut dyn ShapeMoveProposer {
        match self {
            ShapeMove::Generalized(m) => m,
            ShapeMove::Constant(m) => m,
            ShapeMove::Elastic(m) => m,
            ShapeMove::User(m) => m,
        }
    }
}

impl ShapeMoveProposer for ShapeMove {
    fn prepare(&mut self, timestep: u64) {
        self.inner().prepare(timestep)
    }

    fn propose(
        &mut self,
        timestep: u64,
        type_id: usize,
        shape: &mut ShapeParams,
        rng: &mut dyn RngCore,
    ) -> Result<(), ShapeMoveError> {
        self.inner().propose(timestep, type_id, shape, rng)
    }

    fn rollback(&mut self, timestep: u64) {
        self.inner().rollback(timestep)
    }

    fn determinant(&self) -> f64 {
        match self {
            ShapeMove::Generalized(m) => m.determinant(),
            ShapeMove::Constant(m) => m.determinant(),
            ShapeMove::Elastic(m) => m.determinant(),
            ShapeMove::User(m) => m.determinant(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn cube() -> ShapeParams {
        let mut v = Vec::new();
        for &x in &[-0.5, 0.5] {
            for &y in &[-0.5, 0.5] {
                for &z in &[-0.5, 0.5] {
                    v.push(Vector3::new(x, y, z));
                }
            }
        }
        ShapeParams::polyhedron(v)
    }

    #[test]
    fn generalized_move_keeps_volume_and_centroid() {
        let mut mover = GeneralizedMove::new(1, 0.1, 1.0, 1.0);
        let mut rng = StdRng::seed_from_u64(7);
        let mut shape = cube();
        for t in 0..20 {
            mover.prepare(t);
            mover.propose(t, 0, &mut shape, &mut rng).unwrap();
            let mp = shape.mass_properties().unwrap();
            assert!((mp.volume - 1.0).abs() < 1e-9);
            assert!(mp.centroid.norm() < 1e-9);
            assert!((mover.determinant() - mp.inertia_determinant()).abs() < 1e-9);
        }
    }

    #[test]
    fn generalized_rollback_restores_step_size() {
        let mut mover = GeneralizedMove::new(2, 0.2, 1.0, 0.5);
        let mut rng = StdRng::seed_from_u64(11);
        let mut shape = cube();
        mover.prepare(0);
        mover.propose(0, 1, &mut shape, &mut rng).unwrap();
        // Rescaling from volume 1 to 0.5 shrinks the step.
        assert!(mover.step_size(1).unwrap() < 0.2);
        mover.rollback(0);
        assert_eq!(mover.step_size(1), Some(0.2));
        assert_eq!(mover.step_size(0), Some(0.2));
    }

    #[test]
    fn generalized_move_rejects_ellipsoids_and_unknown_types() {
        let mut mover = ShapeMove::Generalized(GeneralizedMove::new(1, 0.1, 1.0, 1.0));
        let mut rng = StdRng::seed_from_u64(1);
        let mut ellipsoid = ShapeParams::Ellipsoid {
            a: 1.0,
            b: 1.0,
            c: 1.0,
        };
        assert!(matches!(
            mover.propose(0, 0, &mut ellipsoid, &mut rng),
            Err(ShapeMoveError::Unsupported { .. })
        ));
        let mut shape = cube();
        assert_eq!(
            mover.propose(0, 3, &mut shape, &mut rng),
            Err(ShapeMoveError::UnknownType {
                type_id: 3,
                n_types: 1
            })
        );
    }

    #[test]
    fn constant_move_installs_target() {
        let target = ShapeParams::Ellipsoid {
            a: 2.0,
            b: 1.0,
            c: 1.0,
        };
        let mut mover = ShapeMove::Constant(ConstantMove::new(target.clone()));
        let mut rng = StdRng::seed_from_u64(3);
        let mut shape = cube();
        mover.propose(0, 0, &mut shape, &mut rng).unwrap();
        assert_eq!(shape, target);
        assert!((mover.determinant() - target.inertia_determinant()).abs() < 1e-12);
    }

    #[test]
    fn elastic_stretch_preserves_ellipsoid_volume() {
        let mut mover = ElasticMove::new(1, 0.3, 1.0);
        let mut rng = StdRng::seed_from_u64(5);
        let mut shape = ShapeParams::Ellipsoid {
            a: 1.5,
            b: 1.0,
            c: 1.0,
        };
        for t in 0..10 {
            mover.propose(t, 0, &mut shape, &mut rng).unwrap();
            let ShapeParams::Ellipsoid { a, b, c } = shape else {
                unreachable!()
            };
            assert!((a * b * c - 1.5).abs() < 1e-9);
            assert!((b - c).abs() < 1e-12);
        }
    }

    #[test]
    fn elastic_shear_keeps_volume_of_polyhedron() {
        let mut mover = ElasticMove::new(1, 0.2, 0.0);
        let mut rng = StdRng::seed_from_u64(9);
        let mut shape = cube();
        mover.propose(0, 0, &mut shape, &mut rng).unwrap();
        let mp = shape.mass_properties().unwrap();
        assert!((mp.volume - 1.0).abs() < 1e-9);
        assert!(mover.determinant() > 0.0);
    }

    #[test]
    fn user_move_reports_closure_determinant() {
        let mut mover = ShapeMove::User(UserMove::new(Box::new(
            |_: u64, _: usize, shape: &mut ShapeParams, _: &mut dyn RngCore| {
                *shape = ShapeParams::Ellipsoid {
                    a: 1.0,
                    b: 2.0,
                    c: 3.0,
                };
                Ok(42.0)
            },
        )));
        let mut rng = StdRng::seed_from_u64(0);
        let mut shape = cube();
        mover.prepare(0);
        mover.propose(0, 0, &mut shape, &mut rng).unwrap();
        mover.rollback(0);
        assert_eq!(mover.determinant(), 42.0);
        assert_eq!(shape.kind(), "ellipsoid");
    }
}
