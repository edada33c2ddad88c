use crate::core::shape::{ShapeMove, ShapeMoveError, ShapeMoveProposer, ShapeParams};
use crate::engine::progress::{Progress, ProgressReporter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, instrument};

/// A proposed change of one particle type's shape, handed to the acceptance function.
#[derive(Debug, Clone, Copy)]
pub struct TrialMove<'s> {
    pub timestep: u64,
    pub type_id: usize,
    pub current: &'s ShapeParams,
    pub proposed: &'s ShapeParams,
    /// Inertia tensor determinant of `current`.
    pub current_determinant: f64,
    /// Inertia tensor determinant of `proposed`.
    pub proposed_determinant: f64,
}

/// Natural log of the acceptance probability of a trial. Values `>= 0` always accept.
pub type LogAcceptanceFn<'a> = Box<dyn FnMut(&TrialMove<'_>) -> f64 + Send + 'a>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptanceCounts {
    pub accepted: Vec<u64>,
    pub total: Vec<u64>,
}

impl AcceptanceCounts {
    fn with_types(n: usize) -> Self {
        Self {
            accepted: vec![0; n],
            total: vec![0; n],
        }
    }

    /// Fraction of accepted trials of `type_id`, `None` before the first trial.
    pub fn ratio(&self, type_id: usize) -> Option<f64> {
        let total = *self.total.get(type_id)?;
        (total > 0).then(|| self.accepted[type_id] as f64 / total as f64)
    }

    pub fn total_accepted(&self) -> u64 {
        self.accepted.iter().sum()
    }
}

/// Metropolis driver over the shapes of all particle types.
///
/// Each sweep tries one move per type: the proposer mutates a copy of the current
/// shape, the caller's acceptance function scores it and the proposer is rolled back
/// on rejection.
pub struct ShapeUpdater<'a> {
    mover: ShapeMove,
    shapes: Vec<ShapeParams>,
    determinants: Vec<f64>,
    rng: StdRng,
    log_acceptance: LogAcceptanceFn<'a>,
    counts: AcceptanceCounts,
}

impl<'a> ShapeUpdater<'a> {
    pub fn new(
        mover: ShapeMove,
        shapes: Vec<ShapeParams>,
        seed: u64,
        log_acceptance: LogAcceptanceFn<'a>,
    ) -> Self {
        let determinants = shapes.iter().map(ShapeParams::inertia_determinant).collect();
        let counts = AcceptanceCounts::with_types(shapes.len());
        Self {
            mover,
            shapes,
            determinants,
            rng: StdRng::seed_from_u64(seed),
            log_acceptance,
            counts,
        }
    }

    pub fn shapes(&self) -> &[ShapeParams] {
        &self.shapes
    }

    pub fn counts(&self) -> &AcceptanceCounts {
        &self.counts
    }

    pub fn reset_counts(&mut self) {
        self.counts = AcceptanceCounts::with_types(self.shapes.len());
    }

    /// Tries one move per particle type and returns the number accepted.
    pub fn sweep(&mut self, timestep: u64) -> Result<usize, ShapeMoveError> {
        let mut accepted = 0;
        for type_id in 0..self.shapes.len() {
            self.mover.prepare(timestep);
            let mut proposed = self.shapes[type_id].clone();
            self.mover
                .propose(timestep, type_id, &mut proposed, &mut self.rng)?;

            let trial = TrialMove {
                timestep,
                type_id,
                current: &self.shapes[type_id],
                proposed: &proposed,
                current_determinant: self.determinants[type_id],
                proposed_determinant: self.mover.determinant(),
            };
            let log_p = (self.log_acceptance)(&trial);
            let accept = log_p >= 0.0 || self.rng.r#gen::<f64>().ln() < log_p;

            self.counts.total[type_id] += 1;
            if accept {
                self.determinants[type_id] = self.mover.determinant();
                self.shapes[type_id] = proposed;
                self.counts.accepted[type_id] += 1;
                accepted += 1;
            } else {
                self.mover.rollback(timestep);
            }
            debug!(type_id, accept, log_p, "Shape trial.");
        }
        Ok(accepted)
    }

    /// Runs `sweeps` sweeps starting at `timestep`, one timestep per sweep.
    #[instrument(skip_all, name = "shape_mc_run", fields(sweeps = sweeps))]
    pub fn run(
        &mut self,
        timestep: u64,
        sweeps: u64,
        reporter: &ProgressReporter,
    ) -> Result<&AcceptanceCounts, ShapeMoveError> {
        reporter.report(Progress::PhaseStart { name: "Shape Monte Carlo" });
        reporter.report(Progress::TaskStart { total_steps: sweeps });
        for t in timestep..timestep + sweeps {
            self.sweep(t)?;
            reporter.report(Progress::TaskIncrement);
        }
        reporter.report(Progress::TaskFinish);
        reporter.report(Progress::PhaseFinish);
        info!(
            accepted = self.counts.total_accepted(),
            "Shape Monte Carlo complete."
        );
        Ok(&self.counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shape::{ConstantMove, GeneralizedMove};
    use nalgebra::Vector3;

    fn cube(edge: f64) -> ShapeParams {
        let h = 0.5 * edge;
        let mut v = Vec::new();
        for &x in &[-h, h] {
            for &y in &[-h, h] {
                for &z in &[-h, h] {
                    v.push(Vector3::new(x, y, z));
                }
            }
        }
        ShapeParams::polyhedron(v)
    }

    #[test]
    fn always_accepting_adopts_the_constant_target() {
        let target = ShapeParams::Ellipsoid { a: 1.0, b: 0.5, c: 0.5 };
        let mover = ShapeMove::Constant(ConstantMove::new(target.clone()));
        let mut updater = ShapeUpdater::new(mover, vec![cube(1.0), cube(2.0)], 3, Box::new(|_| 0.0));

        assert_eq!(updater.sweep(0).unwrap(), 2);
        assert!(updater.shapes().iter().all(|s| *s == target));
        assert_eq!(updater.counts().ratio(1), Some(1.0));
    }

    #[test]
    fn rejected_trials_leave_shapes_untouched() {
        let mover = ShapeMove::Generalized(GeneralizedMove::new(1, 0.1, 1.0, 1.0));
        let mut updater =
            ShapeUpdater::new(mover, vec![cube(1.0)], 5, Box::new(|_| f64::NEG_INFINITY));
        let counts = updater
            .run(0, 10, &ProgressReporter::silent())
            .unwrap()
            .clone();

        assert_eq!(counts.total, vec![10]);
        assert_eq!(counts.accepted, vec![0]);
        assert_eq!(updater.shapes()[0], cube(1.0));
    }

    #[test]
    fn acceptance_function_sees_both_determinants() {
        let target = cube(2.0);
        let mover = ShapeMove::Constant(ConstantMove::new(target.clone()));
        let seen = std::sync::Mutex::new(None);
        {
            let mut updater = ShapeUpdater::new(
                mover,
                vec![cube(1.0)],
                9,
                Box::new(|trial| {
                    *seen.lock().unwrap() =
                        Some((trial.current_determinant, trial.proposed_determinant));
                    // Favor smaller moments of inertia.
                    (trial.current_determinant / trial.proposed_determinant).ln()
                }),
            );
            updater.sweep(0).unwrap();
            assert_eq!(updater.counts().total, vec![1]);
        }
        let (current, proposed) = seen.into_inner().unwrap().unwrap();
        assert!((current - cube(1.0).inertia_determinant()).abs() < 1e-12);
        assert!((proposed - target.inertia_determinant()).abs() < 1e-9);
        assert!(proposed > current);
    }
}
