//! Force evaluation collaborators.
//!
//! A [`ForceCompute`] writes force, torque, virial and potential energy into the locally
//! owned particles using local particles and ghosts. It runs after the communicator has
//! refreshed the ghost halo and before the integrator's second half-step.

use super::models::group::GroupKind;
use super::models::ids::Tag;
use super::models::particle::Particle;
use super::models::system::LocalSystem;
use nalgebra::Vector3;
use thiserror::Error;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ForceError {
    #[error("Bonded term {group} needs particle {tag}, which is neither local nor a ghost")]
    MissingGhost { group: Tag, tag: Tag },

    #[error("Invalid force parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

pub trait ForceCompute: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Adds this term's contributions to the local particles and returns the local share
    /// of the potential energy.
    fn compute(&mut self, system: &mut LocalSystem) -> Result<f64, ForceError>;
}

/// Clears the accumulators of every local particle before a force evaluation.
pub fn reset_forces(system: &mut LocalSystem) {
    system
        .particles
        .local_mut()
        .iter_mut()
        .for_each(Particle::reset_accumulators);
}

/// Evaluates every term in order and returns the summed local potential energy.
pub fn compute_all(
    terms: &mut [Box<dyn ForceCompute>],
    system: &mut LocalSystem,
) -> Result<f64, ForceError> {
    reset_forces(system);
    let mut energy = 0.0;
    for term in terms.iter_mut() {
        energy += term.compute(system)?;
    }
    Ok(energy)
}

/// A term that contributes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoForce;

impl ForceCompute for NoForce {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compute(&mut self, _system: &mut LocalSystem) -> Result<f64, ForceError> {
        Ok(0.0)
    }
}

/// Harmonic bonds `U = k/2 (r - r0)²` over the bond table.
///
/// Each rank evaluates every bond with at least one local member and applies the force to
/// its local members only, so a bond split across ranks is evaluated on both sides with
/// its energy and virial shared half and half. The partner must be available as a ghost.
#[derive(Debug, Clone, Copy)]
pub struct HarmonicBonds {
    pub k: f64,
    pub r0: f64,
}

impl HarmonicBonds {
    pub fn new(k: f64, r0: f64) -> Result<Self, ForceError> {
        if k < 0.0 {
            return Err(ForceError::InvalidParameter {
                name: "k",
                reason: format!("spring constant must be non-negative, got {}", k),
            });
        }
        Ok(Self { k, r0 })
    }
}

impl ForceCompute for HarmonicBonds {
    fn name(&self) -> &'static str {
        "harmonic_bonds"
    }

    fn compute(&mut self, system: &mut LocalSystem) -> Result<f64, ForceError> {
        let mut energy = 0.0;
        let mut updates: Vec<(usize, Vector3<f64>, Vector3<f64>, f64)> = Vec::new();

        let particles = &system.particles;
        for (_, entry) in system.groups.table(GroupKind::Bond).iter() {
            let (a, b) = (entry.record.members[0], entry.record.members[1]);
            let ia = particles.index_of(a).ok_or(ForceError::MissingGhost {
                group: entry.record.tag,
                tag: a,
            })?;
            let ib = particles.index_of(b).ok_or(ForceError::MissingGhost {
                group: entry.record.tag,
                tag: b,
            })?;
            let (pa, pb) = (&particles.all()[ia], &particles.all()[ib]);
            let d = system.sim_box.min_image(pa.position - pb.position);
            let r = d.norm();
            if r == 0.0 {
                continue;
            }
            let stretch = r - self.r0;
            let pair_energy = 0.5 * self.k * stretch * stretch;
            // Force on `a`; `b` feels the opposite.
            let f = d * (-self.k * stretch / r);
            let virial = d.component_mul(&f) * 0.5;

            for (idx, sign) in [(ia, 1.0), (ib, -1.0)] {
                if idx < particles.n_local() {
                    updates.push((idx, f * sign, virial, 0.5 * pair_energy));
                    energy += 0.5 * pair_energy;
                }
            }
        }

        let local = system.particles.local_mut();
        for (idx, force, virial, e) in updates {
            local[idx].force += force;
            local[idx].virial += virial;
            local[idx].potential_energy += e;
        }
        Ok(energy)
    }
}

/// Purely repulsive soft spheres, `U = ε (1 - r/r_c)²` for `r < r_c`.
///
/// Pairs are found by a direct scan over local particles and ghosts. Torques are not
/// generated.
#[derive(Debug, Clone, Copy)]
pub struct SoftRepulsion {
    pub epsilon: f64,
    pub cutoff: f64,
}

impl SoftRepulsion {
    pub fn new(epsilon: f64, cutoff: f64) -> Result<Self, ForceError> {
        if cutoff <= 0.0 {
            return Err(ForceError::InvalidParameter {
                name: "cutoff",
                reason: format!("cutoff must be positive, got {}", cutoff),
            });
        }
        Ok(Self { epsilon, cutoff })
    }

    fn accumulate(&self, i: usize, system: &LocalSystem) -> (Vector3<f64>, Vector3<f64>, f64) {
        let all = system.particles.all();
        let pi = &all[i];
        let rc2 = self.cutoff * self.cutoff;
        let mut force = Vector3::zeros();
        let mut virial = Vector3::zeros();
        let mut energy = 0.0;
        for (j, pj) in all.iter().enumerate() {
            if j == i || pj.tag == pi.tag {
                continue;
            }
            let d = system.sim_box.min_image(pi.position - pj.position);
            let r2 = d.norm_squared();
            if r2 >= rc2 || r2 == 0.0 {
                continue;
            }
            let r = r2.sqrt();
            let x = 1.0 - r / self.cutoff;
            let f = d * (2.0 * self.epsilon * x / (self.cutoff * r));
            force += f;
            virial += d.component_mul(&f) * 0.5;
            energy += 0.5 * self.epsilon * x * x;
        }
        (force, virial, energy)
    }
}

impl ForceCompute for SoftRepulsion {
    fn name(&self) -> &'static str {
        "soft_repulsion"
    }

    fn compute(&mut self, system: &mut LocalSystem) -> Result<f64, ForceError> {
        let n_local = system.particles.n_local();
        let shared: &LocalSystem = system;

        #[cfg(not(feature = "parallel"))]
        let contributions: Vec<_> = (0..n_local).map(|i| self.accumulate(i, shared)).collect();

        #[cfg(feature = "parallel")]
        let contributions: Vec<_> = (0..n_local)
            .into_par_iter()
            .map(|i| self.accumulate(i, shared))
            .collect();

        let mut total = 0.0;
        for (p, (force, virial, energy)) in system
            .particles
            .local_mut()
            .iter_mut()
            .zip(contributions)
        {
            p.force += force;
            p.virial += virial;
            p.potential_energy += energy;
            total += energy;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::group::{BondedGroups, GroupRecord};
    use crate::core::models::particle::ParticleData;
    use crate::core::models::sim_box::SimBox;
    use nalgebra::Point3;

    fn pair_system(separation: f64) -> LocalSystem {
        let particles = ParticleData::with_local(
            2,
            vec![
                Particle::new(0, Point3::new(0.0, 0.0, 0.0)),
                Particle::new(1, Point3::new(separation, 0.0, 0.0)),
            ],
        )
        .unwrap();
        let mut groups = BondedGroups::new();
        groups
            .table_mut(GroupKind::Bond)
            .insert(GroupRecord::new(0, 0, &[0, 1], 0))
            .unwrap();
        LocalSystem::new(particles, groups, SimBox::cubic(20.0))
    }

    #[test]
    fn harmonic_bond_pulls_stretched_pair_together() {
        let mut system = pair_system(1.5);
        let mut terms: Vec<Box<dyn ForceCompute>> =
            vec![Box::new(HarmonicBonds::new(10.0, 1.0).unwrap())];
        let energy = compute_all(&mut terms, &mut system).unwrap();
        assert!((energy - 0.5 * 10.0 * 0.25).abs() < 1e-12);
        let local = system.particles.local();
        assert!((local[0].force.x - 5.0).abs() < 1e-12);
        assert!((local[1].force.x + 5.0).abs() < 1e-12);
        assert!((local[0].force + local[1].force).norm() < 1e-12);
    }

    #[test]
    fn harmonic_bond_without_partner_reports_missing_ghost() {
        let particles =
            ParticleData::with_local(2, vec![Particle::new(0, Point3::origin())]).unwrap();
        let mut groups = BondedGroups::new();
        groups
            .table_mut(GroupKind::Bond)
            .insert(GroupRecord::new(7, 0, &[0, 1], 0))
            .unwrap();
        let mut system = LocalSystem::new(particles, groups, SimBox::cubic(20.0));
        let result = HarmonicBonds::new(1.0, 1.0).unwrap().compute(&mut system);
        assert_eq!(result, Err(ForceError::MissingGhost { group: 7, tag: 1 }));
    }

    #[test]
    fn soft_repulsion_pushes_overlapping_pair_apart() {
        let mut system = pair_system(0.5);
        let mut soft = SoftRepulsion::new(2.0, 1.0).unwrap();
        let energy = soft.compute(&mut system).unwrap();
        assert!((energy - 2.0 * 0.25).abs() < 1e-12);
        let local = system.particles.local();
        assert!(local[0].force.x < 0.0);
        assert!(local[1].force.x > 0.0);
        assert!((local[0].force.x + 2.0).abs() < 1e-12);
    }

    #[test]
    fn soft_repulsion_ignores_pairs_beyond_cutoff() {
        let mut system = pair_system(1.5);
        let energy = SoftRepulsion::new(1.0, 1.0).unwrap().compute(&mut system).unwrap();
        assert_eq!(energy, 0.0);
    }
}
