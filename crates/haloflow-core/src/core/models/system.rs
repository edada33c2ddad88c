use super::group::BondedGroups;
use super::particle::ParticleData;
use super::sim_box::SimBox;

/// Everything one rank holds: its particles (local and ghost), the bonded groups that
/// touch them, and the shared global box.
#[derive(Debug, Clone)]
pub struct LocalSystem {
    pub particles: ParticleData,
    pub groups: BondedGroups,
    pub sim_box: SimBox,
}

impl LocalSystem {
    pub fn new(particles: ParticleData, groups: BondedGroups, sim_box: SimBox) -> Self {
        Self {
            particles,
            groups,
            sim_box,
        }
    }

    /// Creates a system without bonded groups.
    pub fn unbonded(particles: ParticleData, sim_box: SimBox) -> Self {
        Self::new(particles, BondedGroups::new(), sim_box)
    }
}
